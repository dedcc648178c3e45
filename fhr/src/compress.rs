//! Uniform compression facade over the algorithms a region file may store
//! chunks with. All functions are buffer-to-buffer so the I/O workers can
//! reuse scratch buffers sized once with [`compress_bound`].

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};


/// Compression level used by every algorithm. Chunk payloads are small and
/// written often, speed matters more than ratio.
const LEVEL: u32 = 1;

/// Closed set of compression algorithms, identified on disk by the 4-bit
/// `compression` field of a chunk offset entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressionAlgo {
    /// Verbatim copy.
    None = 0,
    /// Raw deflate stream, no zlib wrapper.
    #[default]
    Deflate = 1,
    /// Zstandard, only available with the `zstd` cargo feature.
    Zstd = 2,
}

impl CompressionAlgo {

    /// Algorithm for the given on-disk identifier.
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::None),
            1 => Some(Self::Deflate),
            2 => Some(Self::Zstd),
            _ => None,
        }
    }

    /// On-disk identifier of this algorithm.
    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

}

/// Error type for compression and decompression failures.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CompressionError {
    #[error("compression algorithm not supported by this build")]
    UnsupportedAlgorithm,
    #[error("output buffer too small")]
    OutputTooSmall,
    #[error("compression failed")]
    CompressionFailed,
    #[error("decompression failed")]
    DecompressionFailed,
}


/// Conservative upper bound on the compressed size of `len` input bytes,
/// used to size scratch buffers so a single [`compress`] call never runs out
/// of output space.
pub fn compress_bound(algo: CompressionAlgo, len: usize) -> usize {
    match algo {
        CompressionAlgo::None => len,
        // Deflate worst case is stored blocks: ~5 bytes per 16 KiB plus a
        // small constant, this bound stays comfortably above it.
        CompressionAlgo::Deflate => len + (len >> 7) + 64,
        #[cfg(feature = "zstd")]
        CompressionAlgo::Zstd => zstd::zstd_safe::compress_bound(len),
        #[cfg(not(feature = "zstd"))]
        CompressionAlgo::Zstd => len + (len >> 7) + 64,
    }
}

/// Compress `input` into `output`, returning the number of bytes written.
pub fn compress(
    algo: CompressionAlgo,
    input: &[u8],
    output: &mut [u8],
) -> Result<usize, CompressionError> {
    match algo {
        CompressionAlgo::None => {
            if output.len() < input.len() {
                return Err(CompressionError::OutputTooSmall);
            }
            output[..input.len()].copy_from_slice(input);
            Ok(input.len())
        }
        CompressionAlgo::Deflate => deflate_compress(input, output),
        CompressionAlgo::Zstd => zstd_compress(input, output),
    }
}

/// Decompress `input` into `output`. The caller passes the largest size the
/// decoded payload may have; the slice beyond it is never touched. Returns
/// the number of bytes written.
pub fn decompress(
    algo: CompressionAlgo,
    input: &[u8],
    output: &mut [u8],
    expected_len: usize,
) -> Result<usize, CompressionError> {

    if output.len() < expected_len {
        return Err(CompressionError::OutputTooSmall);
    }
    let output = &mut output[..expected_len];

    match algo {
        CompressionAlgo::None => {
            if output.len() < input.len() {
                return Err(CompressionError::OutputTooSmall);
            }
            output[..input.len()].copy_from_slice(input);
            Ok(input.len())
        }
        CompressionAlgo::Deflate => deflate_decompress(input, output),
        CompressionAlgo::Zstd => zstd_decompress(input, output),
    }

}

fn deflate_compress(input: &[u8], output: &mut [u8]) -> Result<usize, CompressionError> {

    let mut deflate = Compress::new(Compression::new(LEVEL), false);

    loop {

        let before_in = deflate.total_in();
        let before_out = deflate.total_out();

        let status = deflate
            .compress(
                &input[before_in as usize..],
                &mut output[before_out as usize..],
                FlushCompress::Finish,
            )
            .map_err(|_| CompressionError::CompressionFailed)?;

        match status {
            Status::StreamEnd => return Ok(deflate.total_out() as usize),
            Status::BufError => return Err(CompressionError::OutputTooSmall),
            Status::Ok => {
                // No forward progress means the output buffer is exhausted.
                if deflate.total_in() == before_in && deflate.total_out() == before_out {
                    return Err(CompressionError::OutputTooSmall);
                }
            }
        }

    }

}

fn deflate_decompress(input: &[u8], output: &mut [u8]) -> Result<usize, CompressionError> {

    let mut inflate = Decompress::new(false);

    loop {

        let before_in = inflate.total_in();
        let before_out = inflate.total_out();

        let status = inflate
            .decompress(
                &input[before_in as usize..],
                &mut output[before_out as usize..],
                FlushDecompress::Finish,
            )
            .map_err(|_| CompressionError::DecompressionFailed)?;

        match status {
            Status::StreamEnd => return Ok(inflate.total_out() as usize),
            Status::BufError => return Err(CompressionError::DecompressionFailed),
            Status::Ok => {
                if inflate.total_in() == before_in && inflate.total_out() == before_out {
                    return Err(CompressionError::DecompressionFailed);
                }
            }
        }

    }

}

#[cfg(feature = "zstd")]
fn zstd_compress(input: &[u8], output: &mut [u8]) -> Result<usize, CompressionError> {
    zstd::bulk::compress_to_buffer(input, output, LEVEL as i32)
        .map_err(|_| CompressionError::CompressionFailed)
}

#[cfg(feature = "zstd")]
fn zstd_decompress(input: &[u8], output: &mut [u8]) -> Result<usize, CompressionError> {
    zstd::bulk::decompress_to_buffer(input, output)
        .map_err(|_| CompressionError::DecompressionFailed)
}

#[cfg(not(feature = "zstd"))]
fn zstd_compress(_input: &[u8], _output: &mut [u8]) -> Result<usize, CompressionError> {
    Err(CompressionError::UnsupportedAlgorithm)
}

#[cfg(not(feature = "zstd"))]
fn zstd_decompress(_input: &[u8], _output: &mut [u8]) -> Result<usize, CompressionError> {
    Err(CompressionError::UnsupportedAlgorithm)
}


#[cfg(test)]
mod tests {

    use super::*;

    fn sample() -> Vec<u8> {
        (0..2048u32).map(|i| (i % 37) as u8).collect()
    }

    fn roundtrip(algo: CompressionAlgo) {
        let input = sample();
        let mut compressed = vec![0; compress_bound(algo, input.len())];
        let written = compress(algo, &input, &mut compressed).unwrap();
        let mut decompressed = vec![0; input.len()];
        let restored = decompress(algo, &compressed[..written], &mut decompressed, input.len())
            .unwrap();
        assert_eq!(restored, input.len());
        assert_eq!(decompressed, input);
    }

    #[test]
    fn none_roundtrip() {
        roundtrip(CompressionAlgo::None);
    }

    #[test]
    fn deflate_roundtrip() {
        roundtrip(CompressionAlgo::Deflate);
    }

    #[cfg(feature = "zstd")]
    #[test]
    fn zstd_roundtrip() {
        roundtrip(CompressionAlgo::Zstd);
    }

    #[cfg(not(feature = "zstd"))]
    #[test]
    fn zstd_unsupported_without_feature() {
        let mut out = [0; 16];
        assert_eq!(
            compress(CompressionAlgo::Zstd, &[1, 2, 3], &mut out),
            Err(CompressionError::UnsupportedAlgorithm),
        );
    }

    #[test]
    fn none_rejects_small_output() {
        let mut out = [0; 4];
        assert_eq!(
            compress(CompressionAlgo::None, &[0; 8], &mut out),
            Err(CompressionError::OutputTooSmall),
        );
    }

    #[test]
    fn deflate_shrinks_repetitive_input() {
        let input = vec![7u8; 4096];
        let mut out = vec![0; compress_bound(CompressionAlgo::Deflate, input.len())];
        let written = compress(CompressionAlgo::Deflate, &input, &mut out).unwrap();
        assert!(written < input.len());
    }

    #[test]
    fn deflate_rejects_corrupt_input() {
        let mut out = vec![0; 64];
        assert_eq!(
            decompress(CompressionAlgo::Deflate, &[0xFF, 0x00, 0x12], &mut out, 64),
            Err(CompressionError::DecompressionFailed),
        );
    }

    #[test]
    fn bound_covers_incompressible_input() {
        // A short incompressible input must still fit within the bound.
        let input: Vec<u8> = (0..512u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let mut out = vec![0; compress_bound(CompressionAlgo::Deflate, input.len())];
        assert!(compress(CompressionAlgo::Deflate, &input, &mut out).is_ok());
    }

    #[test]
    fn algo_ids_are_stable() {
        assert_eq!(CompressionAlgo::from_id(0), Some(CompressionAlgo::None));
        assert_eq!(CompressionAlgo::from_id(1), Some(CompressionAlgo::Deflate));
        assert_eq!(CompressionAlgo::from_id(2), Some(CompressionAlgo::Zstd));
        assert_eq!(CompressionAlgo::from_id(3), None);
    }

}
