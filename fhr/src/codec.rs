//! Chunk block array codec. A chunk payload starts with a 4-byte frame
//! header followed by one of three bodies: a single block identifier when the
//! chunk is uniform, an 8-bit palette with one index byte per block, or the
//! raw block bytes. The encoder always picks the smallest viable encoding.

use crate::chunk::BLOCKS_PER_CHUNK;


/// Version written in the frame header.
pub const FRAME_VERSION: u8 = 1;
/// Worst-case size of an encoded chunk: frame header, full palette with its
/// length byte, and one index byte per block.
pub const MAX_ENCODED_SIZE: usize = 4 + 1 + 256 + BLOCKS_PER_CHUNK;

/// Body encodings, stored as the second byte of the frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    /// Verbatim block bytes.
    Raw = 0,
    /// Palette of up to 256 block identifiers followed by index bytes.
    Palette8 = 1,
    /// Reserved for wider palettes, never produced and rejected on decode.
    Palette16 = 2,
    /// The whole chunk is a single block identifier.
    SingleBlock = 3,
}

/// Error type for chunk frame decoding.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported frame version: {0}")]
    InvalidFormat(u8),
    #[error("unknown chunk encoding: {0}")]
    UnknownEncoding(u8),
    #[error("palette index {index} out of bounds for palette of {len}")]
    InvalidPalette { index: u8, len: usize },
    #[error("chunk frame truncated: expected {expected} bytes, got {got}")]
    DataTruncated { expected: usize, got: usize },
}


/// Encode a chunk's block array into `out`, clearing it first. The encoding
/// is selected by counting distinct block identifiers: one distinct value
/// encodes as a single block, anything that fits an 8-bit palette encodes as
/// a palette, everything else falls back to the raw bytes.
pub fn encode(blocks: &[u8; BLOCKS_PER_CHUNK], out: &mut Vec<u8>) {

    out.clear();

    // Count distinct block identifiers over a seen table.
    let mut seen = [false; 256];
    let mut distinct = 0usize;
    for &block in blocks.iter() {
        if !seen[block as usize] {
            seen[block as usize] = true;
            distinct += 1;
        }
    }

    if distinct == 1 {
        write_header(out, Encoding::SingleBlock);
        out.push(blocks[0]);
        return;
    }

    if distinct <= 256 {

        write_header(out, Encoding::Palette8);

        // The palette lists identifiers in ascending order; a full 256-entry
        // palette stores its length byte as zero.
        let mut index_of = [0u8; 256];
        out.push(distinct as u8);
        let mut next = 0u8;
        for id in 0..256usize {
            if seen[id] {
                out.push(id as u8);
                index_of[id] = next;
                next = next.wrapping_add(1);
            }
        }

        for &block in blocks.iter() {
            out.push(index_of[block as usize]);
        }

        return;

    }

    // Unreachable while block identifiers are bytes, kept as the documented
    // fallback for wider identifiers.
    write_header(out, Encoding::Raw);
    out.extend_from_slice(blocks);

}

#[inline]
fn write_header(out: &mut Vec<u8>, encoding: Encoding) {
    out.push(FRAME_VERSION);
    out.push(encoding as u8);
    out.push(0);
    out.push(0);
}

/// Decode a chunk frame into the given block array. The frame version, the
/// encoding and every palette index are validated before any block is
/// written.
pub fn decode(data: &[u8], out: &mut [u8; BLOCKS_PER_CHUNK]) -> Result<(), CodecError> {

    if data.len() < 4 {
        return Err(CodecError::DataTruncated { expected: 4, got: data.len() });
    }

    if data[0] != FRAME_VERSION {
        return Err(CodecError::InvalidFormat(data[0]));
    }

    let body = &data[4..];
    match data[1] {
        enc if enc == Encoding::Raw as u8 => {
            if body.len() < BLOCKS_PER_CHUNK {
                return Err(CodecError::DataTruncated {
                    expected: 4 + BLOCKS_PER_CHUNK,
                    got: data.len(),
                });
            }
            out.copy_from_slice(&body[..BLOCKS_PER_CHUNK]);
            Ok(())
        }
        enc if enc == Encoding::Palette8 as u8 => decode_palette8(body, data.len(), out),
        enc if enc == Encoding::SingleBlock as u8 => {
            let &block = body.first().ok_or(CodecError::DataTruncated {
                expected: 5,
                got: data.len(),
            })?;
            out.fill(block);
            Ok(())
        }
        enc => Err(CodecError::UnknownEncoding(enc)),
    }

}

fn decode_palette8(
    body: &[u8],
    frame_len: usize,
    out: &mut [u8; BLOCKS_PER_CHUNK],
) -> Result<(), CodecError> {

    let &len_byte = body.first().ok_or(CodecError::DataTruncated {
        expected: 5,
        got: frame_len,
    })?;

    // A length byte of zero denotes the full 256-entry palette.
    let palette_len = if len_byte == 0 { 256 } else { len_byte as usize };

    let expected = 4 + 1 + palette_len + BLOCKS_PER_CHUNK;
    if frame_len < expected {
        return Err(CodecError::DataTruncated { expected, got: frame_len });
    }

    let palette = &body[1..1 + palette_len];
    let indices = &body[1 + palette_len..1 + palette_len + BLOCKS_PER_CHUNK];

    for (slot, &index) in out.iter_mut().zip(indices) {
        if index as usize >= palette_len {
            return Err(CodecError::InvalidPalette { index, len: palette_len });
        }
        *slot = palette[index as usize];
    }

    Ok(())

}


#[cfg(test)]
mod tests {

    use super::*;

    fn roundtrip(blocks: [u8; BLOCKS_PER_CHUNK]) {
        let mut frame = Vec::new();
        encode(&blocks, &mut frame);
        let mut decoded = [0xAA; BLOCKS_PER_CHUNK];
        decode(&frame, &mut decoded).unwrap();
        assert_eq!(decoded, blocks);
    }

    #[test]
    fn single_block_frame_bytes() {
        // A chunk full of stone (id 4) encodes to exactly five bytes.
        let blocks = [4u8; BLOCKS_PER_CHUNK];
        let mut frame = Vec::new();
        encode(&blocks, &mut frame);
        assert_eq!(frame, [0x01, 0x03, 0x00, 0x00, 0x04]);
    }

    #[test]
    fn single_block_roundtrip() {
        roundtrip([0; BLOCKS_PER_CHUNK]);
        roundtrip([255; BLOCKS_PER_CHUNK]);
    }

    #[test]
    fn palette_roundtrip() {
        let mut blocks = [0u8; BLOCKS_PER_CHUNK];
        for (i, block) in blocks.iter_mut().enumerate() {
            *block = (i % 7) as u8 * 3;
        }
        let mut frame = Vec::new();
        encode(&blocks, &mut frame);
        assert_eq!(frame[1], Encoding::Palette8 as u8);
        // Header, length byte, 7 palette entries, one index per block.
        assert_eq!(frame.len(), 4 + 1 + 7 + BLOCKS_PER_CHUNK);
        roundtrip(blocks);
    }

    #[test]
    fn palette_orders_ids_ascending() {
        let mut blocks = [9u8; BLOCKS_PER_CHUNK];
        blocks[0] = 200;
        blocks[1] = 3;
        let mut frame = Vec::new();
        encode(&blocks, &mut frame);
        assert_eq!(frame[4], 3); // palette length
        assert_eq!(&frame[5..8], &[3, 9, 200]);
    }

    #[test]
    fn full_palette_roundtrip() {
        // Exactly 256 distinct identifiers still encode as a palette, with
        // the length byte wrapped to zero.
        let mut blocks = [0u8; BLOCKS_PER_CHUNK];
        for (i, block) in blocks.iter_mut().enumerate() {
            *block = i as u8;
        }
        let mut frame = Vec::new();
        encode(&blocks, &mut frame);
        assert_eq!(frame[1], Encoding::Palette8 as u8);
        assert_eq!(frame[4], 0);
        roundtrip(blocks);
    }

    #[test]
    fn raw_frame_decodes() {
        let mut frame = vec![FRAME_VERSION, Encoding::Raw as u8, 0, 0];
        frame.extend((0..BLOCKS_PER_CHUNK).map(|i| (i % 251) as u8));
        let mut decoded = [0; BLOCKS_PER_CHUNK];
        decode(&frame, &mut decoded).unwrap();
        assert_eq!(decoded[250], 250);
        assert_eq!(decoded[251], 0);
    }

    #[test]
    fn rejects_bad_version() {
        let frame = [2u8, Encoding::SingleBlock as u8, 0, 0, 1];
        let mut out = [0; BLOCKS_PER_CHUNK];
        assert_eq!(decode(&frame, &mut out), Err(CodecError::InvalidFormat(2)));
    }

    #[test]
    fn rejects_palette16() {
        let frame = [FRAME_VERSION, Encoding::Palette16 as u8, 0, 0, 1];
        let mut out = [0; BLOCKS_PER_CHUNK];
        assert_eq!(decode(&frame, &mut out), Err(CodecError::UnknownEncoding(2)));
    }

    #[test]
    fn rejects_unknown_encoding() {
        let frame = [FRAME_VERSION, 7, 0, 0];
        let mut out = [0; BLOCKS_PER_CHUNK];
        assert_eq!(decode(&frame, &mut out), Err(CodecError::UnknownEncoding(7)));
    }

    #[test]
    fn rejects_truncated_frames() {
        let mut out = [0; BLOCKS_PER_CHUNK];
        assert!(matches!(
            decode(&[FRAME_VERSION, 0], &mut out),
            Err(CodecError::DataTruncated { .. }),
        ));
        assert!(matches!(
            decode(&[FRAME_VERSION, Encoding::SingleBlock as u8, 0, 0], &mut out),
            Err(CodecError::DataTruncated { .. }),
        ));
        // Palette frame cut short of its indices.
        let frame = [FRAME_VERSION, Encoding::Palette8 as u8, 0, 0, 2, 1, 2, 0, 1];
        assert!(matches!(
            decode(&frame, &mut out),
            Err(CodecError::DataTruncated { .. }),
        ));
    }

    #[test]
    fn rejects_out_of_bounds_palette_index() {
        let mut frame = vec![FRAME_VERSION, Encoding::Palette8 as u8, 0, 0, 2, 10, 20];
        frame.extend(std::iter::repeat(0).take(BLOCKS_PER_CHUNK));
        frame[7] = 5; // index 5 into a palette of 2
        let mut out = [0; BLOCKS_PER_CHUNK];
        assert_eq!(
            decode(&frame, &mut out),
            Err(CodecError::InvalidPalette { index: 5, len: 2 }),
        );
    }

}
