//! Region file format storing the 8x8x8 chunks of a region inside a single
//! `.fhr` file. The first four sectors hold two shadow-paged copies of the
//! metadata (file header, sector allocation bitmap and chunk offset table);
//! every update writes the inactive copy and flips to it only once it is on
//! stable storage, so one consistent copy survives any crash.
//!
//! Being generic over the [`Volume`] allows the tests to run against an
//! in-memory volume, including crash simulations.

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

use crate::chunk::{Chunk, RegionCoord, BLOCKS_PER_CHUNK, CHUNKS_PER_REGION};
use crate::codec::{self, CodecError, MAX_ENCODED_SIZE};
use crate::compress::{self, CompressionAlgo, CompressionError};
use crate::io::{FileVolume, Volume};
use crate::sector::{self, SectorAllocator, HEADER_SECTORS, SECTOR_SIZE};


/// Magic bytes at the start of every meta page.
pub const REGION_MAGIC: [u8; 4] = *b"FHR\x01";
/// On-disk format version.
pub const FORMAT_VERSION: u16 = 2;
/// Size of the serialized file header within a meta page.
pub const FILE_HEADER_SIZE: usize = 32;
/// Offset of the CRC32 within a meta page, covering every byte before it.
pub const META_CRC_OFFSET: usize = 0xFFC;
/// Total size of the shadow-paged header area.
pub const HEADER_BYTES: u64 = HEADER_SECTORS as u64 * SECTOR_SIZE as u64;


/// Error type used for every region file operation.
#[derive(thiserror::Error, Debug)]
pub enum RegionError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("invalid region file magic")]
    InvalidMagic,
    #[error("unsupported region file format version: {0}")]
    InvalidVersion(u16),
    #[error("neither shadow slot holds a valid header")]
    CorruptHeader,
    #[error("no free space available")]
    OutOfSpace,
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("compression: {0}")]
    Compression(#[from] CompressionError),
}


/// The two shadow slots of the header area. Commits always target the slot
/// that is not currently active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    A,
    B,
}

impl Slot {

    fn other(self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    fn meta_offset(self) -> u64 {
        match self {
            Slot::A => 0,
            Slot::B => 2 * SECTOR_SIZE as u64,
        }
    }

    fn cot_offset(self) -> u64 {
        self.meta_offset() + SECTOR_SIZE as u64
    }

}


/// The fixed-size header stored at the start of each meta page.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub lod: u8,
    pub default_compression: u8,
    pub rx: i32,
    pub ry: i32,
    pub rz: i32,
    pub creation_timestamp: u32,
    pub total_sectors: u32,
    pub generation: u32,
}

impl FileHeader {

    fn write(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&REGION_MAGIC);
        LittleEndian::write_u16(&mut buf[4..6], FORMAT_VERSION);
        buf[6] = self.lod;
        buf[7] = self.default_compression;
        LittleEndian::write_i32(&mut buf[8..12], self.rx);
        LittleEndian::write_i32(&mut buf[12..16], self.ry);
        LittleEndian::write_i32(&mut buf[16..20], self.rz);
        LittleEndian::write_u32(&mut buf[20..24], self.creation_timestamp);
        LittleEndian::write_u32(&mut buf[24..28], self.total_sectors);
        LittleEndian::write_u32(&mut buf[28..32], self.generation);
    }

    fn read(buf: &[u8]) -> Result<Self, RegionError> {
        if buf[0..4] != REGION_MAGIC {
            return Err(RegionError::InvalidMagic);
        }
        let version = LittleEndian::read_u16(&buf[4..6]);
        if version != FORMAT_VERSION {
            return Err(RegionError::InvalidVersion(version));
        }
        Ok(Self {
            lod: buf[6],
            default_compression: buf[7],
            rx: LittleEndian::read_i32(&buf[8..12]),
            ry: LittleEndian::read_i32(&buf[12..16]),
            rz: LittleEndian::read_i32(&buf[16..20]),
            creation_timestamp: LittleEndian::read_u32(&buf[20..24]),
            total_sectors: LittleEndian::read_u32(&buf[24..28]),
            generation: LittleEndian::read_u32(&buf[28..32]),
        })
    }

}


/// One entry of the chunk offset table, locating a chunk's compressed
/// payload within the file. Packed to 64 bits on disk as
/// `sector_offset:24 | sector_count:8 | compressed_size:24 | compression:4 |
/// flags:4`. A zero sector offset denotes an absent chunk, sector zero
/// always belongs to the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkOffsetEntry {
    pub sector_offset: u32,
    pub sector_count: u8,
    pub compressed_size: u32,
    pub compression: u8,
    pub flags: u8,
}

impl ChunkOffsetEntry {

    pub const EMPTY: Self = Self {
        sector_offset: 0,
        sector_count: 0,
        compressed_size: 0,
        compression: 0,
        flags: 0,
    };

    #[inline]
    pub fn is_present(self) -> bool {
        self.sector_offset != 0
    }

    pub fn pack(self) -> u64 {
        (self.sector_offset as u64 & 0xFFFFFF)
            | ((self.sector_count as u64) << 24)
            | ((self.compressed_size as u64 & 0xFFFFFF) << 32)
            | ((self.compression as u64 & 0xF) << 56)
            | ((self.flags as u64 & 0xF) << 60)
    }

    pub fn unpack(raw: u64) -> Self {
        Self {
            sector_offset: (raw & 0xFFFFFF) as u32,
            sector_count: ((raw >> 24) & 0xFF) as u8,
            compressed_size: ((raw >> 32) & 0xFFFFFF) as u32,
            compression: ((raw >> 56) & 0xF) as u8,
            flags: ((raw >> 60) & 0xF) as u8,
        }
    }

}


/// A chunk payload encoded and compressed ahead of a region write, so that
/// no CPU-heavy work happens while the region's write lock is held.
pub struct PreparedChunk {
    /// Index of the chunk within the region's offset table.
    pub index: usize,
    /// Algorithm `data` is compressed with.
    pub compression: CompressionAlgo,
    /// Compressed frame bytes.
    pub data: Vec<u8>,
}

impl PreparedChunk {

    /// Encode and compress the given block array.
    pub fn new(index: usize, chunk: &Chunk, algo: CompressionAlgo) -> Result<Self, RegionError> {
        let mut frame = Vec::with_capacity(MAX_ENCODED_SIZE);
        codec::encode(&chunk.block, &mut frame);
        let mut data = vec![0u8; compress::compress_bound(algo, frame.len())];
        let written = compress::compress(algo, &frame, &mut data)?;
        data.truncate(written);
        Ok(Self { index, compression: algo, data })
    }

}


/// A handle to a single region file.
pub struct RegionFile<V: Volume> {
    /// Underlying storage volume.
    volume: V,
    /// Coordinate this region was opened for.
    coord: RegionCoord,
    /// Header of the active slot, kept in sync with the in-memory state.
    header: FileHeader,
    /// The chunk offset table of the active slot.
    cot: Box<[ChunkOffsetEntry; CHUNKS_PER_REGION]>,
    /// Sector allocator mirroring the offset table.
    allocator: SectorAllocator,
    /// The slot whose metadata is currently authoritative on disk. Commits
    /// write the other one and flip.
    active_slot: Slot,
}

impl RegionFile<FileVolume> {

    /// Open a region file on disk, creating and initializing it when
    /// `create` is set. The parent directories are created on demand.
    pub fn open(
        path: &Path,
        coord: RegionCoord,
        default_compression: CompressionAlgo,
        create: bool,
    ) -> Result<Self, RegionError> {

        if create {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = File::options()
            .read(true)
            .write(true)
            .create(create)
            .open(path)?;

        Self::new(FileVolume::new(file), coord, default_compression, create)

    }

}

impl<V: Volume> RegionFile<V> {

    /// Create a region file around an existing volume. An empty volume is
    /// initialized when `create` is set; otherwise the shadow slots are
    /// validated and the most recent consistent one is recovered.
    pub fn new(
        volume: V,
        coord: RegionCoord,
        default_compression: CompressionAlgo,
        create: bool,
    ) -> Result<Self, RegionError> {

        let len = volume.len()?;

        if len == 0 {
            if create {
                return Self::init_empty(volume, coord, default_compression);
            }
            return Err(RegionError::CorruptHeader);
        }

        if len < HEADER_BYTES {
            return Err(RegionError::CorruptHeader);
        }

        Self::recover(volume, coord)

    }

    fn init_empty(
        volume: V,
        coord: RegionCoord,
        default_compression: CompressionAlgo,
    ) -> Result<Self, RegionError> {

        let header = FileHeader {
            lod: coord.lod,
            default_compression: default_compression.id(),
            rx: coord.rx,
            ry: coord.ry,
            rz: coord.rz,
            creation_timestamp: unix_timestamp(),
            total_sectors: HEADER_SECTORS,
            generation: 0,
        };

        // Treating slot B as active makes the first commit land in slot A,
        // and an open of a fresh file (generation tie) selects A as well.
        let mut region = Self {
            volume,
            coord,
            header,
            cot: Box::new([ChunkOffsetEntry::EMPTY; CHUNKS_PER_REGION]),
            allocator: SectorAllocator::new(),
            active_slot: Slot::B,
        };

        for slot in [Slot::A, Slot::B] {
            region.volume.write_all_at(&region.build_cot_page(), slot.cot_offset())?;
            region.volume.write_all_at(&region.build_meta_page(), slot.meta_offset())?;
        }
        region.volume.sync()?;

        Ok(region)

    }

    fn recover(volume: V, coord: RegionCoord) -> Result<Self, RegionError> {

        let mut meta_a = vec![0u8; SECTOR_SIZE];
        let mut meta_b = vec![0u8; SECTOR_SIZE];
        volume.read_exact_at(&mut meta_a, Slot::A.meta_offset())?;
        volume.read_exact_at(&mut meta_b, Slot::B.meta_offset())?;

        let header_a = parse_meta_page(&meta_a);
        let header_b = parse_meta_page(&meta_b);

        let (slot, header) = match (header_a, header_b) {
            (Ok(a), Ok(b)) => {
                // Both slots are consistent, the higher generation is the
                // most recent commit; a tie happens only on a fresh file.
                if b.generation > a.generation {
                    (Slot::B, b)
                } else {
                    (Slot::A, a)
                }
            }
            (Ok(a), Err(_)) => (Slot::A, a),
            (Err(_), Ok(b)) => (Slot::B, b),
            (Err(err_a), Err(err_b)) => {
                // Prefer reporting a format mismatch over a torn page.
                for err in [err_a, err_b] {
                    if matches!(err, RegionError::InvalidMagic | RegionError::InvalidVersion(_)) {
                        return Err(err);
                    }
                }
                return Err(RegionError::CorruptHeader);
            }
        };

        if (header.rx, header.ry, header.rz, header.lod)
            != (coord.rx, coord.ry, coord.rz, coord.lod)
        {
            warn!(
                "region {coord:?} header claims ({}, {}, {}, lod {})",
                header.rx, header.ry, header.rz, header.lod,
            );
        }

        let mut cot_page = vec![0u8; SECTOR_SIZE];
        volume.read_exact_at(&mut cot_page, slot.cot_offset())?;
        let mut cot = Box::new([ChunkOffsetEntry::EMPTY; CHUNKS_PER_REGION]);
        for (i, entry) in cot.iter_mut().enumerate() {
            *entry = ChunkOffsetEntry::unpack(LittleEndian::read_u64(&cot_page[i * 8..i * 8 + 8]));
        }

        // The offset table is authoritative, the stored bitmap is discarded
        // and rebuilt from it.
        let allocator = SectorAllocator::rebuild_from_cot(&cot[..]);

        let mut header = header;
        header.total_sectors = allocator.total_sectors();

        Ok(Self {
            volume,
            coord,
            header,
            cot,
            allocator,
            active_slot: slot,
        })

    }

    /// Coordinate this region was opened for.
    #[inline]
    pub fn coord(&self) -> RegionCoord {
        self.coord
    }

    /// Generation of the last committed header.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.header.generation
    }

    /// Default compression algorithm recorded in the file header.
    pub fn default_compression(&self) -> CompressionAlgo {
        CompressionAlgo::from_id(self.header.default_compression).unwrap_or_default()
    }

    /// Whether the chunk at the given table index has a stored payload.
    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        self.cot[index].is_present()
    }

    /// The offset table entry for the given index.
    #[inline]
    pub fn entry(&self, index: usize) -> ChunkOffsetEntry {
        self.cot[index]
    }

    /// Read and decode the chunk at the given table index, `None` when no
    /// payload is stored for it. Takes a shared reference: reads only touch
    /// the in-memory table and positional volume reads.
    pub fn read_chunk(&self, index: usize) -> Result<Option<Arc<Chunk>>, RegionError> {

        let entry = self.cot[index];
        if !entry.is_present() {
            return Ok(None);
        }

        let algo = CompressionAlgo::from_id(entry.compression)
            .ok_or(CompressionError::UnsupportedAlgorithm)?;

        let mut compressed = vec![0u8; entry.compressed_size as usize];
        self.volume.read_exact_at(&mut compressed, entry.sector_offset as u64 * SECTOR_SIZE as u64)?;

        let mut frame = [0u8; MAX_ENCODED_SIZE];
        let frame_len = compress::decompress(algo, &compressed, &mut frame, MAX_ENCODED_SIZE)?;

        let mut blocks = [0u8; BLOCKS_PER_CHUNK];
        codec::decode(&frame[..frame_len], &mut blocks)?;

        Ok(Some(Chunk::from_blocks(blocks)))

    }

    /// Encode, compress and durably write a single chunk, committing the
    /// header before returning. This is a convenience for callers that do
    /// not already hold the region's write lock; anyone who does must build
    /// the [`PreparedChunk`] first and go through
    /// [`write_prepared_chunk`](Self::write_prepared_chunk) so no encoding
    /// work runs inside the critical section.
    pub fn write_chunk(
        &mut self,
        index: usize,
        chunk: &Chunk,
        algo: CompressionAlgo,
    ) -> Result<(), RegionError> {
        let prepared = PreparedChunk::new(index, chunk, algo)?;
        self.write_prepared_chunk(&prepared)
    }

    /// Durably write a single pre-encoded, pre-compressed chunk, committing
    /// the header before returning. Unlike
    /// [`write_prepared`](Self::write_prepared), failures are propagated
    /// instead of skipped. The previous payload sectors, if any, are only
    /// reused after the commit makes the new payload authoritative.
    pub fn write_prepared_chunk(&mut self, prepared: &PreparedChunk) -> Result<(), RegionError> {

        let old = self.write_one(prepared)?;
        if old.is_present() {
            self.allocator.free(old.sector_offset, old.sector_count as u32);
        }

        self.header.generation += 1;
        self.header.total_sectors = self.allocator.total_sectors();
        self.commit()

    }

    /// Write a batch of prepared chunks with a single header commit at the
    /// end. A chunk that fails to write is logged and skipped, except for an
    /// I/O failure which aborts the remainder of the batch. Frees of
    /// replaced payloads are deferred until every new payload is on disk, so
    /// no new payload can reuse a sector still referenced by the last
    /// committed offset table.
    pub fn write_prepared(&mut self, chunks: &[PreparedChunk]) -> Result<usize, RegionError> {

        let mut replaced = Vec::new();
        let mut written = 0usize;
        let mut abort = None;

        for prepared in chunks {
            match self.write_one(prepared) {
                Ok(old) => {
                    if old.is_present() {
                        replaced.push(old);
                    }
                    written += 1;
                }
                Err(err @ RegionError::Io(_)) => {
                    warn!("aborting batch for region {:?}: {err}", self.coord);
                    abort = Some(err);
                    break;
                }
                Err(err) => {
                    warn!("skipping chunk {} in region {:?}: {err}", prepared.index, self.coord);
                }
            }
        }

        for old in replaced {
            self.allocator.free(old.sector_offset, old.sector_count as u32);
        }

        if written > 0 {
            self.header.generation += 1;
            self.header.total_sectors = self.allocator.total_sectors();
            self.commit()?;
        }

        match abort {
            Some(err) => Err(err),
            None => Ok(written),
        }

    }

    /// Write one prepared payload into freshly allocated sectors and update
    /// the in-memory offset table, returning the replaced entry. The caller
    /// frees the replaced sectors and commits.
    fn write_one(&mut self, prepared: &PreparedChunk) -> Result<ChunkOffsetEntry, RegionError> {

        let data = &prepared.data;
        let count = sector::sectors_needed(data.len());
        if count > u8::MAX as u32 {
            return Err(RegionError::OutOfSpace);
        }

        let offset = match self.allocator.allocate(count as u8) {
            Some(offset) => offset,
            None => return Err(RegionError::OutOfSpace),
        };

        // Pad the run to whole sectors so stale bytes never linger past the
        // payload.
        let mut sectors = vec![0u8; count as usize * SECTOR_SIZE];
        sectors[..data.len()].copy_from_slice(data);

        if let Err(err) = self.volume.write_all_at(&sectors, offset as u64 * SECTOR_SIZE as u64) {
            self.allocator.free(offset, count);
            return Err(err.into());
        }

        let old = self.cot[prepared.index];
        self.cot[prepared.index] = ChunkOffsetEntry {
            sector_offset: offset,
            sector_count: count as u8,
            compressed_size: data.len() as u32,
            compression: prepared.compression.id(),
            flags: 0,
        };

        Ok(old)

    }

    /// Commit the in-memory metadata to the inactive shadow slot and flip.
    /// The offset table goes first, then the meta page; each is synced
    /// before the next write so the meta page is the atomic commit point.
    fn commit(&mut self) -> Result<(), RegionError> {

        let target = self.active_slot.other();

        self.volume.write_all_at(&self.build_cot_page(), target.cot_offset())?;
        self.volume.sync()?;

        self.volume.write_all_at(&self.build_meta_page(), target.meta_offset())?;
        self.volume.sync()?;

        self.active_slot = target;
        Ok(())

    }

    fn build_meta_page(&self) -> Vec<u8> {
        let mut page = vec![0u8; SECTOR_SIZE];
        self.header.write(&mut page[..FILE_HEADER_SIZE]);
        page[FILE_HEADER_SIZE..META_CRC_OFFSET].copy_from_slice(self.allocator.bitmap());
        let crc = crc32fast::hash(&page[..META_CRC_OFFSET]);
        LittleEndian::write_u32(&mut page[META_CRC_OFFSET..], crc);
        page
    }

    fn build_cot_page(&self) -> Vec<u8> {
        let mut page = vec![0u8; SECTOR_SIZE];
        for (i, entry) in self.cot.iter().enumerate() {
            LittleEndian::write_u64(&mut page[i * 8..i * 8 + 8], entry.pack());
        }
        page
    }

    /// Flush the underlying volume to stable storage.
    pub fn sync(&self) -> Result<(), RegionError> {
        self.volume.sync()?;
        Ok(())
    }

    /// Consume this handle and return the underlying volume.
    pub fn into_volume(self) -> V {
        self.volume
    }

}


fn parse_meta_page(page: &[u8]) -> Result<FileHeader, RegionError> {
    let stored = LittleEndian::read_u32(&page[META_CRC_OFFSET..]);
    if crc32fast::hash(&page[..META_CRC_OFFSET]) != stored {
        return Err(RegionError::CorruptHeader);
    }
    FileHeader::read(page)
}

fn unix_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}


#[cfg(test)]
mod tests {

    use crate::io::MemVolume;

    use super::*;

    const COORD: RegionCoord = RegionCoord::new(0, 0, 0, 0);

    fn chunk_of(block: u8) -> Arc<Chunk> {
        Chunk::new_filled(block)
    }

    fn new_region() -> RegionFile<MemVolume> {
        RegionFile::new(MemVolume::new(), COORD, CompressionAlgo::None, true).unwrap()
    }

    #[test]
    fn create_initializes_both_slots() {
        let region = new_region();
        let bytes = region.into_volume().into_bytes();
        assert_eq!(bytes.len() as u64, HEADER_BYTES);
        assert!(parse_meta_page(&bytes[..SECTOR_SIZE]).is_ok());
        assert!(parse_meta_page(&bytes[2 * SECTOR_SIZE..3 * SECTOR_SIZE]).is_ok());
    }

    #[test]
    fn single_block_entry_layout() {
        let mut region = new_region();
        region.write_chunk(0, &chunk_of(4), CompressionAlgo::None).unwrap();
        let entry = region.entry(0);
        // A uniform chunk encodes to a 5-byte frame stored uncompressed.
        assert_eq!(entry.compressed_size, 5);
        assert_eq!(entry.sector_count, 1);
        assert_eq!(entry.sector_offset, 4);
        assert_eq!(entry.compression, CompressionAlgo::None.id());
        assert_eq!(region.generation(), 1);
    }

    #[test]
    fn write_read_roundtrip() {
        let mut region = new_region();
        let mut blocks = [0u8; BLOCKS_PER_CHUNK];
        for (i, b) in blocks.iter_mut().enumerate() {
            *b = (i % 11) as u8;
        }
        let chunk = Chunk::from_blocks(blocks);
        region.write_chunk(42, &chunk, CompressionAlgo::Deflate).unwrap();
        let read = region.read_chunk(42).unwrap().unwrap();
        assert_eq!(read.block, blocks);
        assert!(region.read_chunk(43).unwrap().is_none());
    }

    #[test]
    fn reopen_roundtrip() {
        let mut region = new_region();
        region.write_chunk(7, &chunk_of(9), CompressionAlgo::Deflate).unwrap();
        let volume = region.into_volume();
        let region = RegionFile::new(volume, COORD, CompressionAlgo::None, false).unwrap();
        assert_eq!(region.generation(), 1);
        assert_eq!(region.read_chunk(7).unwrap().unwrap().block[0], 9);
        // The rebuilt allocator accounts for the stored payload.
        assert!(region.allocator.is_allocated(region.entry(7).sector_offset));
    }

    #[test]
    fn overwrite_frees_previous_sectors() {
        let mut region = new_region();
        region.write_chunk(0, &chunk_of(1), CompressionAlgo::None).unwrap();
        let first = region.entry(0);
        region.write_chunk(0, &chunk_of(2), CompressionAlgo::None).unwrap();
        let second = region.entry(0);
        assert_ne!(first.sector_offset, second.sector_offset);
        assert!(!region.allocator.is_allocated(first.sector_offset));
        assert_eq!(region.generation(), 2);
        // The freed run is reused by the next write.
        region.write_chunk(1, &chunk_of(3), CompressionAlgo::None).unwrap();
        assert_eq!(region.entry(1).sector_offset, first.sector_offset);
    }

    #[test]
    fn batch_commits_once() {
        let mut region = new_region();
        let chunks: Vec<PreparedChunk> = (0..3)
            .map(|i| PreparedChunk::new(i, &chunk_of(i as u8 + 1), CompressionAlgo::None).unwrap())
            .collect();
        let written = region.write_prepared(&chunks).unwrap();
        assert_eq!(written, 3);
        assert_eq!(region.generation(), 1);
        for i in 0..3usize {
            assert_eq!(region.read_chunk(i).unwrap().unwrap().block[0], i as u8 + 1);
        }
    }

    #[test]
    fn crash_after_cot_before_meta_recovers_previous_commit() {

        let mut region = new_region();
        // First write commits to slot A, second to slot B.
        region.write_chunk(0, &chunk_of(1), CompressionAlgo::None).unwrap();
        region.write_chunk(0, &chunk_of(2), CompressionAlgo::None).unwrap();
        assert_eq!(region.active_slot, Slot::B);
        assert_eq!(region.generation(), 2);

        // Simulate a crash in a third write that tore meta-B after COT-B had
        // been written: slot B's meta page no longer passes its CRC.
        let volume = region.into_volume();
        volume.write_all_at(&[0xDE, 0xAD], Slot::B.meta_offset() + 28).unwrap();

        let region = RegionFile::new(volume, COORD, CompressionAlgo::None, false).unwrap();
        assert_eq!(region.active_slot, Slot::A);
        assert_eq!(region.generation(), 1);
        assert_eq!(region.read_chunk(0).unwrap().unwrap().block[0], 1);

    }

    #[test]
    fn higher_generation_slot_wins() {
        let mut region = new_region();
        region.write_chunk(0, &chunk_of(1), CompressionAlgo::None).unwrap();
        region.write_chunk(0, &chunk_of(2), CompressionAlgo::None).unwrap();
        region.write_chunk(0, &chunk_of(3), CompressionAlgo::None).unwrap();
        let volume = region.into_volume();
        let region = RegionFile::new(volume, COORD, CompressionAlgo::None, false).unwrap();
        assert_eq!(region.generation(), 3);
        assert_eq!(region.read_chunk(0).unwrap().unwrap().block[0], 3);
    }

    #[test]
    fn both_slots_corrupt_is_an_error() {
        let region = new_region();
        let volume = region.into_volume();
        volume.write_all_at(&[0xFF], Slot::A.meta_offset() + 40).unwrap();
        volume.write_all_at(&[0xFF], Slot::B.meta_offset() + 40).unwrap();
        match RegionFile::new(volume, COORD, CompressionAlgo::None, false) {
            Err(RegionError::CorruptHeader) => {}
            other => panic!("expected corrupt header, got {:?}", other.err()),
        }
    }

    #[test]
    fn garbage_file_is_rejected() {
        let volume = MemVolume::from_bytes(vec![0x42; HEADER_BYTES as usize]);
        match RegionFile::new(volume, COORD, CompressionAlgo::None, false) {
            Err(RegionError::CorruptHeader) => {}
            other => panic!("expected corrupt header, got {:?}", other.err()),
        }
    }

    #[test]
    fn foreign_magic_is_rejected() {
        // A CRC-consistent meta page whose magic is not ours reports the
        // format mismatch rather than a torn page.
        let mut page = vec![0u8; SECTOR_SIZE];
        page[0..4].copy_from_slice(b"MCRG");
        let crc = crc32fast::hash(&page[..META_CRC_OFFSET]);
        LittleEndian::write_u32(&mut page[META_CRC_OFFSET..], crc);
        let mut bytes = vec![0u8; HEADER_BYTES as usize];
        bytes[..SECTOR_SIZE].copy_from_slice(&page);
        bytes[2 * SECTOR_SIZE..3 * SECTOR_SIZE].copy_from_slice(&page);
        let volume = MemVolume::from_bytes(bytes);
        assert!(matches!(
            RegionFile::new(volume, COORD, CompressionAlgo::None, false),
            Err(RegionError::InvalidMagic),
        ));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let volume = MemVolume::from_bytes(vec![0; 1000]);
        assert!(matches!(
            RegionFile::new(volume, COORD, CompressionAlgo::None, false),
            Err(RegionError::CorruptHeader),
        ));
    }

}
