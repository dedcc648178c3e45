//! Chunk block storage and addressing. This module only provides the
//! low-level data structures shared by every storage layer; the engine never
//! interprets block identity, it only moves the raw block bytes around.

use std::sync::Arc;

use glam::IVec3;


/// Chunk size along each axis, in blocks.
pub const CHUNK_WIDTH: usize = 8;
/// Number of blocks stored in a single chunk.
pub const BLOCKS_PER_CHUNK: usize = CHUNK_WIDTH * CHUNK_WIDTH * CHUNK_WIDTH;
/// Region size along each axis, in chunks.
pub const REGION_WIDTH: i32 = 8;
/// Number of chunks stored in a single region file.
pub const CHUNKS_PER_REGION: usize = (REGION_WIDTH * REGION_WIDTH * REGION_WIDTH) as usize;


/// Calculate the index in a chunk's block array for the given position (local
/// or not). Only the first 3 bits of each coordinate component are taken,
/// layout is `yyy zzz xxx`.
#[inline]
fn calc_block_index(pos: IVec3) -> usize {
    let x = pos.x as u32 & 0b111;
    let y = pos.y as u32 & 0b111;
    let z = pos.z as u32 & 0b111;
    ((y << 6) | (z << 3) | x) as usize
}


/// Block data of a single chunk. Blocks are opaque byte identifiers; the
/// storage engine only ever counts distinct values when encoding.
#[derive(Clone)]
pub struct Chunk {
    /// The numeric identifier of each block, indexed by [`calc_block_index`].
    pub block: [u8; BLOCKS_PER_CHUNK],
}

impl Chunk {

    /// Create a new chunk full of zero (air) blocks. The chunk is directly
    /// returned in an atomic reference-counted container so it can be used as
    /// a clone-on-write snapshot (through [`Arc::make_mut`]), which is what
    /// makes zero-copy asynchronous chunk saving possible.
    pub fn new() -> Arc<Self> {
        Self::new_filled(0)
    }

    /// Create a new chunk where every block has the given identifier.
    pub fn new_filled(block: u8) -> Arc<Self> {
        Arc::new(Self { block: [block; BLOCKS_PER_CHUNK] })
    }

    /// Create a chunk from an existing block array.
    pub fn from_blocks(block: [u8; BLOCKS_PER_CHUNK]) -> Arc<Self> {
        Arc::new(Self { block })
    }

    /// Get the block at the given position (rebased to chunk-local).
    #[inline]
    pub fn block(&self, pos: IVec3) -> u8 {
        self.block[calc_block_index(pos)]
    }

    /// Set the block at the given position (rebased to chunk-local).
    #[inline]
    pub fn set_block(&mut self, pos: IVec3, block: u8) {
        self.block[calc_block_index(pos)] = block;
    }

}


/// Internal function to mix a 64-bit value, this is the SplitMix64 finalizer.
/// It is used both by the chunk cache slot hash and to spread region
/// coordinates when clustering batched writes.
#[inline]
pub(crate) fn mix64(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xBF58476D1CE4E5B9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94D049BB133111EB);
    x ^= x >> 31;
    x
}


/// Identifies a chunk in the world: its signed chunk coordinates plus the
/// level of detail the chunk belongs to. Equality and hashing are defined on
/// the packed 64-bit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkKey {
    pub cx: i16,
    pub cy: i16,
    pub cz: i16,
    pub lod: u8,
}

impl ChunkKey {

    pub const fn new(cx: i16, cy: i16, cz: i16, lod: u8) -> Self {
        Self { cx, cy, cz, lod }
    }

    /// Pack this key into 64 bits, `cx:16 | cy:16 | cz:16 | lod:8` from the
    /// low end, upper bits zero.
    #[inline]
    pub fn pack(self) -> u64 {
        (self.cx as u16 as u64)
            | ((self.cy as u16 as u64) << 16)
            | ((self.cz as u16 as u64) << 32)
            | ((self.lod as u64) << 48)
    }

    /// Index of this chunk within its region's chunk offset table, in
    /// `0..512`, computed from the low 3 bits of each axis.
    #[inline]
    pub fn local_index(self) -> usize {
        let lx = (self.cx as u16 & 0b111) as usize;
        let ly = (self.cy as u16 & 0b111) as usize;
        let lz = (self.cz as u16 & 0b111) as usize;
        ly * 64 + lz * 8 + lx
    }

    /// Coordinate of the region file containing this chunk. This must be the
    /// arithmetic floor of the division, not a truncation, so that negative
    /// chunks map to negative regions.
    #[inline]
    pub fn region_coord(self) -> RegionCoord {
        RegionCoord {
            rx: (self.cx as i32).div_euclid(REGION_WIDTH),
            ry: (self.cy as i32).div_euclid(REGION_WIDTH),
            rz: (self.cz as i32).div_euclid(REGION_WIDTH),
            lod: self.lod,
        }
    }

}

impl std::hash::Hash for ChunkKey {

    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(self.pack());
    }

}


/// Coordinate of a region file: region-space position plus level of detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionCoord {
    pub rx: i32,
    pub ry: i32,
    pub rz: i32,
    pub lod: u8,
}

impl RegionCoord {

    pub const fn new(rx: i32, ry: i32, rz: i32, lod: u8) -> Self {
        Self { rx, ry, rz, lod }
    }

    /// A well-mixed 64-bit hash of this coordinate, used to cluster batched
    /// writes of nearby regions without imposing a spatial order.
    #[inline]
    pub fn hash64(self) -> u64 {
        let packed = (self.rx as u32 as u64)
            ^ ((self.ry as u32 as u64) << 21)
            ^ ((self.rz as u32 as u64) << 42)
            ^ ((self.lod as u64) << 56);
        mix64(packed)
    }

    /// File name of this region within its LOD directory.
    pub fn file_name(self) -> String {
        format!("r.{}.{}.{}.fhr", self.rx, self.ry, self.rz)
    }

    /// Name of the LOD directory containing this region's file.
    pub fn lod_dir_name(self) -> String {
        format!("lod{}", self.lod)
    }

}


#[cfg(test)]
mod tests {

    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    use super::*;

    #[test]
    fn block_index_layout() {
        assert_eq!(calc_block_index(IVec3::new(0, 0, 0)), 0);
        assert_eq!(calc_block_index(IVec3::new(1, 0, 0)), 1);
        assert_eq!(calc_block_index(IVec3::new(0, 0, 1)), 8);
        assert_eq!(calc_block_index(IVec3::new(0, 1, 0)), 64);
        assert_eq!(calc_block_index(IVec3::new(7, 7, 7)), BLOCKS_PER_CHUNK - 1);
    }

    #[test]
    fn local_index_matches_block_layout() {
        let key = ChunkKey::new(1, 2, 3, 0);
        assert_eq!(key.local_index(), 2 * 64 + 3 * 8 + 1);
        // Negative coordinates wrap into the local range.
        let key = ChunkKey::new(-1, -1, -1, 0);
        assert_eq!(key.local_index(), 7 * 64 + 7 * 8 + 7);
    }

    #[test]
    fn region_coord_floors() {
        assert_eq!(ChunkKey::new(0, 0, 0, 0).region_coord(), RegionCoord::new(0, 0, 0, 0));
        assert_eq!(ChunkKey::new(7, 7, 7, 0).region_coord(), RegionCoord::new(0, 0, 0, 0));
        assert_eq!(ChunkKey::new(8, 0, 0, 0).region_coord(), RegionCoord::new(1, 0, 0, 0));
        assert_eq!(ChunkKey::new(-1, 0, 0, 0).region_coord(), RegionCoord::new(-1, 0, 0, 0));
        assert_eq!(ChunkKey::new(-8, 0, 0, 0).region_coord(), RegionCoord::new(-1, 0, 0, 0));
        assert_eq!(ChunkKey::new(-9, 0, 0, 0).region_coord(), RegionCoord::new(-2, 0, 0, 0));
    }

    #[test]
    fn key_pack_is_injective_on_lod() {
        let a = ChunkKey::new(1, 2, 3, 0);
        let b = ChunkKey::new(1, 2, 3, 1);
        assert_ne!(a.pack(), b.pack());
        assert_ne!(a, b);
    }

    #[test]
    fn key_hash_uses_packed_value() {
        fn hash_of(key: ChunkKey) -> u64 {
            let mut hasher = DefaultHasher::new();
            key.hash(&mut hasher);
            hasher.finish()
        }
        let key = ChunkKey::new(-5, 12, 7, 2);
        assert_eq!(hash_of(key), hash_of(ChunkKey::new(-5, 12, 7, 2)));
    }

    #[test]
    fn region_file_name() {
        let coord = RegionCoord::new(-1, 0, 12, 3);
        assert_eq!(coord.file_name(), "r.-1.0.12.fhr");
        assert_eq!(coord.lod_dir_name(), "lod3");
    }

}
