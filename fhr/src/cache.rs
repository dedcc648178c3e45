//! In-memory caches sitting between the facade and the region files: a
//! bounded cache of open region handles and an open-addressed cache of
//! decoded chunks. Both use CLOCK second-chance eviction.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use crate::chunk::{mix64, Chunk, ChunkKey, RegionCoord};
use crate::compress::CompressionAlgo;
use crate::io::FileVolume;
use crate::region::{RegionError, RegionFile};


/// Maximum number of region files kept open at once.
pub const REGION_CACHE_CAPACITY: usize = 64;
/// Number of slots of the decoded-chunk cache.
pub const CHUNK_CACHE_CAPACITY: usize = 4096;


/// A shared handle to an open region file. The handle is reference counted:
/// the cache holds one reference and every borrower holds another, so a
/// region is only ever closed once nobody is using it.
pub struct RegionHandle {
    coord: RegionCoord,
    file: RwLock<RegionFile<FileVolume>>,
}

impl RegionHandle {

    #[inline]
    pub fn coord(&self) -> RegionCoord {
        self.coord
    }

    /// The region file, readers share and writers exclude.
    #[inline]
    pub fn file(&self) -> &RwLock<RegionFile<FileVolume>> {
        &self.file
    }

}


struct RegionSlot {
    handle: Arc<RegionHandle>,
    recently_used: bool,
}

struct RegionCacheInner {
    slots: Vec<Option<RegionSlot>>,
    clock_hand: usize,
}

/// Cache of open region file handles, keyed by region coordinate. Opens are
/// serialized through the cache lock so a region is never opened twice.
pub struct RegionCache {
    /// Directory holding the `lod<N>` subdirectories.
    root: PathBuf,
    default_compression: CompressionAlgo,
    inner: Mutex<RegionCacheInner>,
}

impl RegionCache {

    pub fn new(root: PathBuf, default_compression: CompressionAlgo) -> Self {
        Self {
            root,
            default_compression,
            inner: Mutex::new(RegionCacheInner {
                slots: (0..REGION_CACHE_CAPACITY).map(|_| None).collect(),
                clock_hand: 0,
            }),
        }
    }

    /// Path of the region file for the given coordinate.
    pub fn region_path(&self, coord: RegionCoord) -> PathBuf {
        self.root.join(coord.lod_dir_name()).join(coord.file_name())
    }

    /// Get the handle for an existing region, opening its file on a cache
    /// miss. Returns `None` when no region file exists for the coordinate.
    pub fn get(&self, coord: RegionCoord) -> Result<Option<Arc<RegionHandle>>, RegionError> {
        self.get_or_open(coord, false)
    }

    /// Get the handle for a region, creating and initializing its file (and
    /// the LOD directory) when missing.
    pub fn ensure(&self, coord: RegionCoord) -> Result<Arc<RegionHandle>, RegionError> {
        let handle = self.get_or_open(coord, true)?
            .expect("open with create cannot miss");
        Ok(handle)
    }

    /// Get the handle for a region, opening its file on a cache miss. When
    /// `create` is false and the file does not exist, `None` is returned
    /// instead of creating it.
    fn get_or_open(
        &self,
        coord: RegionCoord,
        create: bool,
    ) -> Result<Option<Arc<RegionHandle>>, RegionError> {

        let mut inner = self.inner.lock().unwrap();

        for slot in inner.slots.iter_mut().flatten() {
            if slot.handle.coord == coord {
                slot.recently_used = true;
                return Ok(Some(Arc::clone(&slot.handle)));
            }
        }

        let path = self.region_path(coord);
        let region = match RegionFile::open(&path, coord, self.default_compression, create) {
            Ok(region) => region,
            Err(RegionError::Io(err)) if !create && err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let handle = Arc::new(RegionHandle {
            coord,
            file: RwLock::new(region),
        });

        let victim = Self::find_slot(&mut inner)?;
        if let Some(evicted) = inner.slots[victim].take() {
            debug!("evicting region {:?} from handle cache", evicted.handle.coord);
        }
        inner.slots[victim] = Some(RegionSlot {
            handle: Arc::clone(&handle),
            recently_used: true,
        });

        Ok(Some(handle))

    }

    /// Pick a slot for a new handle: any empty slot, otherwise a CLOCK scan
    /// that skips handles still referenced outside the cache and gives
    /// recently used ones a second chance. The scan is bounded, a cache full
    /// of in-use handles is an out-of-space condition.
    fn find_slot(inner: &mut RegionCacheInner) -> Result<usize, RegionError> {

        if let Some(index) = inner.slots.iter().position(Option::is_none) {
            return Ok(index);
        }

        for _ in 0..2 * REGION_CACHE_CAPACITY {
            let index = inner.clock_hand;
            inner.clock_hand = (inner.clock_hand + 1) % REGION_CACHE_CAPACITY;
            let slot = inner.slots[index].as_mut().expect("cache is full");
            if Arc::strong_count(&slot.handle) > 1 {
                continue;
            }
            if slot.recently_used {
                slot.recently_used = false;
                continue;
            }
            return Ok(index);
        }

        Err(RegionError::OutOfSpace)

    }

    /// Number of regions currently held open by the cache.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush every open region file to stable storage. Failures are logged
    /// and do not prevent the remaining files from being flushed.
    pub fn flush_all(&self) {
        let inner = self.inner.lock().unwrap();
        for slot in inner.slots.iter().flatten() {
            if let Err(err) = slot.handle.file.read().unwrap().sync() {
                warn!("failed to flush region {:?}: {err}", slot.handle.coord);
            }
        }
    }

}


struct ChunkSlot {
    key: ChunkKey,
    chunk: Arc<Chunk>,
    referenced: bool,
}

/// Open-addressed hash table of decoded chunks with linear probing, CLOCK
/// eviction when full and backward-shift deletion, so probe chains stay
/// intact without tombstones.
pub struct ChunkCache {
    slots: Box<[Option<ChunkSlot>]>,
    clock_hand: usize,
    len: usize,
}

impl ChunkCache {

    pub fn new() -> Self {
        Self {
            slots: (0..CHUNK_CACHE_CAPACITY).map(|_| None).collect(),
            clock_hand: 0,
            len: 0,
        }
    }

    /// Natural slot of a key.
    #[inline]
    fn home(key: ChunkKey) -> usize {
        (mix64(key.pack()) % CHUNK_CACHE_CAPACITY as u64) as usize
    }

    /// Look up a chunk; a hit marks the slot recently used.
    pub fn get(&mut self, key: ChunkKey) -> Option<Arc<Chunk>> {
        let home = Self::home(key);
        for i in 0..CHUNK_CACHE_CAPACITY {
            let pos = (home + i) % CHUNK_CACHE_CAPACITY;
            match &mut self.slots[pos] {
                None => return None,
                Some(slot) if slot.key == key => {
                    slot.referenced = true;
                    return Some(Arc::clone(&slot.chunk));
                }
                Some(_) => continue,
            }
        }
        None
    }

    /// Insert or update a chunk. On a key match the slot is updated in
    /// place; otherwise the chunk lands in the first empty slot of its probe
    /// chain, evicting some slot through CLOCK when the table is full.
    pub fn put(&mut self, key: ChunkKey, chunk: Arc<Chunk>) {

        let home = Self::home(key);
        for i in 0..CHUNK_CACHE_CAPACITY {
            let pos = (home + i) % CHUNK_CACHE_CAPACITY;
            match &mut self.slots[pos] {
                None => {
                    self.slots[pos] = Some(ChunkSlot { key, chunk, referenced: true });
                    self.len += 1;
                    return;
                }
                Some(slot) if slot.key == key => {
                    slot.chunk = chunk;
                    slot.referenced = true;
                    return;
                }
                Some(_) => continue,
            }
        }

        // Table full: every slot belongs to the probe chain, so the new
        // entry may replace whichever one the clock picks.
        let victim = self.clock_evict();
        self.slots[victim] = Some(ChunkSlot { key, chunk, referenced: true });

    }

    fn clock_evict(&mut self) -> usize {
        for _ in 0..2 * CHUNK_CACHE_CAPACITY {
            let index = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % CHUNK_CACHE_CAPACITY;
            let slot = self.slots[index].as_mut().expect("eviction on a full table");
            if slot.referenced {
                slot.referenced = false;
            } else {
                return index;
            }
        }
        // Every slot was referenced twice in a row, fall back to the hand.
        let index = self.clock_hand;
        self.clock_hand = (self.clock_hand + 1) % CHUNK_CACHE_CAPACITY;
        index
    }

    /// Remove a chunk from the cache, shifting the following entries of the
    /// probe chain backward so that lookups never terminate early on the
    /// vacated slot. Returns whether the key was present.
    pub fn invalidate(&mut self, key: ChunkKey) -> bool {

        let home = Self::home(key);
        let mut hole = None;
        for i in 0..CHUNK_CACHE_CAPACITY {
            let pos = (home + i) % CHUNK_CACHE_CAPACITY;
            match &self.slots[pos] {
                None => return false,
                Some(slot) if slot.key == key => {
                    hole = Some(pos);
                    break;
                }
                Some(_) => continue,
            }
        }
        let Some(mut hole) = hole else {
            return false;
        };

        let mut pos = hole;
        loop {
            pos = (pos + 1) % CHUNK_CACHE_CAPACITY;
            if pos == hole {
                break;
            }
            let Some(slot) = &self.slots[pos] else {
                break;
            };
            // The entry may fill the hole only if doing so does not move it
            // before its natural slot.
            let slot_home = Self::home(slot.key);
            if !cyclic_in(hole, slot_home, pos) {
                let moved = self.slots[pos].take();
                self.slots[hole] = moved;
                hole = pos;
            }
        }

        self.slots[hole] = None;
        self.len -= 1;
        true

    }

    /// Number of cached chunks.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check the open-addressing invariant: for every occupied slot, the
    /// whole probe range from its natural slot up to it is occupied.
    #[cfg(test)]
    fn check_probe_invariant(&self) {
        for pos in 0..CHUNK_CACHE_CAPACITY {
            let Some(slot) = &self.slots[pos] else {
                continue;
            };
            let mut probe = Self::home(slot.key);
            while probe != pos {
                assert!(
                    self.slots[probe].is_some(),
                    "hole at {probe} inside the probe chain of slot {pos}",
                );
                probe = (probe + 1) % CHUNK_CACHE_CAPACITY;
            }
        }
    }

}

impl Default for ChunkCache {

    fn default() -> Self {
        Self::new()
    }

}

/// Whether `x` lies cyclically within `(start, end]`.
#[inline]
fn cyclic_in(start: usize, x: usize, end: usize) -> bool {
    if start <= end {
        start < x && x <= end
    } else {
        x > start || x <= end
    }
}


#[cfg(test)]
mod tests {

    use super::*;

    fn key(i: usize) -> ChunkKey {
        ChunkKey::new((i & 0xFFF) as i16, (i >> 12) as i16, 0, 0)
    }

    #[test]
    fn chunk_cache_put_get() {
        let mut cache = ChunkCache::new();
        let chunk = Chunk::new_filled(7);
        cache.put(key(1), Arc::clone(&chunk));
        let got = cache.get(key(1)).unwrap();
        assert!(Arc::ptr_eq(&got, &chunk));
        assert!(cache.get(key(2)).is_none());
    }

    #[test]
    fn chunk_cache_update_in_place() {
        let mut cache = ChunkCache::new();
        cache.put(key(1), Chunk::new_filled(1));
        cache.put(key(1), Chunk::new_filled(2));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(key(1)).unwrap().block[0], 2);
    }

    #[test]
    fn chunk_cache_eviction_keeps_capacity() {
        let mut cache = ChunkCache::new();
        for i in 0..2 * CHUNK_CACHE_CAPACITY {
            let chunk = Chunk::new_filled((i % 251) as u8);
            cache.put(key(i), Arc::clone(&chunk));
            // A chunk just inserted is always immediately retrievable.
            let got = cache.get(key(i)).unwrap();
            assert!(Arc::ptr_eq(&got, &chunk));
        }
        assert_eq!(cache.len(), CHUNK_CACHE_CAPACITY);
        let retrievable = (0..2 * CHUNK_CACHE_CAPACITY)
            .filter(|&i| cache.get(key(i)).is_some())
            .count();
        assert_eq!(retrievable, CHUNK_CACHE_CAPACITY);
    }

    #[test]
    fn chunk_cache_invalidate_preserves_chains() {
        let mut cache = ChunkCache::new();
        for i in 0..1024 {
            cache.put(key(i), Chunk::new_filled((i % 251) as u8));
        }
        cache.check_probe_invariant();
        for i in (0..1024).step_by(3) {
            assert!(cache.invalidate(key(i)));
        }
        cache.check_probe_invariant();
        for i in 0..1024 {
            let expected = i % 3 != 0;
            assert_eq!(cache.get(key(i)).is_some(), expected, "key {i}");
        }
        assert!(!cache.invalidate(key(5000)));
    }

    #[test]
    fn region_cache_hit_returns_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RegionCache::new(dir.path().to_path_buf(), CompressionAlgo::None);
        let coord = RegionCoord::new(0, 0, 0, 0);
        let a = cache.ensure(coord).unwrap();
        let b = cache.ensure(coord).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn region_cache_missing_without_create() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RegionCache::new(dir.path().to_path_buf(), CompressionAlgo::None);
        let coord = RegionCoord::new(5, 5, 5, 0);
        assert!(cache.get(coord).unwrap().is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn region_cache_ensure_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RegionCache::new(dir.path().to_path_buf(), CompressionAlgo::None);
        let coord = RegionCoord::new(1, 2, 3, 1);
        let created = cache.ensure(coord).unwrap();
        let found = cache.get(coord).unwrap().unwrap();
        assert!(Arc::ptr_eq(&created, &found));
        assert!(cache.region_path(coord).exists());
    }

    #[test]
    fn region_cache_evicts_beyond_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RegionCache::new(dir.path().to_path_buf(), CompressionAlgo::None);
        for rx in 0..(REGION_CACHE_CAPACITY + 6) as i32 {
            let handle = cache.ensure(RegionCoord::new(rx, 0, 0, 0)).unwrap();
            drop(handle);
        }
        assert_eq!(cache.len(), REGION_CACHE_CAPACITY);
    }

}
