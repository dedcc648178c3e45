//! The storage facade driven by the game loop. One thread owns a [`Storage`]
//! and calls [`mark_dirty`](Storage::mark_dirty) whenever a chunk changes and
//! [`tick`](Storage::tick) once per frame; the tick scheduler turns pending
//! chunks into per-region batches and hands them to the I/O workers. The
//! synchronous load and save paths are available for code that cannot wait,
//! and [`shutdown`](Storage::shutdown) drains everything before joining the
//! workers.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use glam::IVec3;
use tracing::{debug, info, warn};

use crate::cache::{ChunkCache, RegionCache};
use crate::chunk::{Chunk, ChunkKey};
use crate::compress::CompressionAlgo;
use crate::dirty::{DirtySet, MAX_BATCH_SIZE};
use crate::pipeline::{save_batch, AsyncHandle, IoPipeline, Priority};
use crate::region::{PreparedChunk, RegionError};


/// Load-queue depth beyond which the tick scheduler stops submitting save
/// batches, so reads take precedence.
pub const LOAD_BACKPRESSURE: usize = 32;

/// Name of the directory holding every world under the per-user application
/// data directory.
const APP_DIR_NAME: &str = "FarHorizons";


/// Error type for the facade-level synchronous operations.
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("region: {0}")]
    Region(#[from] RegionError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}


/// Handle to the persistent storage of one world.
pub struct Storage {
    world_dir: PathBuf,
    region_cache: Arc<RegionCache>,
    chunk_cache: Arc<Mutex<ChunkCache>>,
    dirty: DirtySet,
    pipeline: IoPipeline,
    default_compression: CompressionAlgo,
}

impl Storage {

    /// Open (or create) a world by name under the per-user application data
    /// directory, and start the I/O workers.
    pub fn open(world_name: &str) -> Result<Self, StorageError> {
        let base = dirs::data_dir()
            .ok_or_else(|| io::Error::new(
                io::ErrorKind::NotFound,
                "no per-user application data directory",
            ))?
            .join(APP_DIR_NAME);
        Self::open_at(&base, world_name)
    }

    /// Open (or create) a world stored under an explicit base directory.
    pub fn open_at(base: &Path, world_name: &str) -> Result<Self, StorageError> {

        let world_dir = base.join("worlds").join(world_name);
        let region_dir = world_dir.join("region");
        // The per-LOD subdirectories are created when their first region is.
        std::fs::create_dir_all(&region_dir)?;

        let default_compression = CompressionAlgo::Deflate;
        let region_cache = Arc::new(RegionCache::new(region_dir, default_compression));
        let chunk_cache = Arc::new(Mutex::new(ChunkCache::new()));
        let pipeline = IoPipeline::start(
            Arc::clone(&region_cache),
            Arc::clone(&chunk_cache),
            default_compression,
        );

        info!("opened world storage at {}", world_dir.display());

        Ok(Self {
            world_dir,
            region_cache,
            chunk_cache,
            dirty: DirtySet::new(),
            pipeline,
            default_compression,
        })

    }

    /// Directory of the opened world.
    pub fn world_dir(&self) -> &Path {
        &self.world_dir
    }

    /// Record a modification of the given chunk; the snapshot will reach
    /// disk through a later [`tick`](Self::tick). Marking the same chunk
    /// again replaces the snapshot, last write wins.
    pub fn mark_dirty(&mut self, key: ChunkKey, chunk: &Arc<Chunk>) {
        self.dirty.mark(key, chunk, Instant::now());
    }

    /// Number of chunks waiting to be saved.
    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    /// Number of asynchronous loads currently queued.
    pub fn pending_loads(&self) -> usize {
        self.pipeline.pending_loads()
    }

    /// Write-behind scheduler, to be called once per game frame. Pending
    /// chunks are drained into per-region batches sized by how much is dirty
    /// and how urgent it has become, then submitted to the workers. Nothing
    /// is submitted while the load queue is saturated.
    pub fn tick(&mut self) {

        if self.dirty.is_empty() {
            return;
        }
        if self.pipeline.pending_loads() > LOAD_BACKPRESSURE {
            return;
        }

        let now = Instant::now();
        let counts = self.dirty.urgency_counts(now);
        let budget = (4 + self.dirty.len() / 256 + (counts.urgent + counts.critical).min(8))
            .clamp(4, MAX_BATCH_SIZE);

        for batch in self.dirty.drain(budget, now) {
            debug!("submitting batch of {} chunks for region {:?}", batch.len(), batch.region);
            if let Err(batch) = self.pipeline.submit_batch(batch) {
                // Queue full: the chunks stay dirty for a later tick.
                for (key, snapshot) in batch.chunks {
                    self.dirty.mark(key, &snapshot, now);
                }
                return;
            }
        }

    }

    /// Drain every pending chunk and write it synchronously, bypassing the
    /// pipeline. This is the shutdown path: it guarantees durability before
    /// the workers are joined. Returns the number of chunks written;
    /// individual failures are logged.
    pub fn save_all_dirty(&mut self) -> usize {
        let mut saved = 0;
        for batch in self.dirty.drain_all() {
            saved += save_batch(&self.region_cache, &batch, self.default_compression);
        }
        saved
    }

    /// Load a chunk, serving from the chunk cache when possible. `None`
    /// means no such chunk was ever saved.
    pub fn load_chunk(&mut self, key: ChunkKey) -> Result<Option<Arc<Chunk>>, StorageError> {

        if let Some(chunk) = self.chunk_cache.lock().unwrap().get(key) {
            return Ok(Some(chunk));
        }

        let Some(region) = self.region_cache.get(key.region_coord())? else {
            return Ok(None);
        };
        let chunk = region.file().read().unwrap().read_chunk(key.local_index())?;

        if let Some(chunk) = &chunk {
            self.chunk_cache.lock().unwrap().put(key, Arc::clone(chunk));
        }

        Ok(chunk)

    }

    /// Synchronously encode, compress and durably write a chunk. The cache
    /// is updated and any pending dirty entry for the chunk is dropped,
    /// since it would only rewrite older data.
    pub fn save_chunk(&mut self, key: ChunkKey, chunk: &Arc<Chunk>) -> Result<(), StorageError> {

        // Encode and compress before taking the region's write lock; the
        // lock only covers the sector writes and the header commit.
        let prepared = PreparedChunk::new(key.local_index(), chunk, self.default_compression)?;

        let region = self.region_cache.ensure(key.region_coord())?;
        region.file().write().unwrap().write_prepared_chunk(&prepared)?;

        self.chunk_cache.lock().unwrap().put(key, Arc::clone(chunk));
        self.dirty.remove(key);
        Ok(())

    }

    /// Whether a chunk has a stored payload (or sits in the chunk cache).
    pub fn chunk_exists(&mut self, key: ChunkKey) -> Result<bool, StorageError> {
        if self.chunk_cache.lock().unwrap().get(key).is_some() {
            return Ok(true);
        }
        let Some(region) = self.region_cache.get(key.region_coord())? else {
            return Ok(false);
        };
        let exists = region.file().read().unwrap().contains(key.local_index());
        Ok(exists)
    }

    /// Queue an asynchronous load; the chunk lands in the cache once the
    /// workers are done and completion is reported through
    /// [`poll_load`](Self::poll_load). `None` when the queue is full.
    pub fn request_load_async(&mut self, key: ChunkKey, priority: Priority) -> Option<AsyncHandle> {
        self.pipeline.request_load(key, priority)
    }

    /// Poll a previously requested load. `Some(true)` means the chunk is now
    /// cached, `Some(false)` that it was absent or failed to load.
    pub fn poll_load(&mut self, handle: AsyncHandle) -> Option<bool> {
        self.pipeline.poll_load(handle)
    }

    /// Look up a chunk in the cache without touching storage.
    pub fn get_cached(&self, key: ChunkKey) -> Option<Arc<Chunk>> {
        self.chunk_cache.lock().unwrap().get(key)
    }

    /// Drop a chunk from the cache, e.g. after an external modification.
    pub fn invalidate_cache(&self, key: ChunkKey) -> bool {
        self.chunk_cache.lock().unwrap().invalidate(key)
    }

    /// Request normal-priority loads for every chunk of the inclusive
    /// coordinate range that is not already cached. Returns the number of
    /// loads queued.
    pub fn load_region(&mut self, min: IVec3, max: IVec3, lod: u8) -> usize {
        let mut requested = 0;
        for cy in min.y..=max.y {
            for cz in min.z..=max.z {
                for cx in min.x..=max.x {
                    let key = ChunkKey::new(cx as i16, cy as i16, cz as i16, lod);
                    if self.chunk_cache.lock().unwrap().get(key).is_some() {
                        continue;
                    }
                    match self.pipeline.request_load(key, Priority::Normal) {
                        Some(_) => requested += 1,
                        None => {
                            warn!("load queue full, stopping region preload");
                            return requested;
                        }
                    }
                }
            }
        }
        requested
    }

    /// Flush every open region file to stable storage.
    pub fn flush_all(&self) {
        self.region_cache.flush_all();
    }

    /// Drain every pending save synchronously, join the workers and flush.
    pub fn shutdown(mut self) {
        let saved = self.save_all_dirty();
        if saved > 0 {
            info!("saved {saved} pending chunks on shutdown");
        }
        self.pipeline.stop();
        self.region_cache.flush_all();
    }

}
