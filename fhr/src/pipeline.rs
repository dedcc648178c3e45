//! Asynchronous I/O pipeline: a priority-ordered request queue drained by a
//! small pool of worker threads. Loads jump ahead of saves according to
//! their priority, saves always queue at the back, and completed loads are
//! reported through a bounded channel the facade polls by handle.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::env;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use once_cell::race::OnceNonZeroUsize;
use tracing::{debug, trace, warn};

use crate::cache::{ChunkCache, RegionCache};
use crate::chunk::{Chunk, ChunkKey};
use crate::compress::CompressionAlgo;
use crate::dirty::RegionBatch;
use crate::region::{PreparedChunk, RegionError};


/// Maximum number of queued requests.
pub const QUEUE_CAPACITY: usize = 1024;
/// Maximum number of worker threads.
pub const MAX_WORKERS: usize = 4;
/// Bound of the completion channel.
const RESULT_CAPACITY: usize = 1024;


/// Priority of a queued request; lower values are dequeued first. `Save` is
/// internal: every save request sorts behind every load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Save,
}

/// Identifier of an asynchronous load, used to poll for its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncHandle(u64);


enum Request {
    Load {
        key: ChunkKey,
        priority: Priority,
        handle: AsyncHandle,
    },
    BatchSave {
        batch: RegionBatch,
    },
}

impl Request {

    fn priority(&self) -> Priority {
        match self {
            Request::Load { priority, .. } => *priority,
            Request::BatchSave { .. } => Priority::Save,
        }
    }

}

struct RequestResult {
    handle: AsyncHandle,
    success: bool,
}


/// State shared between the facade-side handle and the workers.
struct PipelineShared {
    /// Pending requests, kept sorted ascending by priority.
    queue: Mutex<VecDeque<Request>>,
    /// Signaled whenever a request is queued or shutdown begins.
    cond: Condvar,
    /// Workers only observe this once the queue is empty, so every queued
    /// request is drained before they exit.
    shutdown: AtomicBool,
    /// Number of load requests currently queued, read by the tick scheduler
    /// to give reads precedence over write-behind.
    pending_loads: AtomicUsize,
    region_cache: Arc<RegionCache>,
    chunk_cache: Arc<Mutex<ChunkCache>>,
    result_sender: Sender<RequestResult>,
    default_compression: CompressionAlgo,
}

/// Handle to the worker pool, owned by the storage facade. Dropping it (or
/// calling [`stop`](Self::stop)) drains the queue and joins the workers.
pub struct IoPipeline {
    shared: Arc<PipelineShared>,
    workers: Vec<JoinHandle<()>>,
    result_receiver: Receiver<RequestResult>,
    /// Completions drained from the channel, waiting to be polled.
    results: HashMap<AsyncHandle, bool>,
    next_handle: u64,
}

impl IoPipeline {

    /// Spawn the worker pool. The worker count is `min(4, cpu_count)`,
    /// overridable through the `FHR_IO_WORKERS` environment variable.
    pub fn start(
        region_cache: Arc<RegionCache>,
        chunk_cache: Arc<Mutex<ChunkCache>>,
        default_compression: CompressionAlgo,
    ) -> Self {

        let (result_sender, result_receiver) = bounded(RESULT_CAPACITY);

        let shared = Arc::new(PipelineShared {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
            shutdown: AtomicBool::new(false),
            pending_loads: AtomicUsize::new(0),
            region_cache,
            chunk_cache,
            result_sender,
            default_compression,
        });

        let workers = (0..worker_count())
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("I/O Worker #{i}"))
                    .spawn(move || worker_run(shared))
                    .unwrap()
            })
            .collect();

        Self {
            shared,
            workers,
            result_receiver,
            results: HashMap::new(),
            next_handle: 0,
        }

    }

    /// Queue an asynchronous chunk load at the given priority, ahead of any
    /// queued request of a lower one. Returns `None` when the queue is full.
    pub fn request_load(&mut self, key: ChunkKey, priority: Priority) -> Option<AsyncHandle> {

        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= QUEUE_CAPACITY {
            warn!("i/o queue full, dropping load request for {key:?}");
            return None;
        }

        self.next_handle += 1;
        let handle = AsyncHandle(self.next_handle);
        let index = insertion_index(&queue, priority);
        queue.insert(index, Request::Load { key, priority, handle });
        self.shared.pending_loads.fetch_add(1, Ordering::Relaxed);
        drop(queue);

        self.shared.cond.notify_one();
        Some(handle)

    }

    /// Queue a batch save behind every pending load. The batch is handed
    /// back when the queue is full so the caller can keep its chunks dirty.
    pub fn submit_batch(&mut self, batch: RegionBatch) -> Result<(), RegionBatch> {

        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= QUEUE_CAPACITY {
            warn!("i/o queue full, deferring batch for region {:?}", batch.region);
            return Err(batch);
        }

        queue.push_back(Request::BatchSave { batch });
        drop(queue);

        self.shared.cond.notify_one();
        Ok(())

    }

    /// Number of load requests currently queued.
    pub fn pending_loads(&self) -> usize {
        self.shared.pending_loads.load(Ordering::Relaxed)
    }

    /// Total number of queued requests.
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Poll the completion of an asynchronous load: `Some(true)` once the
    /// chunk is decoded and cached, `Some(false)` when it was absent or the
    /// load failed, `None` while still in flight.
    pub fn poll_load(&mut self, handle: AsyncHandle) -> Option<bool> {
        while let Ok(result) = self.result_receiver.try_recv() {
            self.results.insert(result.handle, result.success);
        }
        self.results.remove(&handle)
    }

    /// Drain the queue and join every worker. Workers only observe the
    /// shutdown flag with an empty queue, so pending requests all execute.
    pub fn stop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _queue = self.shared.queue.lock().unwrap();
            self.shared.cond.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }

}

impl Drop for IoPipeline {

    fn drop(&mut self) {
        self.stop();
    }

}


/// Index at which a request of the given priority is inserted to keep the
/// queue sorted ascending, after every already-queued request of the same
/// priority. Queue sizes are small, a linear scan is fine.
fn insertion_index(queue: &VecDeque<Request>, priority: Priority) -> usize {
    queue.iter()
        .position(|request| request.priority() > priority)
        .unwrap_or(queue.len())
}

/// Number of workers to spawn, resolved once per process.
fn worker_count() -> usize {
    static COUNT: OnceNonZeroUsize = OnceNonZeroUsize::new();
    COUNT
        .get_or_init(|| {
            let default = thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1)
                .min(MAX_WORKERS);
            let count = env::var_os("FHR_IO_WORKERS")
                .and_then(|s| s.to_str()?.parse::<usize>().ok())
                .unwrap_or(default)
                .clamp(1, MAX_WORKERS);
            NonZeroUsize::new(count).unwrap_or(NonZeroUsize::MIN)
        })
        .get()
}


fn worker_run(shared: Arc<PipelineShared>) {

    loop {

        let request = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(request) = queue.pop_front() {
                    break request;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                queue = shared.cond.wait(queue).unwrap();
            }
        };

        match request {
            Request::Load { key, handle, .. } => {
                shared.pending_loads.fetch_sub(1, Ordering::Relaxed);
                execute_load(&shared, key, handle);
            }
            Request::BatchSave { batch } => execute_batch_save(&shared, batch),
        }

    }

}

fn execute_load(shared: &PipelineShared, key: ChunkKey, handle: AsyncHandle) {

    let success = match try_load(shared, key) {
        Ok(Some(chunk)) => {
            shared.chunk_cache.lock().unwrap().put(key, chunk);
            true
        }
        Ok(None) => {
            trace!("chunk {key:?} not present in storage");
            false
        }
        Err(err) => {
            warn!("failed to load chunk {key:?}: {err}");
            false
        }
    };

    // The channel is bounded; a consumer that stopped polling loses the
    // oldest completions rather than wedging the worker.
    match shared.result_sender.try_send(RequestResult { handle, success }) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => warn!("load result channel full, dropping completion"),
        Err(TrySendError::Disconnected(_)) => {}
    }

}

fn try_load(shared: &PipelineShared, key: ChunkKey) -> Result<Option<Arc<Chunk>>, RegionError> {
    let Some(region) = shared.region_cache.get(key.region_coord())? else {
        return Ok(None);
    };
    let result = region.file().read().unwrap().read_chunk(key.local_index());
    result
}

fn execute_batch_save(shared: &PipelineShared, batch: RegionBatch) {
    let written = save_batch(&shared.region_cache, &batch, shared.default_compression);
    debug!("saved {written} chunks in region {:?}", batch.region);
    // Dropping the batch here releases the chunk snapshots.
}

/// Write a whole batch through the region cache: encode and compress every
/// snapshot outside the region lock, then hold the write lock once for the
/// sector writes and the single header commit. Failures are logged, the
/// returned count is the number of chunks actually written. Shared between
/// the workers and the synchronous shutdown drain.
pub(crate) fn save_batch(
    region_cache: &RegionCache,
    batch: &RegionBatch,
    algo: CompressionAlgo,
) -> usize {

    let mut prepared = Vec::with_capacity(batch.len());
    for (key, snapshot) in &batch.chunks {
        match PreparedChunk::new(key.local_index(), snapshot, algo) {
            Ok(chunk) => prepared.push(chunk),
            Err(err) => warn!("failed to encode chunk {key:?}: {err}"),
        }
    }

    let region = match region_cache.ensure(batch.region) {
        Ok(region) => region,
        Err(err) => {
            warn!("failed to open region {:?} for batch save: {err}", batch.region);
            return 0;
        }
    };

    let mut file = region.file().write().unwrap();
    match file.write_prepared(&prepared) {
        Ok(written) => written,
        Err(err) => {
            warn!("failed to save batch for region {:?}: {err}", batch.region);
            0
        }
    }

}
