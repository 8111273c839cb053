//! The public engine: registry, dispatch, backpressure, shutdown.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::cache::{
    shard_index, BufferPool, CacheShardStats, DiskObserver, PoolBuffer, BLOCK_SIZE,
};
use crate::error::{DiskOp, ErrorKind, Result, StorageError};
use crate::layout::{LayoutFile, TorrentLayout};
use crate::settings::SettingsView;
use crate::stats::{DiskGauges, StatsReporter};
use crate::storage::{OpenFileState, PartitionStorage, StorageId};

use super::job::{
    FlushBarrier, Hash2Handler, HashHandler, Job, PieceHandler, ReadHandler, WriteHandler,
};
use super::worker::ShardWorker;
use super::BlockRequest;

struct Registry {
    slots: Vec<Option<Arc<PartitionStorage>>>,
    free: VecDeque<u32>,
}

/// The disk I/O engine. One instance per process; construction spawns
/// the shard workers and the stats reporter, destruction joins them.
pub struct DiskIo {
    callbacks: Handle,
    settings: SettingsView,
    pool: BufferPool,
    workers: Vec<ShardWorker>,
    registry: Mutex<Registry>,
    reporter: StatsReporter,
    aborted: AtomicBool,
}

impl DiskIo {
    /// `callbacks` is the session's executor; every completion handler
    /// and every observer wake-up runs there.
    pub fn new(callbacks: Handle, settings: SettingsView) -> Self {
        let view = settings.read().clone();
        let num_shards = view.aio_threads.max(1);
        let per_shard = view.entries_per_shard();

        let pool = BufferPool::new(callbacks.clone(), view.pool_size);
        let workers: Vec<ShardWorker> = (0..num_shards)
            .map(|i| ShardWorker::spawn(i, per_shard, callbacks.clone()))
            .collect();
        let reporter = StatsReporter::spawn(workers.iter().map(|w| w.tx.clone()).collect());

        tracing::info!(
            "disk engine up: {} shards, {} cache entries per shard, {} pool blocks",
            num_shards,
            per_shard,
            view.pool_blocks()
        );

        Self {
            callbacks,
            settings,
            pool,
            workers,
            registry: Mutex::new(Registry {
                slots: Vec::new(),
                free: VecDeque::new(),
            }),
            reporter,
            aborted: AtomicBool::new(false),
        }
    }

    /// Registers a torrent: parses the layout's hex file names and
    /// opens the target device read-write. Returns the storage slot id.
    pub fn new_torrent(
        &self,
        files: &[LayoutFile],
        piece_length: u64,
        device_path: &Path,
    ) -> Result<StorageId> {
        let layout = TorrentLayout::new(files, piece_length)?;

        // Reserve a slot before the open so concurrent registrations
        // cannot collide on a fresh index.
        let id = {
            let mut registry = self.registry.lock();
            match registry.free.pop_front() {
                Some(id) => id,
                None => {
                    registry.slots.push(None);
                    (registry.slots.len() - 1) as u32
                }
            }
        };
        let id = StorageId(id);

        match PartitionStorage::open(id, device_path, layout) {
            Ok(storage) => {
                self.registry.lock().slots[id.0 as usize] = Some(Arc::new(storage));
                Ok(id)
            }
            Err(e) => {
                self.registry.lock().free.push_back(id.0);
                tracing::error!("new_torrent: {}", e);
                Err(e)
            }
        }
    }

    /// Unregisters a torrent. Pending jobs finish, this storage's dirty
    /// blocks are flushed, its cache entries dropped, and the slot id
    /// becomes reusable.
    pub fn remove_torrent(&self, id: StorageId) {
        let storage = {
            let mut registry = self.registry.lock();
            let slot = match registry.slots.get_mut(id.0 as usize) {
                Some(slot) => slot.take(),
                None => None,
            };
            if slot.is_some() {
                registry.free.push_back(id.0);
            }
            slot
        };

        let Some(storage) = storage else {
            tracing::warn!("remove_torrent: unknown storage {}", id);
            return;
        };

        // Per-shard FIFO makes this safe against slot reuse: cleanup on
        // each shard runs before any job a later torrent posts there.
        for worker in &self.workers {
            self.send_to(
                worker,
                Job::RemoveStorage {
                    storage: storage.clone(),
                },
            );
        }
    }

    /// Asynchronous read. `req.start` may be unaligned; the completion
    /// receives a buffer holding `transferred` bytes or an error.
    pub fn async_read(
        &self,
        id: StorageId,
        req: BlockRequest,
        handler: impl FnOnce(Result<PoolBuffer>) + Send + 'static,
    ) {
        let handler: ReadHandler = Box::new(handler);
        let storage = match self.prepare(id, &req, DiskOp::Read) {
            Ok(storage) => storage,
            Err(e) => return self.post(move || handler(Err(e))),
        };

        let Some(buf) = self.pool.allocate() else {
            let e = StorageError::new(ErrorKind::NoMemory, DiskOp::Read);
            return self.post(move || handler(Err(e)));
        };

        self.dispatch(
            id,
            req.piece,
            Job::Read {
                storage,
                req,
                buf,
                handler,
            },
        );
    }

    /// Asynchronous block-aligned write. The caller's bytes are copied
    /// before this returns. The return value is the backpressure
    /// signal: `true` means the pool is exceeded and the caller should
    /// stop writing until `observer` fires.
    pub fn async_write(
        &self,
        id: StorageId,
        req: BlockRequest,
        data: &[u8],
        observer: Option<&Arc<dyn DiskObserver>>,
        handler: impl FnOnce(Option<StorageError>) + Send + 'static,
    ) -> bool {
        let handler: WriteHandler = Box::new(handler);

        let storage = if data.len() != req.length as usize
            || req.start as usize % BLOCK_SIZE != 0
        {
            Err(StorageError::new(ErrorKind::InvalidRequest, DiskOp::Write))
        } else {
            self.prepare(id, &req, DiskOp::Write)
        };
        let storage = match storage {
            Ok(storage) => storage,
            Err(e) => {
                self.post(move || handler(Some(e)));
                return self.pool.is_exceeded();
            }
        };

        let (buf, exceeded) = self.pool.allocate_with_observer(observer);
        match buf {
            Some(mut buf) => {
                buf.copy_from(data);
                self.dispatch(
                    id,
                    req.piece,
                    Job::Write {
                        storage,
                        req,
                        buf,
                        handler,
                    },
                );
            }
            None => {
                // Out of pool buffers: skip the cache rather than block
                // the peer's write.
                tracing::debug!(
                    "write {}:{}+{}: pool exhausted, bypassing cache",
                    id,
                    req.piece,
                    req.start
                );
                self.dispatch(
                    id,
                    req.piece,
                    Job::WriteDirect {
                        storage,
                        req,
                        data: Bytes::copy_from_slice(data),
                        handler,
                    },
                );
            }
        }
        exceeded
    }

    /// SHA-1 of a whole piece, cache-first.
    pub fn async_hash(
        &self,
        id: StorageId,
        piece: u32,
        handler: impl FnOnce(u32, Result<[u8; 20]>) + Send + 'static,
    ) {
        let handler: HashHandler = Box::new(handler);
        let storage = match self.storage(id, DiskOp::Hash) {
            Ok(storage) => storage,
            Err(e) => return self.post(move || handler(piece, Err(e))),
        };
        if storage.piece_size(piece) == 0 {
            let e = StorageError::new(ErrorKind::InvalidRequest, DiskOp::Hash);
            return self.post(move || handler(piece, Err(e)));
        }
        let Some(scratch) = self.pool.allocate() else {
            let e = StorageError::new(ErrorKind::NoMemory, DiskOp::Hash);
            return self.post(move || handler(piece, Err(e)));
        };
        self.dispatch(
            id,
            piece,
            Job::Hash {
                storage,
                piece,
                scratch,
                handler,
            },
        );
    }

    /// SHA-256 of one block (v2 block hash).
    pub fn async_hash2(
        &self,
        id: StorageId,
        piece: u32,
        offset: u32,
        handler: impl FnOnce(u32, Result<[u8; 32]>) + Send + 'static,
    ) {
        let handler: Hash2Handler = Box::new(handler);
        let storage = match self.storage(id, DiskOp::Hash) {
            Ok(storage) => storage,
            Err(e) => return self.post(move || handler(piece, Err(e))),
        };
        let Some(scratch) = self.pool.allocate() else {
            let e = StorageError::new(ErrorKind::NoMemory, DiskOp::Hash);
            return self.post(move || handler(piece, Err(e)));
        };
        self.dispatch(
            id,
            piece,
            Job::Hash2 {
                storage,
                piece,
                offset,
                scratch,
                handler,
            },
        );
    }

    /// Flushes the storage's dirty blocks on every shard, then
    /// completes. The torrent stays registered.
    pub fn async_stop_torrent(&self, id: StorageId, handler: impl FnOnce() + Send + 'static) {
        let storage = match self.storage(id, DiskOp::Flush) {
            Ok(storage) => storage,
            Err(_) => return self.post(handler),
        };
        let barrier =
            FlushBarrier::new(self.workers.len(), self.callbacks.clone(), Box::new(handler));
        for worker in &self.workers {
            self.send_to(
                worker,
                Job::Flush {
                    storage: storage.clone(),
                    barrier: barrier.clone(),
                },
            );
        }
    }

    /// The device handle is the torrent's only file and stays open; the
    /// completion is posted as-is.
    pub fn async_release_files(&self, _id: StorageId, handler: impl FnOnce() + Send + 'static) {
        self.post(handler);
    }

    /// Deleting data from a raw device is not meaningful.
    pub fn async_delete_files(
        &self,
        _id: StorageId,
        handler: impl FnOnce(Option<StorageError>) + Send + 'static,
    ) {
        self.post(move || {
            handler(Some(StorageError::new(
                ErrorKind::Unsupported,
                DiskOp::DeleteFiles,
            )))
        });
    }

    /// Resume data is never kept: reports no error and no files.
    pub fn async_check_files(
        &self,
        _id: StorageId,
        handler: impl FnOnce(Option<StorageError>) + Send + 'static,
    ) {
        self.post(move || handler(None));
    }

    pub fn async_move_storage(
        &self,
        _id: StorageId,
        path: String,
        handler: impl FnOnce(String, Option<StorageError>) + Send + 'static,
    ) {
        self.post(move || {
            handler(
                path,
                Some(StorageError::new(ErrorKind::Unsupported, DiskOp::MoveStorage)),
            )
        });
    }

    pub fn async_rename_file(
        &self,
        _id: StorageId,
        file: u32,
        name: String,
        handler: impl FnOnce(u32, String, Option<StorageError>) + Send + 'static,
    ) {
        self.post(move || {
            handler(
                file,
                name,
                Some(StorageError::new(ErrorKind::Unsupported, DiskOp::RenameFile)),
            )
        });
    }

    pub fn async_set_file_priority(
        &self,
        _id: StorageId,
        priorities: Vec<u8>,
        handler: impl FnOnce(Vec<u8>, Option<StorageError>) + Send + 'static,
    ) {
        self.post(move || {
            handler(
                priorities,
                Some(StorageError::new(
                    ErrorKind::Unsupported,
                    DiskOp::FilePriority,
                )),
            )
        });
    }

    /// Fence against all outstanding jobs for the piece's shard.
    pub fn async_clear_piece(
        &self,
        id: StorageId,
        piece: u32,
        handler: impl FnOnce(u32) + Send + 'static,
    ) {
        let handler: PieceHandler = Box::new(handler);
        self.dispatch(id, piece, Job::ClearPiece { piece, handler });
    }

    /// Fills the gauges a periodic stats snapshot reports.
    pub fn update_stats_counters(&self, gauges: &mut DiskGauges) {
        gauges.blocks_in_use = self.pool.in_use();
        gauges.pool_exceeded = self.pool.is_exceeded();
    }

    /// Value snapshot of every shard's counters, gathered by posting to
    /// the owning workers.
    pub fn cache_stats(&self) -> Vec<CacheShardStats> {
        let (tx, rx) = std::sync::mpsc::channel();
        for worker in &self.workers {
            self.send_to(worker, Job::SnapshotStats { reply: tx.clone() });
        }
        drop(tx);
        rx.iter().collect()
    }

    /// Zeroes every shard's counters.
    pub fn reset_cache_stats(&self) {
        for worker in &self.workers {
            self.send_to(worker, Job::ResetStats);
        }
    }

    /// Logs the aggregated cache picture plus one line per shard.
    /// Gathers by posting to the owning workers, like every other read
    /// of shard state.
    pub fn log_cache_stats(&self) {
        let stats = self.cache_stats();
        let mut total = CacheShardStats::default();
        for s in &stats {
            total.accumulate(s);
        }
        tracing::info!(
            "cache: {}/{} entries ({} dirty), {} hits / {} misses ({:.2}% hit rate), {} inserts, {} evictions, {} pool blocks in use",
            total.entries,
            total.capacity,
            total.dirty,
            total.hits,
            total.misses,
            total.hit_rate(),
            total.inserts,
            total.evictions,
            self.pool.in_use()
        );
        for (i, s) in stats.iter().enumerate() {
            tracing::info!(
                "cache shard {}: {}/{} entries ({} dirty), {:.2}% hit rate over {} lookups",
                i,
                s.entries,
                s.capacity,
                s.dirty,
                s.hit_rate(),
                s.hits + s.misses
            );
        }
    }

    /// Re-reads the settings view: re-bounds the pool and re-quotas
    /// every shard. The worker count is fixed at construction.
    pub fn settings_updated(&self) {
        let view = self.settings.read().clone();
        self.pool.set_limit(view.pool_size);
        let per_shard = (view.cache_size / self.workers.len()).max(1);
        for worker in &self.workers {
            self.send_to(worker, Job::SetMaxEntries(per_shard));
        }
        tracing::info!(
            "settings updated: {} cache entries per shard, {} pool blocks",
            per_shard,
            view.pool_blocks()
        );
    }

    /// Open-file report for the session's status surface.
    pub fn get_status(&self, id: StorageId) -> Vec<OpenFileState> {
        match self.storage(id, DiskOp::Open) {
            Ok(storage) => vec![storage.open_state()],
            Err(_) => Vec::new(),
        }
    }

    /// Batch notifier. Workers wake on every job post, so there is
    /// nothing to kick here.
    pub fn submit_jobs(&self) {}

    /// Graceful shutdown: stops the stats reporter, lets every queued
    /// job finish, and (with `wait`) joins all workers.
    pub fn abort(&self, wait: bool) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            tracing::info!("disk engine shutting down");
            self.log_cache_stats();
            self.reporter.stop();
            for worker in &self.workers {
                let _ = worker.tx.send(Job::Shutdown);
            }
        }
        if wait {
            self.reporter.join();
            for worker in &self.workers {
                worker.join();
            }
        }
    }

    fn prepare(
        &self,
        id: StorageId,
        req: &BlockRequest,
        op: DiskOp,
    ) -> Result<Arc<PartitionStorage>> {
        if req.length == 0 || req.length as usize > BLOCK_SIZE {
            return Err(StorageError::new(ErrorKind::InvalidRequest, op));
        }
        let storage = self.storage(id, op)?;
        if req.start as u64 + req.length as u64 > storage.piece_size(req.piece) {
            return Err(StorageError::new(ErrorKind::InvalidRequest, op));
        }
        Ok(storage)
    }

    fn storage(&self, id: StorageId, op: DiskOp) -> Result<Arc<PartitionStorage>> {
        self.registry
            .lock()
            .slots
            .get(id.0 as usize)
            .and_then(|slot| slot.clone())
            .ok_or_else(|| StorageError::new(ErrorKind::InvalidRequest, op))
    }

    fn dispatch(&self, id: StorageId, piece: u32, job: Job) {
        let shard = shard_index(id, piece, self.workers.len());
        self.send_to(&self.workers[shard], job);
    }

    fn send_to(&self, worker: &ShardWorker, job: Job) {
        if worker.tx.send(job).is_err() {
            tracing::debug!("job dropped: shard queue closed");
        }
    }

    fn post(&self, f: impl FnOnce() + Send + 'static) {
        self.callbacks.spawn(async move { f() });
    }
}

impl Drop for DiskIo {
    fn drop(&mut self) {
        self.abort(true);
    }
}
