//! Jobs posted to shard workers, and the handler signatures the
//! session sees.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::cache::{CacheShardStats, PoolBuffer};
use crate::error::StorageError;
use crate::storage::PartitionStorage;

use super::BlockRequest;

pub type ReadHandler = Box<dyn FnOnce(Result<PoolBuffer, StorageError>) + Send>;
pub type WriteHandler = Box<dyn FnOnce(Option<StorageError>) + Send>;
pub type HashHandler = Box<dyn FnOnce(u32, Result<[u8; 20], StorageError>) + Send>;
pub type Hash2Handler = Box<dyn FnOnce(u32, Result<[u8; 32], StorageError>) + Send>;
pub type PieceHandler = Box<dyn FnOnce(u32) + Send>;

pub(crate) enum Job {
    Read {
        storage: Arc<PartitionStorage>,
        req: BlockRequest,
        buf: PoolBuffer,
        handler: ReadHandler,
    },
    Write {
        storage: Arc<PartitionStorage>,
        req: BlockRequest,
        buf: PoolBuffer,
        handler: WriteHandler,
    },
    /// Pool-exhaustion fallback: no cache involvement, plain heap
    /// carrier.
    WriteDirect {
        storage: Arc<PartitionStorage>,
        req: BlockRequest,
        data: Bytes,
        handler: WriteHandler,
    },
    Hash {
        storage: Arc<PartitionStorage>,
        piece: u32,
        scratch: PoolBuffer,
        handler: HashHandler,
    },
    Hash2 {
        storage: Arc<PartitionStorage>,
        piece: u32,
        offset: u32,
        scratch: PoolBuffer,
        handler: Hash2Handler,
    },
    /// Write out this shard's dirty blocks for one storage, then
    /// arrive at the barrier.
    Flush {
        storage: Arc<PartitionStorage>,
        barrier: Arc<FlushBarrier>,
    },
    /// Flush, then drop every cache entry of the storage. Posted when a
    /// torrent is removed; the slot id may be reused right after.
    RemoveStorage {
        storage: Arc<PartitionStorage>,
    },
    /// Pure fence: completes once every previously posted job on the
    /// piece's shard has run.
    ClearPiece {
        piece: u32,
        handler: PieceHandler,
    },
    SetMaxEntries(usize),
    /// Log this shard's counters (posted by the stats reporter).
    LogStats,
    ResetStats,
    SnapshotStats {
        reply: std::sync::mpsc::Sender<CacheShardStats>,
    },
    Shutdown,
}

/// Completion barrier for operations fanned out to every shard. The
/// last worker to arrive posts the handler on the callback executor.
pub(crate) struct FlushBarrier {
    remaining: AtomicUsize,
    handler: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    callbacks: Handle,
}

impl FlushBarrier {
    pub(crate) fn new(
        count: usize,
        callbacks: Handle,
        handler: Box<dyn FnOnce() + Send>,
    ) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            handler: Mutex::new(Some(handler)),
            callbacks,
        })
    }

    pub(crate) fn arrive(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(handler) = self.handler.lock().take() {
                self.callbacks.spawn(async move { handler() });
            }
        }
    }
}
