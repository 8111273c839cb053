//! Memory management for 16 KiB blocks.
//!
//! Two concerns live here and stay deliberately separate:
//!
//! - [`BufferPool`] owns memory accounting and peer backpressure. It
//!   hands out transient block buffers, latches `exceeded` at its high
//!   watermark, and wakes [`DiskObserver`]s once usage falls back below
//!   the low watermark.
//! - [`CachePartition`] owns replacement policy. Each shard is a
//!   block-indexed, LRU-evicted map of dirty/clean entries touched by
//!   exactly one worker thread, so it needs no lock at all.

mod block_cache;
mod buffer_pool;

pub use block_cache::{shard_index, BlockLoc, CachePartition, CacheShardStats};
pub use buffer_pool::{BufferPool, DiskObserver, PoolBuffer};

/// Size of one block: the BitTorrent transfer unit, the cache entry
/// size, and the pool buffer size.
pub const BLOCK_SIZE: usize = 16384;
