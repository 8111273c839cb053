//! Runtime-tunable settings consumed by the disk engine.
//!
//! The session owns the settings view and calls
//! [`DiskIo::settings_updated`](crate::disk::DiskIo::settings_updated)
//! after changing it; the engine then re-derives the buffer pool bounds
//! and the per-shard cache quota.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::BLOCK_SIZE;

/// Shared, mutable view of the disk settings.
pub type SettingsView = Arc<RwLock<DiskSettings>>;

#[derive(Debug, Clone)]
pub struct DiskSettings {
    /// Block cache capacity in 16 KiB entries.
    pub cache_size: usize,
    /// Number of shard worker threads. Also the number of cache shards;
    /// fixed once the engine is constructed.
    pub aio_threads: usize,
    /// Accepted for session compatibility. Hash jobs run on the piece's
    /// shard worker, so this is folded into `aio_threads`.
    pub hashing_threads: usize,
    /// Buffer pool size in bytes. The pool holds at most
    /// `pool_size / 16384` blocks.
    pub pool_size: usize,
}

impl DiskSettings {
    /// Number of pool buffers implied by `pool_size`.
    pub fn pool_blocks(&self) -> usize {
        self.pool_size / BLOCK_SIZE
    }

    /// Cache entries each shard may hold.
    pub fn entries_per_shard(&self) -> usize {
        (self.cache_size / self.aio_threads.max(1)).max(1)
    }

    pub fn into_view(self) -> SettingsView {
        Arc::new(RwLock::new(self))
    }
}

impl Default for DiskSettings {
    fn default() -> Self {
        Self {
            // 512 MiB of cache entries.
            cache_size: (512 * 1024 * 1024) / BLOCK_SIZE,
            aio_threads: 8,
            hashing_threads: 8,
            // 256 MiB of transient I/O buffers.
            pool_size: 256 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_holds_16k_blocks() {
        let s = DiskSettings::default();
        assert_eq!(s.pool_blocks(), 16384);
    }

    #[test]
    fn per_shard_quota_divides_cache_size() {
        let s = DiskSettings {
            cache_size: 1024,
            aio_threads: 8,
            ..DiskSettings::default()
        };
        assert_eq!(s.entries_per_shard(), 128);
    }

    #[test]
    fn per_shard_quota_is_never_zero() {
        let s = DiskSettings {
            cache_size: 2,
            aio_threads: 8,
            ..DiskSettings::default()
        };
        assert_eq!(s.entries_per_shard(), 1);
    }
}
