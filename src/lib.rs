//! rawbit - disk I/O and block cache for raw-device BitTorrent transfer
//!
//! This library is the storage side of a BitTorrent engine tuned for
//! bulk transfer onto raw block devices and plain files. The session
//! (peer wire, piece picker, trackers) lives elsewhere and talks to
//! this crate through the [`disk::DiskIo`] surface alone.
//!
//! # Modules
//!
//! - [`layout`] - Hex-named file table to device offset mapping
//! - [`storage`] - Positional I/O on one device handle per torrent
//! - [`cache`] - 16 KiB buffer pool and the sharded block cache
//! - [`disk`] - The asynchronous engine: dispatch, backpressure, shutdown
//! - [`hasher`] - Cache-first SHA-1 piece hashing and v2 block hashes
//! - [`stats`] - Periodic per-shard statistics reporting
//! - [`settings`] - Runtime-tunable cache/pool/thread settings
//! - [`error`] - The storage error taxonomy
//!
//! # Example
//!
//! ```no_run
//! use rawbit::{BlockRequest, DiskIo, DiskSettings, LayoutFile};
//!
//! # fn main() -> Result<(), rawbit::StorageError> {
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! let engine = DiskIo::new(rt.handle().clone(), DiskSettings::default().into_view());
//!
//! // One torrent file named by its hex device offset.
//! let files = vec![LayoutFile::new("0", 65536)];
//! let id = engine.new_torrent(&files, 65536, "/dev/sdb1".as_ref())?;
//!
//! engine.async_read(id, BlockRequest::new(0, 0, 16384), |result| {
//!     if let Ok(buf) = result {
//!         println!("read {} bytes", buf.len());
//!     }
//! });
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod disk;
pub mod error;
pub mod hasher;
pub mod layout;
pub mod settings;
pub mod stats;
pub mod storage;

pub use cache::{BufferPool, DiskObserver, PoolBuffer, BLOCK_SIZE};
pub use disk::{BlockRequest, DiskIo};
pub use error::{DiskOp, ErrorKind, StorageError};
pub use layout::{DeviceSlice, LayoutFile, TorrentLayout};
pub use settings::{DiskSettings, SettingsView};
pub use stats::DiskGauges;
pub use storage::{OpenFileState, PartitionStorage, StorageId};
