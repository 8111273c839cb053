//! Positional I/O against one raw device or file.
//!
//! A [`PartitionStorage`] owns the read-write handle for one torrent's
//! target device and translates piece-relative requests into positional
//! reads and writes through the torrent's [`TorrentLayout`]. It is
//! strictly synchronous: the engine only ever calls it from shard
//! worker threads, never from the callback executor.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::error::{DiskOp, ErrorKind, Result, StorageError};
use crate::layout::TorrentLayout;

/// Slot id of one storage inside the engine. Ids are small integers and
/// may be reused after `remove_torrent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(pub u32);

impl std::fmt::Display for StorageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Open-mode report for [`PartitionStorage::open_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFileState {
    pub path: PathBuf,
    pub writable: bool,
}

#[derive(Debug)]
pub struct PartitionStorage {
    id: StorageId,
    file: std::fs::File,
    layout: TorrentLayout,
    path: PathBuf,
}

impl PartitionStorage {
    /// Opens the target device read-write. The device must already
    /// exist: this neither creates nor truncates. Failure is fatal for
    /// the torrent.
    pub fn open(id: StorageId, path: &Path, layout: TorrentLayout) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| StorageError::new(ErrorKind::Fatal(e), DiskOp::Open))?;

        tracing::info!(
            "storage {}: opened {} ({} bytes over {} files)",
            id,
            path.display(),
            layout.total_length(),
            layout.num_files()
        );

        Ok(Self {
            id,
            file,
            layout,
            path: path.to_path_buf(),
        })
    }

    pub fn id(&self) -> StorageId {
        self.id
    }

    pub fn layout(&self) -> &TorrentLayout {
        &self.layout
    }

    pub fn piece_size(&self, piece: u32) -> u64 {
        self.layout.piece_size(piece)
    }

    pub fn open_state(&self) -> OpenFileState {
        OpenFileState {
            path: self.path.clone(),
            writable: true,
        }
    }

    /// Reads `buf.len()` bytes starting at `offset` within `piece`.
    /// Returns the byte count actually transferred, which is short only
    /// when the device itself comes up short.
    pub fn read(&self, buf: &mut [u8], piece: u32, offset: u64) -> Result<usize> {
        let slices = self.layout.map_block(piece, offset, buf.len() as u64);
        let mut transferred = 0usize;

        for slice in slices {
            let end = transferred + slice.length as usize;
            let chunk = &mut buf[transferred..end];
            let n = self
                .read_slice(chunk, slice.device_offset)
                .map_err(|e| StorageError::io(e, DiskOp::Read, Some(slice.file)))?;
            transferred += n;
            if n < chunk.len() {
                break;
            }
        }

        Ok(transferred)
    }

    /// Writes all of `buf` starting at `offset` within `piece`.
    pub fn write(&self, buf: &[u8], piece: u32, offset: u64) -> Result<usize> {
        let slices = self.layout.map_block(piece, offset, buf.len() as u64);
        let mut transferred = 0usize;

        for slice in slices {
            let end = transferred + slice.length as usize;
            let chunk = &buf[transferred..end];
            self.file
                .write_all_at(chunk, slice.device_offset)
                .map_err(|e| StorageError::io(e, DiskOp::Write, Some(slice.file)))?;
            transferred += chunk.len();
        }

        Ok(transferred)
    }

    fn read_slice(&self, buf: &mut [u8], device_offset: u64) -> std::io::Result<usize> {
        let mut filled = 0usize;
        while filled < buf.len() {
            match self
                .file
                .read_at(&mut buf[filled..], device_offset + filled as u64)
            {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl Drop for PartitionStorage {
    fn drop(&mut self) {
        tracing::debug!("storage {}: closing {}", self.id, self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::LayoutFile;
    use std::io::Write as _;

    fn device_with(len: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        f
    }

    fn single_file_storage(dev: &tempfile::NamedTempFile) -> PartitionStorage {
        let layout = TorrentLayout::new(&[LayoutFile::new("0", 65536)], 65536).unwrap();
        PartitionStorage::open(StorageId(0), dev.path(), layout).unwrap()
    }

    #[test]
    fn open_missing_device_is_fatal() {
        let layout = TorrentLayout::new(&[LayoutFile::new("0", 65536)], 65536).unwrap();
        let err =
            PartitionStorage::open(StorageId(0), Path::new("/nonexistent/rawbit-dev"), layout)
                .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn write_then_read_round_trip() {
        let dev = device_with(65536);
        let storage = single_file_storage(&dev);

        let data = vec![0xABu8; 16384];
        assert_eq!(storage.write(&data, 0, 16384).unwrap(), 16384);

        let mut out = vec![0u8; 16384];
        assert_eq!(storage.read(&mut out, 0, 16384).unwrap(), 16384);
        assert_eq!(out, data);
    }

    #[test]
    fn read_lands_at_the_named_device_offset() {
        // File named "4000" puts torrent offset 0 at device byte 0x4000.
        let dev = device_with(0x8000);
        let layout = TorrentLayout::new(&[LayoutFile::new("4000", 16384)], 16384).unwrap();
        let storage = PartitionStorage::open(StorageId(0), dev.path(), layout).unwrap();

        storage.write(&[0x5A; 16], 0, 0).unwrap();

        let mut raw = vec![0u8; 16];
        storage.file.read_at(&mut raw, 0x4000).unwrap();
        assert_eq!(raw, [0x5A; 16]);
    }

    #[test]
    fn multi_file_write_spans_extents() {
        // Two 16 KiB files at swapped device positions.
        let dev = device_with(65536);
        let layout = TorrentLayout::new(
            &[LayoutFile::new("4000", 16384), LayoutFile::new("0", 16384)],
            32768,
        )
        .unwrap();
        let storage = PartitionStorage::open(StorageId(0), dev.path(), layout).unwrap();

        let mut data = vec![0x11u8; 16384];
        data.extend_from_slice(&[0x22u8; 16384]);
        storage.write(&data, 0, 0).unwrap();

        let mut first = vec![0u8; 1];
        storage.file.read_at(&mut first, 0x4000).unwrap();
        assert_eq!(first[0], 0x11);
        let mut second = vec![0u8; 1];
        storage.file.read_at(&mut second, 0).unwrap();
        assert_eq!(second[0], 0x22);

        // The layout round-trips through a piece-relative read too.
        let mut out = vec![0u8; 32768];
        storage.read(&mut out, 0, 0).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn short_device_reports_partial_read() {
        let dev = device_with(8192);
        let storage = single_file_storage(&dev);

        let mut out = vec![0u8; 16384];
        let n = storage.read(&mut out, 0, 0).unwrap();
        assert_eq!(n, 8192);
    }
}
