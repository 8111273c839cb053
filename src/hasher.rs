//! Piece hashing, cache-first.
//!
//! Hash jobs run on the shard worker that owns the piece's blocks (the
//! shard index never mixes in the block offset, so one piece is one
//! shard). Each block is fed straight out of the cache when present and
//! read into the caller's scratch buffer when not.

use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::cache::{BlockLoc, CachePartition, BLOCK_SIZE};
use crate::error::{DiskOp, ErrorKind, Result, StorageError};
use crate::storage::PartitionStorage;

/// SHA-1 of a whole piece.
pub fn hash_piece(
    storage: &PartitionStorage,
    shard: &mut CachePartition,
    scratch: &mut [u8],
    piece: u32,
) -> Result<[u8; 20]> {
    let piece_size = storage.piece_size(piece);
    if piece_size == 0 {
        return Err(StorageError::new(ErrorKind::InvalidRequest, DiskOp::Hash));
    }

    let mut hasher = Sha1::new();
    let mut offset = 0u64;
    while offset < piece_size {
        let block_len = (piece_size - offset).min(BLOCK_SIZE as u64) as usize;
        feed_block(storage, shard, scratch, piece, offset as u32, block_len, |b| {
            hasher.update(b)
        })?;
        offset += block_len as u64;
    }

    Ok(hasher.finalize().into())
}

/// SHA-256 of a single block (BitTorrent v2 block hash).
pub fn hash_block(
    storage: &PartitionStorage,
    shard: &mut CachePartition,
    scratch: &mut [u8],
    piece: u32,
    offset: u32,
) -> Result<[u8; 32]> {
    let piece_size = storage.piece_size(piece);
    if offset as u64 >= piece_size || offset as usize % BLOCK_SIZE != 0 {
        return Err(StorageError::new(ErrorKind::InvalidRequest, DiskOp::Hash));
    }
    let block_len = (piece_size - offset as u64).min(BLOCK_SIZE as u64) as usize;

    let mut hasher = Sha256::new();
    feed_block(storage, shard, scratch, piece, offset, block_len, |b| {
        hasher.update(b)
    })?;
    Ok(hasher.finalize().into())
}

fn feed_block(
    storage: &PartitionStorage,
    shard: &mut CachePartition,
    scratch: &mut [u8],
    piece: u32,
    offset: u32,
    block_len: usize,
    mut feed: impl FnMut(&[u8]),
) -> Result<()> {
    let loc = BlockLoc::new(storage.id(), piece, offset);
    if shard.get(loc, |cached| feed(cached)).is_some() {
        return Ok(());
    }

    let n = storage.read(&mut scratch[..block_len], piece, offset as u64)?;
    if n < block_len {
        let err = std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "device came up short while hashing",
        );
        return Err(StorageError::io(err, DiskOp::Hash, None));
    }
    feed(&scratch[..block_len]);
    Ok(())
}
