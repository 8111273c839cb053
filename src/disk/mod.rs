//! The asynchronous disk engine.
//!
//! [`DiskIo`] is the surface the BitTorrent session talks to. Every
//! `async_*` call validates, picks the shard that owns the addressed
//! piece, posts a job to that shard's worker thread, and returns
//! immediately. The worker performs cache and device work and posts the
//! completion handler on the callback executor the session supplied at
//! construction; no handler ever runs on a worker thread.
//!
//! # Dispatch rule
//!
//! The shard for a request is `shard_index(storage, piece)`. One worker
//! thread owns one shard, so operations addressing the same piece
//! serialize in posting order, and a write observed complete is visible
//! to every later read of the same block.

mod engine;
pub(crate) mod job;
mod worker;

pub use engine::DiskIo;
pub use job::{Hash2Handler, HashHandler, PieceHandler, ReadHandler, WriteHandler};


/// A block-granularity request from the protocol core. `start` is a
/// byte offset within the piece; reads may start unaligned, writes are
/// always block-aligned. `length` never exceeds one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub piece: u32,
    pub start: u32,
    pub length: u32,
}

impl BlockRequest {
    pub fn new(piece: u32, start: u32, length: u32) -> Self {
        Self {
            piece,
            start,
            length,
        }
    }
}
