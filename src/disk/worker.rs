//! Shard worker threads.
//!
//! Each worker owns one [`CachePartition`] outright. The partition is
//! moved into the thread and never escapes it; everything the rest of
//! the engine learns about a shard comes back through job replies.

use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::cache::{BlockLoc, CachePartition, PoolBuffer, BLOCK_SIZE};
use crate::error::Result;
use crate::hasher;
use crate::storage::PartitionStorage;

use super::job::Job;
use super::BlockRequest;

pub(crate) struct ShardWorker {
    pub(crate) tx: Sender<Job>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl ShardWorker {
    pub(crate) fn spawn(index: usize, max_entries: usize, callbacks: Handle) -> Self {
        let (tx, rx) = unbounded();
        let join = std::thread::Builder::new()
            .name(format!("disk-io-{index}"))
            .spawn(move || run(index, max_entries, rx, callbacks))
            .expect("failed to spawn shard worker");
        Self {
            tx,
            join: Mutex::new(Some(join)),
        }
    }

    pub(crate) fn join(&self) {
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}

fn run(index: usize, max_entries: usize, rx: Receiver<Job>, callbacks: Handle) {
    let mut shard = CachePartition::new(max_entries);
    tracing::debug!("disk-io-{} up, quota {} entries", index, max_entries);

    for job in rx.iter() {
        match job {
            Job::Read {
                storage,
                req,
                mut buf,
                handler,
            } => {
                let result = read_block(&mut shard, &storage, &req, &mut buf);
                let out = result.map(|n| {
                    buf.set_len(n);
                    buf
                });
                callbacks.spawn(async move { handler(out) });
            }
            Job::Write {
                storage,
                req,
                buf,
                handler,
            } => {
                let result = write_block(&mut shard, &storage, &req, buf.filled());
                // The carrier did its job; release the pool slot before
                // the completion lands.
                drop(buf);
                callbacks.spawn(async move { handler(result.err()) });
            }
            Job::WriteDirect {
                storage,
                req,
                data,
                handler,
            } => {
                let result = storage.write(&data, req.piece, req.start as u64);
                callbacks.spawn(async move { handler(result.err()) });
            }
            Job::Hash {
                storage,
                piece,
                mut scratch,
                handler,
            } => {
                let digest = hasher::hash_piece(&storage, &mut shard, scratch.space(), piece);
                drop(scratch);
                callbacks.spawn(async move { handler(piece, digest) });
            }
            Job::Hash2 {
                storage,
                piece,
                offset,
                mut scratch,
                handler,
            } => {
                let digest =
                    hasher::hash_block(&storage, &mut shard, scratch.space(), piece, offset);
                drop(scratch);
                callbacks.spawn(async move { handler(piece, digest) });
            }
            Job::Flush { storage, barrier } => {
                flush_storage(&mut shard, &storage);
                barrier.arrive();
            }
            Job::RemoveStorage { storage } => {
                flush_storage(&mut shard, &storage);
                shard.remove_storage(storage.id());
            }
            Job::ClearPiece { piece, handler } => {
                callbacks.spawn(async move { handler(piece) });
            }
            Job::SetMaxEntries(max_entries) => {
                shard.set_max_entries(max_entries);
            }
            Job::LogStats => {
                let s = shard.stats_snapshot();
                tracing::info!(
                    "cache shard {}: {}/{} entries ({} dirty), {} hits, {} misses, {} inserts, {} evictions",
                    index,
                    s.entries,
                    s.capacity,
                    s.dirty,
                    s.hits,
                    s.misses,
                    s.inserts,
                    s.evictions
                );
            }
            Job::ResetStats => {
                shard.reset_stats();
            }
            Job::SnapshotStats { reply } => {
                let _ = reply.send(shard.stats_snapshot());
            }
            Job::Shutdown => break,
        }
    }

    tracing::debug!("disk-io-{} exiting", index);
}

/// The read path. Whole-block requests are served from the cache and
/// cached on miss; anything narrower or unaligned goes around the cache
/// on miss so partially filled blocks never pollute it.
fn read_block(
    shard: &mut CachePartition,
    storage: &PartitionStorage,
    req: &BlockRequest,
    buf: &mut PoolBuffer,
) -> Result<usize> {
    let len = req.length as usize;
    let block_offset = req.start - (req.start % BLOCK_SIZE as u32);
    let read_offset = (req.start - block_offset) as usize;
    let loc1 = BlockLoc::new(storage.id(), req.piece, block_offset);

    let piece_size = storage.piece_size(req.piece);
    let block_payload = (piece_size - block_offset as u64).min(BLOCK_SIZE as u64) as usize;

    if read_offset == 0 && len == block_payload {
        if let Some(n) = shard.get(loc1, |cached| {
            let n = len.min(cached.len());
            buf.space()[..n].copy_from_slice(&cached[..n]);
            n
        }) {
            return Ok(n);
        }
        let n = storage.read(&mut buf.space()[..len], req.piece, req.start as u64)?;
        if n > 0 {
            shard.insert_read(loc1, &buf.space()[..n]);
        }
        return Ok(n);
    }

    if read_offset + len <= BLOCK_SIZE {
        // Partial view of a single block.
        if let Some(n) = shard.get(loc1, |cached| {
            let end = (read_offset + len).min(cached.len());
            let n = end.saturating_sub(read_offset);
            buf.space()[..n].copy_from_slice(&cached[read_offset..end]);
            n
        }) {
            return Ok(n);
        }
        return storage.read(&mut buf.space()[..len], req.piece, req.start as u64);
    }

    // The range crosses into the next block. Both blocks belong to the
    // same piece, hence to this shard.
    let loc2 = BlockLoc::new(storage.id(), req.piece, block_offset + BLOCK_SIZE as u32);
    let first_len = BLOCK_SIZE - read_offset;
    let second_len = len - first_len;

    let (mask, _) = shard.get2(loc1, loc2, |b1, b2| {
        if let Some(b1) = b1 {
            buf.space()[..first_len].copy_from_slice(&b1[read_offset..read_offset + first_len]);
        }
        if let Some(b2) = b2 {
            buf.space()[first_len..len].copy_from_slice(&b2[..second_len]);
        }
    });

    match mask {
        3 => Ok(len),
        2 => {
            let n = storage.read(
                &mut buf.space()[first_len..len],
                req.piece,
                (req.start + first_len as u32) as u64,
            )?;
            Ok(first_len + n)
        }
        1 => {
            let n = storage.read(&mut buf.space()[..first_len], req.piece, req.start as u64)?;
            if n < first_len {
                Ok(n)
            } else {
                Ok(len)
            }
        }
        _ => storage.read(&mut buf.space()[..len], req.piece, req.start as u64),
    }
}

/// Write-through: the cache copy is made first, then the device write;
/// mark-clean only happens after the device confirms. A failed
/// write-through leaves the entry dirty for a later flush.
fn write_block(
    shard: &mut CachePartition,
    storage: &PartitionStorage,
    req: &BlockRequest,
    data: &[u8],
) -> Result<()> {
    let loc = BlockLoc::new(storage.id(), req.piece, req.start);
    let cached = shard.insert_write(loc, data);
    if !cached {
        tracing::warn!(
            "write {}:{}+{}: cache insert failed, writing through uncached",
            storage.id(),
            req.piece,
            req.start
        );
    }

    storage.write(data, req.piece, req.start as u64)?;

    if cached {
        shard.mark_clean(loc);
    }
    Ok(())
}

fn flush_storage(shard: &mut CachePartition, storage: &PartitionStorage) {
    let dirty = shard.collect_dirty_for(storage.id());
    if dirty.is_empty() {
        return;
    }
    tracing::debug!(
        "flushing {} dirty blocks for storage {}",
        dirty.len(),
        storage.id()
    );
    for loc in dirty {
        let result = shard.peek(loc, |data| storage.write(data, loc.piece, loc.offset as u64));
        if let Some(Err(e)) = result {
            tracing::error!(
                "flush {}:{}+{} failed: {}",
                storage.id(),
                loc.piece,
                loc.offset,
                e
            );
        }
    }
}
