//! Counting allocator for transient 16 KiB I/O buffers.
//!
//! The pool does not recycle memory; it bounds how many block buffers
//! exist at once and turns that bound into backpressure. Allocation
//! fails once `max_count` buffers are live. Crossing the high watermark
//! latches `exceeded`; when enough buffers are freed to fall to the low
//! watermark, the latch clears and every registered observer is woken
//! on the engine's callback executor.
//!
//! Observers are held weakly: a peer that gave up waiting simply drops
//! its observer and is skipped at wake-up time.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;

use super::BLOCK_SIZE;

/// One-shot capability the protocol core uses to wait for the pool to
/// recover from exhaustion.
pub trait DiskObserver: Send + Sync {
    fn on_disk(&self);
}

struct PoolInner {
    in_use: usize,
    max_count: usize,
    low_watermark: usize,
    high_watermark: usize,
    exceeded: bool,
    observers: Vec<Weak<dyn DiskObserver>>,
}

impl PoolInner {
    fn set_bounds(&mut self, max_count: usize) {
        self.max_count = max_count;
        self.low_watermark = max_count / 2;
        self.high_watermark = max_count * 7 / 8;
        if self.in_use >= self.max_count {
            self.exceeded = true;
        }
    }
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    callbacks: Handle,
}

impl PoolShared {
    fn release_one(&self) {
        let to_notify = {
            let mut inner = self.inner.lock();
            inner.in_use -= 1;
            if !inner.exceeded || inner.in_use > inner.low_watermark {
                None
            } else {
                inner.exceeded = false;
                Some(std::mem::take(&mut inner.observers))
            }
        };

        // Observers run on the callback executor, never under the pool
        // lock and never on the freeing thread.
        if let Some(observers) = to_notify {
            if observers.is_empty() {
                return;
            }
            self.callbacks.spawn(async move {
                for observer in observers {
                    if let Some(observer) = observer.upgrade() {
                        observer.on_disk();
                    }
                }
            });
        }
    }
}

pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// `pool_size` is in bytes; the pool holds at most
    /// `pool_size / 16384` buffers.
    pub fn new(callbacks: Handle, pool_size: usize) -> Self {
        let mut inner = PoolInner {
            in_use: 0,
            max_count: 0,
            low_watermark: 0,
            high_watermark: 0,
            exceeded: false,
            observers: Vec::new(),
        };
        inner.set_bounds(pool_size / BLOCK_SIZE);
        Self {
            shared: Arc::new(PoolShared {
                inner: Mutex::new(inner),
                callbacks,
            }),
        }
    }

    pub fn allocate(&self) -> Option<PoolBuffer> {
        let mut inner = self.shared.inner.lock();
        self.allocate_locked(&mut inner)
    }

    /// Allocates and reports the `exceeded` latch. If the latch is set
    /// the observer (when given) is queued for the recovery wake-up.
    pub fn allocate_with_observer(
        &self,
        observer: Option<&Arc<dyn DiskObserver>>,
    ) -> (Option<PoolBuffer>, bool) {
        let mut inner = self.shared.inner.lock();
        let buf = self.allocate_locked(&mut inner);
        if inner.exceeded {
            if let Some(observer) = observer {
                inner.observers.push(Arc::downgrade(observer));
            }
        }
        (buf, inner.exceeded)
    }

    /// Re-derives the buffer bound from a new pool size in bytes.
    pub fn set_limit(&self, pool_size: usize) {
        let mut inner = self.shared.inner.lock();
        inner.set_bounds(pool_size / BLOCK_SIZE);
    }

    pub fn in_use(&self) -> usize {
        self.shared.inner.lock().in_use
    }

    pub fn is_exceeded(&self) -> bool {
        self.shared.inner.lock().exceeded
    }

    fn allocate_locked(&self, inner: &mut PoolInner) -> Option<PoolBuffer> {
        if inner.in_use >= inner.max_count {
            inner.exceeded = true;
            return None;
        }
        if inner.in_use > inner.high_watermark {
            inner.exceeded = true;
        }

        let mut buf = Vec::new();
        if buf.try_reserve_exact(BLOCK_SIZE).is_err() {
            inner.exceeded = true;
            return None;
        }
        buf.resize(BLOCK_SIZE, 0);

        inner.in_use += 1;
        Some(PoolBuffer {
            buf,
            len: 0,
            pool: Arc::clone(&self.shared),
        })
    }
}

/// A move-only block buffer. Dropping it returns its pool slot; the
/// accounting is what matters, the bytes are freed normally.
pub struct PoolBuffer {
    buf: Vec<u8>,
    len: usize,
    pool: Arc<PoolShared>,
}

impl PoolBuffer {
    /// The payload written so far.
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The whole 16 KiB block as writable scratch.
    pub fn space(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= BLOCK_SIZE);
        self.len = len;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn copy_from(&mut self, src: &[u8]) {
        assert!(src.len() <= BLOCK_SIZE);
        self.buf[..src.len()].copy_from_slice(src);
        self.len = src.len();
    }
}

impl std::ops::Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.filled()
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer").field("len", &self.len).finish()
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        self.pool.release_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    struct NotifyObserver {
        tx: mpsc::Sender<()>,
    }

    impl DiskObserver for NotifyObserver {
        fn on_disk(&self) {
            self.tx.send(()).unwrap();
        }
    }

    fn pool_of(blocks: usize, rt: &tokio::runtime::Runtime) -> BufferPool {
        BufferPool::new(rt.handle().clone(), blocks * BLOCK_SIZE)
    }

    #[test]
    fn accounting_returns_to_zero() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pool = pool_of(8, &rt);

        let bufs: Vec<_> = (0..8).map(|_| pool.allocate().unwrap()).collect();
        assert_eq!(pool.in_use(), 8);

        drop(bufs);
        assert_eq!(pool.in_use(), 0);
        assert!(!pool.is_exceeded());
    }

    #[test]
    fn allocation_fails_at_the_limit() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pool = pool_of(2, &rt);

        let _a = pool.allocate().unwrap();
        let _b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());
        assert!(pool.is_exceeded());
    }

    #[test]
    fn backpressure_cycle_fires_observer_once() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pool = pool_of(4, &rt);
        let (tx, rx) = mpsc::channel();
        let observer: Arc<dyn DiskObserver> = Arc::new(NotifyObserver { tx });

        // Four buffers fit, the fifth request fails and latches.
        let mut held = Vec::new();
        for _ in 0..4 {
            let (buf, _) = pool.allocate_with_observer(Some(&observer));
            held.push(buf.unwrap());
        }
        let (buf, exceeded) = pool.allocate_with_observer(Some(&observer));
        assert!(buf.is_none());
        assert!(exceeded);

        // One free leaves usage above the low watermark; no wake-up.
        held.pop();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // The second free reaches the low watermark (2 of 4).
        held.pop();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(rx.try_recv().is_err(), "observer fired more than once");

        let (buf, exceeded) = pool.allocate_with_observer(Some(&observer));
        assert!(buf.is_some());
        assert!(!exceeded);
    }

    #[test]
    fn dropped_observers_are_skipped() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pool = pool_of(2, &rt);
        let (tx, rx) = mpsc::channel();

        let gone: Arc<dyn DiskObserver> = Arc::new(NotifyObserver { tx: tx.clone() });
        let kept: Arc<dyn DiskObserver> = Arc::new(NotifyObserver { tx });

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let (none, exceeded) = pool.allocate_with_observer(Some(&gone));
        assert!(none.is_none() && exceeded);
        let (none, _) = pool.allocate_with_observer(Some(&kept));
        assert!(none.is_none());

        drop(gone);
        drop(a);
        drop(b);

        // Only the surviving observer is called.
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn shrinking_the_limit_latches_exceeded() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pool = pool_of(8, &rt);

        let _held: Vec<_> = (0..4).map(|_| pool.allocate().unwrap()).collect();
        assert!(!pool.is_exceeded());

        pool.set_limit(2 * BLOCK_SIZE);
        assert!(pool.is_exceeded());
        assert!(pool.allocate().is_none());
    }

    #[test]
    fn buffer_accessors_track_the_payload() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let pool = pool_of(2, &rt);

        let mut buf = pool.allocate().unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.space().len(), BLOCK_SIZE);

        buf.copy_from(&[1, 2, 3]);
        assert_eq!(buf.filled(), &[1, 2, 3]);
        assert_eq!(&buf[..], &[1, 2, 3]);
        assert_eq!(buf.len(), 3);
    }
}
