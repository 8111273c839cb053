//! Periodic cache statistics reporting.
//!
//! A dedicated thread posts one snapshot job to every shard worker
//! every 30 seconds. The owning worker reads its own counters and logs
//! a single line; no shard state crosses a thread boundary.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::disk::job::Job;

/// Gauges filled by `DiskIo::update_stats_counters` before the session
/// snapshots its counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskGauges {
    /// Pool buffers currently live.
    pub blocks_in_use: usize,
    /// Whether the pool's backpressure latch is set.
    pub pool_exceeded: bool,
}

const REPORT_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) struct StatsReporter {
    stop_tx: Sender<()>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl StatsReporter {
    pub(crate) fn spawn(workers: Vec<Sender<Job>>) -> Self {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let join = std::thread::Builder::new()
            .name("disk-stats".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(REPORT_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => {
                        for tx in &workers {
                            let _ = tx.send(Job::LogStats);
                        }
                    }
                    // Stop requested or the engine went away.
                    _ => break,
                }
            })
            .expect("failed to spawn stats reporter");
        Self {
            stop_tx,
            join: Mutex::new(Some(join)),
        }
    }

    pub(crate) fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    pub(crate) fn join(&self) {
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}
