//! The job memory watcher: a fast loop keeping the reservation
//! accounting fresh, and a slower loop that spills SGL-backed record
//! payloads once actual usage crosses the job's cap. Spill is one-way
//! within a job; records never return to memory.

use crate::records::RecordObj;
use memsys::{Budget, MemPool};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Bound on queued unreserve notifications; the reserved counter can
/// never go negative, so dropping excess notifications is safe.
pub const UNRESERVE_BUF: usize = 10_000;

pub const RESERVED_INTERVAL: Duration = Duration::from_millis(50);
pub const EXCESS_INTERVAL: Duration = Duration::from_secs(1);

/// Registry of SGL-backed record objects eligible for spilling,
/// shared between the extractors and the excess watcher.
pub struct Contents {
    objs: Mutex<Vec<Arc<RecordObj>>>,
}

impl Contents {
    pub fn new() -> Arc<Contents> {
        Arc::new(Contents {
            objs: Mutex::new(Vec::new()),
        })
    }

    pub fn push(&self, obj: Arc<RecordObj>) {
        self.objs.lock().unwrap().push(obj);
    }

    pub fn len(&self) -> usize {
        self.objs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_by_kind(&self) -> (usize, usize, usize) {
        let objs = self.objs.lock().unwrap();
        let mut counts = (0, 0, 0);
        for o in objs.iter() {
            match o.store_kind() {
                crate::records::StoreKind::Sgl => counts.0 += 1,
                crate::records::StoreKind::Disk => counts.1 += 1,
                crate::records::StoreKind::Offset => counts.2 += 1,
            }
        }
        counts
    }

    fn snapshot(&self) -> Vec<Arc<RecordObj>> {
        self.objs.lock().unwrap().clone()
    }
}

/// Bounded unreserve queue, drained by the reserved watcher.
pub fn unreserve_channel() -> (mpsc::Sender<u64>, mpsc::Receiver<u64>) {
    mpsc::channel(UNRESERVE_BUF)
}

pub struct Watcher {
    budget: Arc<Budget>,
    pool: Arc<MemPool>,
    contents: Arc<Contents>,
    workdir: PathBuf,
}

impl Watcher {
    pub fn new(
        budget: Arc<Budget>,
        pool: Arc<MemPool>,
        contents: Arc<Contents>,
        workdir: PathBuf,
    ) -> Arc<Watcher> {
        Arc::new(Watcher {
            budget,
            pool,
            contents,
            workdir,
        })
    }

    /// Fast loop: refresh usage and drain unreserve notifications.
    /// Stops on job abort or the watcher's own stop signal.
    pub async fn run_reserved(
        self: Arc<Self>,
        mut unreserve_rx: mpsc::Receiver<u64>,
        mut abort: watch::Receiver<bool>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(RESERVED_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.budget.refresh_usage() {
                        tracing::warn!(%err, "cannot refresh memory usage");
                    }
                    while let Ok(n) = unreserve_rx.try_recv() {
                        self.budget.unreserve(n);
                    }
                }
                _ = abort.wait_for(|v| *v) => return,
                _ = stop.wait_for(|v| *v) => return,
            }
        }
    }

    /// Slow loop: when actual usage exceeds the cap, flip just enough
    /// SGL records to disk (or back to their source archive) to
    /// recover the excess, then release spare slabs.
    pub async fn run_excess(
        self: Arc<Self>,
        mut abort: watch::Receiver<bool>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(EXCESS_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let excess = self.budget.excess();
                    if excess > 0 {
                        self.spill(excess);
                    }
                }
                _ = abort.wait_for(|v| *v) => return,
                _ = stop.wait_for(|v| *v) => return,
            }
        }
    }

    /// Spill SGL records whose cumulative size covers `need` bytes,
    /// and not more. Returns the bytes actually freed.
    pub fn spill(&self, need: u64) -> u64 {
        let mut remaining = need;
        let mut freed_total = 0u64;
        let mut flipped = 0usize;

        for obj in self.contents.snapshot() {
            if remaining == 0 {
                break;
            }
            match obj.spill(&self.workdir) {
                Ok(0) => {} // already disk- or offset-backed
                Ok(freed) => {
                    self.budget.unreserve(freed);
                    freed_total += freed;
                    remaining = remaining.saturating_sub(freed);
                    flipped += 1;
                }
                Err(err) => {
                    tracing::warn!(%err, "record spill failed");
                }
            }
        }

        self.pool.free_spare();
        if flipped > 0 {
            tracing::info!(
                need,
                freed = freed_total,
                records = flipped,
                "spilled records under memory pressure"
            );
        }
        freed_total
    }
}
