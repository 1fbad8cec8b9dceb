//! Host memory accounting: pressure classification, a pooled
//! scatter-gather buffer (SGL), and a reservation budget used by
//! memory-intensive jobs to decide between RAM and disk spill.

mod pressure;
mod sgl;

pub use pressure::{proc_rss, Pressure, ProcReader, Usage, UsageReader};
pub use sgl::{MemPool, Sgl, SglReader, SLAB_SIZE};

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read memory stats")]
    Stats(#[source] std::io::Error),
}

/// Budget tracks a process-wide memory cap together with the amount of
/// memory callers have reserved but not yet allocated. Jobs reserve the
/// expected footprint up front so that the spill decision can be made
/// before any allocation happens.
pub struct Budget {
    max_to_use: u64,
    reserved: AtomicI64,
    actual_used: AtomicU64,
    reader: Arc<dyn UsageReader>,
}

impl Budget {
    pub fn new(max_to_use: u64, reader: Arc<dyn UsageReader>) -> Budget {
        Budget {
            max_to_use,
            reserved: AtomicI64::new(0),
            actual_used: AtomicU64::new(0),
            reader,
        }
    }

    pub fn max_to_use(&self) -> u64 {
        self.max_to_use
    }

    /// Refresh the cached view of actual process usage. Called
    /// periodically by the reserved-memory watcher.
    pub fn refresh_usage(&self) -> Result<Usage, Error> {
        let usage = self.reader.usage().map_err(Error::Stats)?;
        self.actual_used.store(usage.actual_used, Ordering::Relaxed);
        Ok(usage)
    }

    pub fn actual_used(&self) -> u64 {
        self.actual_used.load(Ordering::Relaxed)
    }

    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Relaxed).max(0) as u64
    }

    /// Reserve `n` bytes of expected usage. Returns false ("exceeding")
    /// when the reservation would push projected usage past the cap, in
    /// which case nothing is reserved and the caller should spill.
    pub fn try_reserve(&self, n: u64) -> bool {
        let mut cur = self.reserved.load(Ordering::Relaxed);
        loop {
            let projected = self.actual_used() + cur.max(0) as u64 + n;
            if projected > self.max_to_use {
                return false;
            }
            match self.reserved.compare_exchange_weak(
                cur,
                cur + n as i64,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Release a prior reservation. The counter saturates at zero: an
    /// unreserve can never drive it negative.
    pub fn unreserve(&self, n: u64) {
        let mut cur = self.reserved.load(Ordering::Relaxed);
        loop {
            let next = (cur - n as i64).max(0);
            match self.reserved.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Projected usage is above the cap by this many bytes (zero when
    /// under the cap). The excess watcher spills this much.
    pub fn excess(&self) -> u64 {
        self.actual_used().saturating_sub(self.max_to_use)
    }
}
