//! Cache housekeeping: periodically evict aged metadata entries, with
//! the eviction horizon shrinking as host memory pressure rises. Dirty
//! entries are flushed to the metadata store before removal.

use crate::cache::LomCaches;
use crate::meta::MetaStore;
use crate::now_ns;
use memsys::{Pressure, UsageReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A mountpath whose jogger queue is longer than this is skipped for
/// one run rather than piling metadata flushes onto a busy disk.
pub const JOGGER_BUSY_THRESHOLD: usize = 16;

const INITIAL_INTERVAL: Duration = Duration::from_secs(30 * 60);
const MIN_INTERVAL: Duration = Duration::from_secs(10 * 60);
const MAX_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Totals of one housekeeping run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunStats {
    pub evicted: usize,
    pub flushed: usize,
    pub skipped_mpaths: usize,
}

/// Callback reporting per-mountpath disk business, typically wired to
/// the EC jogger queue lengths.
pub type BusyFn = Box<dyn Fn(&Path) -> usize + Send + Sync>;

pub struct Housekeeper {
    caches: Arc<LomCaches>,
    store: Arc<dyn MetaStore>,
    usage: Arc<dyn UsageReader>,
    busy: Option<BusyFn>,
    running: AtomicBool,
}

impl Housekeeper {
    pub fn new(
        caches: Arc<LomCaches>,
        store: Arc<dyn MetaStore>,
        usage: Arc<dyn UsageReader>,
        busy: Option<BusyFn>,
    ) -> Arc<Housekeeper> {
        Arc::new(Housekeeper {
            caches,
            store,
            usage,
            busy,
            running: AtomicBool::new(false),
        })
    }

    /// The eviction horizon for a given pressure level: entries younger
    /// than this survive the run.
    fn horizon(p: Pressure) -> Duration {
        match p {
            Pressure::Oom => Duration::from_secs(5 * 60),
            Pressure::Extreme => Duration::from_secs(10 * 60),
            Pressure::High => Duration::from_secs(20 * 60),
            Pressure::Normal | Pressure::Low => Duration::from_secs(60 * 60),
        }
    }

    /// One housekeeping pass. Returns the delay until the next run and
    /// the totals, or only the delay when a pass is already in flight.
    pub fn run_once(&self) -> (Duration, Option<RunStats>) {
        let pressure = match self.usage.usage() {
            Ok(u) => u.pressure(),
            Err(err) => {
                tracing::warn!(%err, "cannot read memory usage; assuming normal pressure");
                Pressure::Normal
            }
        };
        let horizon = Self::horizon(pressure);
        let next = (horizon / 2).clamp(MIN_INTERVAL, MAX_INTERVAL);

        // Eviction must never race with itself.
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::info!("lom housekeeping already running");
            return (next, None);
        }

        let mut stats = RunStats::default();
        let now = now_ns();
        let horizon_ns = horizon.as_nanos() as i64;

        for (mpath, cache) in self.caches.all() {
            if let Some(busy) = &self.busy {
                let qlen = busy(&mpath);
                if qlen > JOGGER_BUSY_THRESHOLD {
                    tracing::debug!(mpath = %mpath.display(), qlen, "skipping busy mountpath");
                    stats.skipped_mpaths += 1;
                    continue;
                }
            }

            cache.retain(|_, entry| {
                let md = entry.md.lock().unwrap();
                let atime = md.atime_normalized();
                if now - atime < horizon_ns {
                    return true;
                }
                if md.is_dirty() {
                    let mut flushed = md.clone();
                    flushed.atimefs = flushed.atime;
                    drop(md);
                    match serde_json::to_vec(&flushed) {
                        Ok(raw) => {
                            if let Err(err) = self.store.write(&entry.fqn, &raw) {
                                tracing::warn!(fqn = %entry.fqn.display(), %err,
                                    "failed to flush dirty lom; keeping entry");
                                return true;
                            }
                            stats.flushed += 1;
                        }
                        Err(err) => {
                            tracing::error!(fqn = %entry.fqn.display(), %err,
                                "cannot serialize lom");
                            return true;
                        }
                    }
                }
                stats.evicted += 1;
                false
            });
        }

        self.running.store(false, Ordering::Release);

        if pressure >= Pressure::High {
            tracing::info!(
                %pressure,
                evicted = stats.evicted,
                flushed = stats.flushed,
                "lom cache evicted under memory pressure"
            );
        }
        (next, Some(stats))
    }

    /// Periodic loop; the first run happens after the initial interval.
    pub async fn run(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut delay = INITIAL_INTERVAL;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let (next, _) = self.run_once();
                    delay = next;
                }
                _ = stop.changed() => return,
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::{fingerprint, CachedLom, LomCache};
    use crate::meta::MemStore;
    use crate::Lmeta;
    use memsys::Usage;
    use std::path::PathBuf;

    #[derive(Debug)]
    struct PressureReader(u64); // available percent
    impl UsageReader for PressureReader {
        fn usage(&self) -> std::io::Result<Usage> {
            Ok(Usage {
                total: 100,
                available: self.0,
                used: 100 - self.0,
                actual_used: 0,
                swap_used: 0,
            })
        }
    }

    fn caches_with_entries(entries: &[(&str, Lmeta)]) -> (Arc<LomCaches>, PathBuf) {
        let mp = Arc::new(volume::Mountpath::for_tests("/data/mp1"));
        let caches = LomCaches::new(&[mp.clone()]);
        let cache: Arc<LomCache> = caches.cache(&mp.path).unwrap();
        for (name, md) in entries {
            cache.insert(
                fingerprint(name),
                Arc::new(CachedLom::new(PathBuf::from(format!("/data/mp1/ob/{name}")), md.clone())),
            );
        }
        (caches, mp.path.clone())
    }

    #[test]
    fn evicts_old_flushes_dirty() {
        let now = now_ns();
        let hour = Duration::from_secs(3600).as_nanos() as i64;

        let (caches, mpath) = caches_with_entries(&[
            // Old and dirty: must be flushed, then evicted.
            (
                "dirty-old",
                Lmeta {
                    atime: now - hour,
                    atimefs: now - 2 * hour,
                    ..Default::default()
                },
            ),
            // Old and clean: evicted without a flush.
            (
                "clean-old",
                Lmeta {
                    atime: now - hour,
                    atimefs: now - hour,
                    ..Default::default()
                },
            ),
            // Fresh: survives.
            (
                "fresh",
                Lmeta {
                    atime: now,
                    atimefs: now,
                    ..Default::default()
                },
            ),
            // Prefetched long ago, never accessed: negative atime
            // normalizes, entry is not dirty, gets evicted.
            (
                "prefetched-old",
                Lmeta {
                    atime: -(now - hour),
                    atimefs: 0,
                    ..Default::default()
                },
            ),
        ]);

        let store = Arc::new(MemStore::default());
        // High pressure: 20 minute horizon.
        let hk = Housekeeper::new(
            caches.clone(),
            store.clone(),
            Arc::new(PressureReader(9)),
            None,
        );

        let (next, stats) = hk.run_once();
        let stats = stats.unwrap();
        assert_eq!(stats.evicted, 3);
        assert_eq!(stats.flushed, 1);
        assert_eq!(next, Duration::from_secs(10 * 60));

        let cache = caches.cache(&mpath).unwrap();
        assert_eq!(cache.len(), 1);
        assert!(cache.get(fingerprint("fresh")).is_some());

        // The flushed record carries the in-memory atime.
        let raw = store.get(&PathBuf::from("/data/mp1/ob/dirty-old")).unwrap();
        let flushed: Lmeta = serde_json::from_slice(&raw).unwrap();
        assert_eq!(flushed.atime, now - hour);
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn cas_guard_blocks_reentry() {
        let (caches, _) = caches_with_entries(&[(
            "old",
            Lmeta {
                atime: 1,
                atimefs: 1,
                ..Default::default()
            },
        )]);
        let hk = Housekeeper::new(
            caches,
            Arc::new(MemStore::default()),
            Arc::new(PressureReader(40)),
            None,
        );

        hk.running.store(true, Ordering::Release);
        let (next, stats) = hk.run_once();
        assert!(stats.is_none());
        assert_eq!(next, Duration::from_secs(30 * 60));
    }

    #[test]
    fn busy_mountpath_skipped() {
        let now = now_ns();
        let (caches, mpath) = caches_with_entries(&[(
            "old",
            Lmeta {
                atime: now - Duration::from_secs(7200).as_nanos() as i64,
                atimefs: 0,
                ..Default::default()
            },
        )]);
        let hk = Housekeeper::new(
            caches.clone(),
            Arc::new(MemStore::default()),
            Arc::new(PressureReader(40)),
            Some(Box::new(|_| JOGGER_BUSY_THRESHOLD + 1)),
        );

        let (_, stats) = hk.run_once();
        let stats = stats.unwrap();
        assert_eq!(stats.skipped_mpaths, 1);
        assert_eq!(stats.evicted, 0);
        assert_eq!(caches.cache(&mpath).unwrap().len(), 1);
    }
}
