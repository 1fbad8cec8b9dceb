use crate::base::{Kind, XactBase};
use cluster::Bck;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// A demand xaction stays alive only while requests keep arriving:
/// `idle_timeout` without a [`XactDemand::bump`] self-stops it.
pub struct XactDemand {
    pub base: XactBase,
    idle_timeout: Duration,
    // Milliseconds since `epoch` of the most recent request.
    last_ms: AtomicI64,
    epoch: Instant,
}

impl XactDemand {
    pub fn new(kind: Kind, bck: Option<Bck>, idle_timeout: Duration) -> XactDemand {
        XactDemand {
            base: XactBase::new(kind, bck),
            idle_timeout,
            last_ms: AtomicI64::new(0),
            epoch: Instant::now(),
        }
    }

    /// Record request activity, postponing the idle stop.
    pub fn bump(&self) {
        let now = self.epoch.elapsed().as_millis() as i64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    pub fn idle_expired(&self) -> bool {
        let last = self.last_ms.load(Ordering::Relaxed);
        let now = self.epoch.elapsed().as_millis() as i64;
        now - last >= self.idle_timeout.as_millis() as i64
    }

    /// Run until the xaction aborts or goes idle; in the latter case
    /// the xaction is finished in place.
    pub async fn idle_monitor(&self) {
        let mut abort = self.base.abort_watch();
        let tick = (self.idle_timeout / 4).max(Duration::from_millis(10));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {
                    if self.base.finished() {
                        return;
                    }
                    if self.idle_expired() {
                        tracing::info!(
                            id = %self.base.id,
                            kind = %self.base.kind,
                            "demand xaction idle, stopping"
                        );
                        self.base.finish();
                        return;
                    }
                }
                // wait_for observes an abort that happened before this
                // monitor subscribed.
                _ = abort.wait_for(|aborted| *aborted) => return,
            }
        }
    }
}
