use crate::base::{Kind, Snapshot, State, Xact};
use crate::{Error, Result};
use cluster::Bck;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Verdict of a candidate provider inspecting the previous, still
/// running instance of its (kind, bucket).
pub enum RenewDecision {
    /// Short-circuit: reuse the running instance.
    Keep,
    /// Replace the running instance with a freshly started one.
    Proceed,
    /// Reject the renewal.
    Refuse(Error),
}

/// Factory producing an xaction on demand. Renew is the only way an
/// xaction comes to life.
pub trait XactProvider: Send + Sync {
    fn kind(&self) -> Kind;

    /// Called when a previous instance of the same (kind, bucket) is
    /// registered and not yet finished. The default reuses it, which
    /// gives renew its at-most-one semantics.
    fn pre_renew_hook(&self, _prev: &Arc<dyn Xact>) -> RenewDecision {
        RenewDecision::Keep
    }

    /// Construct and start the xaction. Must not block: the xaction's
    /// own run loop handles all work.
    fn start(&self, bck: Option<&Bck>) -> Result<Arc<dyn Xact>>;
}

pub struct RenewResult {
    pub xact: Arc<dyn Xact>,
    /// True when an already-running instance was reused.
    pub kept: bool,
}

impl std::fmt::Debug for RenewResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewResult")
            .field("kept", &self.kept)
            .finish_non_exhaustive()
    }
}

struct Entry {
    #[allow(dead_code)]
    provider: Arc<dyn XactProvider>,
    xact: Arc<dyn Xact>,
}

#[derive(Default)]
struct Inner {
    global: HashMap<Kind, Entry>,
    bucket: HashMap<(Kind, String), Entry>,
    by_id: HashMap<String, Arc<dyn Xact>>,
}

/// Query filter; unset fields match everything.
#[derive(Debug, Default, Clone)]
pub struct Filter {
    pub id: Option<String>,
    pub kind: Option<Kind>,
    pub bck: Option<Bck>,
    pub running: Option<bool>,
}

impl Filter {
    fn matches(&self, snap: &Snapshot) -> bool {
        if let Some(id) = &self.id {
            if *id != snap.id {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if kind != snap.kind {
                return false;
            }
        }
        if let Some(bck) = &self.bck {
            if snap.bck.as_ref() != Some(bck) {
                return false;
            }
        }
        if let Some(running) = self.running {
            if running != (snap.state == State::Running) {
                return false;
            }
        }
        true
    }
}

/// Process-wide xaction registry. Writes (renew, abort-all) are rare;
/// queries take the read lock only.
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry {
            inner: RwLock::new(Inner::default()),
        })
    }

    /// Renew the (kind, bucket) xaction. When a live previous instance
    /// exists the candidate provider arbitrates through its
    /// pre-renew hook; otherwise a fresh instance is started.
    pub fn renew(
        &self,
        provider: Arc<dyn XactProvider>,
        bck: Option<&Bck>,
    ) -> Result<RenewResult> {
        let kind = provider.kind();
        debug_assert!(
            kind.is_global() == bck.is_none(),
            "bucket scoping mismatch for {kind}"
        );
        let mut inner = self.inner.write().unwrap();

        let prev_live = {
            let entry = match bck {
                None => inner.global.get(&kind),
                Some(b) => inner.bucket.get(&(kind, b.uname())),
            };
            entry.and_then(|e| {
                if e.xact.base().finished() {
                    None
                } else {
                    Some(e.xact.clone())
                }
            })
        };

        if let Some(prev) = prev_live {
            match provider.pre_renew_hook(&prev) {
                RenewDecision::Keep => {
                    return Ok(RenewResult {
                        xact: prev,
                        kept: true,
                    });
                }
                RenewDecision::Refuse(err) => return Err(err),
                RenewDecision::Proceed => {}
            }
        }

        let xact = provider.start(bck)?;
        tracing::info!(id = %xact.base().id, %kind, "xaction started");

        let entry = Entry {
            provider,
            xact: xact.clone(),
        };
        let replaced = match bck {
            None => inner.global.insert(kind, entry),
            Some(b) => inner.bucket.insert((kind, b.uname()), entry),
        };
        // A replaced entry stops being queryable; the newer of the same
        // key evicts it.
        if let Some(old) = replaced {
            inner.by_id.remove(&old.xact.base().id);
        }
        inner.by_id.insert(xact.base().id.clone(), xact.clone());

        Ok(RenewResult { xact, kept: false })
    }

    /// The current instance for (kind, bucket), running or finished.
    pub fn get(&self, kind: Kind, bck: Option<&Bck>) -> Option<Arc<dyn Xact>> {
        let inner = self.inner.read().unwrap();
        let entry = match bck {
            None => inner.global.get(&kind),
            Some(b) => inner.bucket.get(&(kind, b.uname())),
        };
        entry.map(|e| e.xact.clone())
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<dyn Xact>> {
        self.inner.read().unwrap().by_id.get(id).cloned()
    }

    pub fn query(&self, filter: &Filter) -> Vec<Snapshot> {
        let inner = self.inner.read().unwrap();
        inner
            .by_id
            .values()
            .map(|x| x.base().snapshot())
            .filter(|s| filter.matches(s))
            .collect()
    }

    fn abort_matching<F>(&self, pred: F) -> usize
    where
        F: Fn(&Arc<dyn Xact>) -> bool,
    {
        let inner = self.inner.read().unwrap();
        let mut n = 0;
        for x in inner.by_id.values() {
            if pred(x) && x.base().abort() {
                n += 1;
            }
        }
        n
    }

    pub fn abort_all(&self) -> usize {
        self.abort_matching(|_| true)
    }

    /// Abort every bucketed xaction running on `bck`; global xactions
    /// are untouched.
    pub fn abort_all_bucket(&self, bck: &Bck) -> usize {
        self.abort_matching(|x| x.base().bck.as_ref() == Some(bck))
    }

    pub fn abort_all_global(&self) -> usize {
        self.abort_matching(|x| x.base().kind.is_global())
    }

    /// Block until every rebalance xaction of generation `reb_id`
    /// reports finished, polling at `poll` intervals.
    pub async fn wait_rebalance_done(&self, reb_id: &str, poll: Duration) {
        loop {
            let busy = {
                let inner = self.inner.read().unwrap();
                inner.by_id.values().any(|x| {
                    x.rebalance_id().as_deref() == Some(reb_id) && !x.base().finished()
                })
            };
            if !busy {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Drop every entry. Finished xactions stop being queryable.
    pub fn reset(&self) {
        let mut inner = self.inner.write().unwrap();
        *inner = Inner::default();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::XactBase;
    use std::any::Any;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestXact(XactBase);
    impl Xact for TestXact {
        fn base(&self) -> &XactBase {
            &self.0
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
        fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct TestProvider {
        kind: Kind,
        started: AtomicUsize,
    }
    impl TestProvider {
        fn new(kind: Kind) -> Arc<TestProvider> {
            Arc::new(TestProvider {
                kind,
                started: AtomicUsize::new(0),
            })
        }
    }
    impl XactProvider for TestProvider {
        fn kind(&self) -> Kind {
            self.kind
        }
        fn start(&self, bck: Option<&Bck>) -> Result<Arc<dyn Xact>> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(TestXact(XactBase::new(self.kind, bck.cloned()))))
        }
    }

    #[tokio::test]
    async fn at_most_one_under_concurrent_renew() {
        let reg = Registry::new();
        let provider = TestProvider::new(Kind::EcPut);
        let bck = Bck::ais("data");

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let (reg, provider, bck) = (reg.clone(), provider.clone(), bck.clone());
            tasks.push(tokio::spawn(async move {
                reg.renew(provider, Some(&bck)).unwrap().xact
            }));
        }
        let xacts = futures::future::try_join_all(tasks).await.unwrap();

        assert_eq!(provider.started.load(Ordering::SeqCst), 1);
        for pair in xacts.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }

    #[test]
    fn finished_instance_is_replaced() {
        let reg = Registry::new();
        let provider = TestProvider::new(Kind::Lru);

        let first = reg.renew(provider.clone(), None).unwrap();
        assert!(!first.kept);
        first.xact.base().finish();

        let second = reg.renew(provider.clone(), None).unwrap();
        assert!(!second.kept);
        assert!(!Arc::ptr_eq(&first.xact, &second.xact));
        assert_eq!(provider.started.load(Ordering::SeqCst), 2);

        // The replaced instance is no longer queryable by id.
        assert!(reg.get_by_id(&first.xact.base().id).is_none());
        assert!(reg.get_by_id(&second.xact.base().id).is_some());
    }

    #[test]
    fn abort_all_bucket_spares_global() {
        let reg = Registry::new();
        let bck = Bck::ais("from");

        let lru = reg.renew(TestProvider::new(Kind::Lru), None).unwrap().xact;
        let mv = reg
            .renew(TestProvider::new(Kind::MoveBck), Some(&bck))
            .unwrap()
            .xact;

        let n = reg.abort_all_bucket(&bck);
        assert_eq!(n, 1);
        assert!(mv.base().aborted());
        assert!(!lru.base().aborted());
        assert_eq!(lru.base().snapshot().state, State::Running);
    }

    #[test]
    fn query_filters() {
        let reg = Registry::new();
        let bck = Bck::ais("b1");
        let lru = reg.renew(TestProvider::new(Kind::Lru), None).unwrap().xact;
        reg.renew(TestProvider::new(Kind::Prefetch), Some(&bck))
            .unwrap();

        assert_eq!(reg.query(&Filter::default()).len(), 2);

        let running = reg.query(&Filter {
            running: Some(true),
            ..Default::default()
        });
        assert_eq!(running.len(), 2);

        lru.base().finish();
        let finished = reg.query(&Filter {
            running: Some(false),
            ..Default::default()
        });
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].kind, Kind::Lru);

        let by_bck = reg.query(&Filter {
            bck: Some(bck),
            ..Default::default()
        });
        assert_eq!(by_bck.len(), 1);
        assert_eq!(by_bck[0].kind, Kind::Prefetch);
    }
}
