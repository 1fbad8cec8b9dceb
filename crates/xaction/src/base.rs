use cluster::Bck;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;
use tokio::sync::watch;

/// Xaction kinds. Global kinds run once per node; bucketed kinds run
/// once per (kind, bucket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Lru,
    Rebalance,
    Resilver,
    Election,
    EcGet,
    EcPut,
    EcRespond,
    MoveBck,
    EvictDelete,
    Prefetch,
    Dsort,
}

impl Kind {
    pub fn is_global(self) -> bool {
        matches!(
            self,
            Kind::Lru | Kind::Rebalance | Kind::Resilver | Kind::Election
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Lru => "lru",
            Kind::Rebalance => "rebalance",
            Kind::Resilver => "resilver",
            Kind::Election => "election",
            Kind::EcGet => "ec-get",
            Kind::EcPut => "ec-put",
            Kind::EcRespond => "ec-respond",
            Kind::MoveBck => "move-bck",
            Kind::EvictDelete => "evict-delete",
            Kind::Prefetch => "prefetch",
            Kind::Dsort => "dsort",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic per-xaction counters, updated by workers.
#[derive(Debug, Default)]
pub struct XactStats {
    pub objs: AtomicI64,
    pub bytes: AtomicI64,
    pub in_objs: AtomicI64,
    pub in_bytes: AtomicI64,
}

impl XactStats {
    pub fn add_obj(&self, bytes: i64) {
        self.objs.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_in_obj(&self, bytes: i64) {
        self.in_objs.fetch_add(1, Ordering::Relaxed);
        self.in_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Finished,
    Aborted,
}

/// Queryable point-in-time view of an xaction.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub kind: Kind,
    pub bck: Option<Bck>,
    pub start: SystemTime,
    pub end: Option<SystemTime>,
    pub state: State,
    pub objs: i64,
    pub bytes: i64,
    pub in_objs: i64,
    pub in_bytes: i64,
}

/// Common state of every xaction. Concrete xactions embed an XactBase
/// and expose it through [`Xact::base`].
pub struct XactBase {
    pub id: String,
    pub kind: Kind,
    pub bck: Option<Bck>,
    pub stats: XactStats,
    start: SystemTime,
    end: Mutex<Option<SystemTime>>,
    aborted: AtomicBool,
    abort_tx: watch::Sender<bool>,
}

impl XactBase {
    pub fn new(kind: Kind, bck: Option<Bck>) -> XactBase {
        let (abort_tx, _) = watch::channel(false);
        XactBase {
            id: uuid::Uuid::new_v4().simple().to_string(),
            kind,
            bck,
            stats: XactStats::default(),
            start: SystemTime::now(),
            end: Mutex::new(None),
            aborted: AtomicBool::new(false),
            abort_tx,
        }
    }

    /// Broadcast channel closed exactly once on abort. Every worker and
    /// watcher of the xaction selects on this.
    pub fn abort_watch(&self) -> watch::Receiver<bool> {
        self.abort_tx.subscribe()
    }

    /// Idempotent. Returns true only for the call that performed the
    /// abort. Abort dominates normal completion in external views.
    pub fn abort(&self) -> bool {
        if self
            .aborted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        let _ = self.abort_tx.send(true);
        self.finish();
        tracing::info!(id = %self.id, kind = %self.kind, "xaction aborted");
        true
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Mark normal completion. Idempotent; the first end time sticks.
    pub fn finish(&self) {
        let mut end = self.end.lock().unwrap();
        if end.is_none() {
            *end = Some(SystemTime::now());
        }
    }

    pub fn finished(&self) -> bool {
        self.end.lock().unwrap().is_some()
    }

    pub fn snapshot(&self) -> Snapshot {
        let end = *self.end.lock().unwrap();
        let state = if self.aborted() {
            State::Aborted
        } else if end.is_some() {
            State::Finished
        } else {
            State::Running
        };
        Snapshot {
            id: self.id.clone(),
            kind: self.kind,
            bck: self.bck.clone(),
            start: self.start,
            end,
            state,
            objs: self.stats.objs.load(Ordering::Relaxed),
            bytes: self.stats.bytes.load(Ordering::Relaxed),
            in_objs: self.stats.in_objs.load(Ordering::Relaxed),
            in_bytes: self.stats.in_bytes.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for XactBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XactBase")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("bck", &self.bck)
            .finish_non_exhaustive()
    }
}

/// The xaction capability interface. Concrete types add their own
/// operations; the registry only needs the base plus downcasting.
pub trait Xact: Send + Sync + 'static {
    fn base(&self) -> &XactBase;
    fn as_any(&self) -> &dyn Any;

    /// Arc-preserving downcast support, so owners can recover the
    /// concrete xaction type from a registry handle.
    fn as_any_arc(self: std::sync::Arc<Self>) -> std::sync::Arc<dyn Any + Send + Sync>;

    /// Rebalance xactions report the rebalance generation they belong
    /// to; everything else returns None.
    fn rebalance_id(&self) -> Option<String> {
        None
    }
}
