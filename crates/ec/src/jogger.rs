//! Per-mountpath workers. Each jogger serializes the disk-heavy work
//! of one mountpath behind a bounded channel; total IO concurrency is
//! bounded by the mountpath count.

use crate::{Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

struct Worker<R> {
    tx: mpsc::Sender<R>,
    qlen: Arc<AtomicUsize>,
}

type SpawnFn<R> = Box<dyn Fn(PathBuf, mpsc::Receiver<R>, Arc<AtomicUsize>) + Send + Sync>;

/// A set of joggers, one per mountpath, all running the same handler.
pub struct Joggers<R> {
    workers: Mutex<HashMap<PathBuf, Worker<R>>>,
    spawn: SpawnFn<R>,
    capacity: usize,
}

impl<R: Send + 'static> Joggers<R> {
    /// Create the pool: one worker per given mountpath. The handler
    /// runs for every request, in FIFO order per mountpath; workers
    /// stop when aborted or when their channel closes.
    pub fn new<F, Fut>(
        mpaths: &[PathBuf],
        abort: watch::Receiver<bool>,
        capacity: usize,
        handler: F,
    ) -> Joggers<R>
    where
        F: Fn(PathBuf, R) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let spawn: SpawnFn<R> = Box::new(
            move |mpath: PathBuf, mut rx: mpsc::Receiver<R>, qlen: Arc<AtomicUsize>| {
                let handler = handler.clone();
                let mut abort = abort.clone();
                tokio::spawn(async move {
                    loop {
                        if *abort.borrow() {
                            tracing::debug!(mpath = %mpath.display(), "jogger aborted");
                            return;
                        }
                        tokio::select! {
                            req = rx.recv() => {
                                let Some(req) = req else {
                                    tracing::debug!(mpath = %mpath.display(), "jogger drained");
                                    return;
                                };
                                qlen.fetch_sub(1, Ordering::Relaxed);
                                handler(mpath.clone(), req).await;
                            }
                            _ = abort.changed() => {}
                        }
                    }
                });
            },
        );

        let joggers = Joggers {
            workers: Mutex::new(HashMap::new()),
            spawn,
            capacity,
        };
        for mp in mpaths {
            joggers.add(mp);
        }
        joggers
    }

    pub fn add(&self, mpath: &Path) {
        let mut workers = self.workers.lock().unwrap();
        if workers.contains_key(mpath) {
            return;
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        let qlen = Arc::new(AtomicUsize::new(0));
        (self.spawn)(mpath.to_path_buf(), rx, qlen.clone());
        workers.insert(mpath.to_path_buf(), Worker { tx, qlen });
    }

    /// Dropping the worker closes its channel; the jogger finishes the
    /// request in flight and exits.
    pub fn remove(&self, mpath: &Path) {
        self.workers.lock().unwrap().remove(mpath);
    }

    /// Queue a request on the mountpath's jogger. Blocks when the
    /// channel is full, which is the engine's back-pressure.
    pub async fn dispatch(&self, mpath: &Path, req: R) -> Result<()> {
        let (tx, qlen) = {
            let workers = self.workers.lock().unwrap();
            let w = workers
                .get(mpath)
                .ok_or_else(|| Error::JoggerGone(mpath.to_path_buf()))?;
            (w.tx.clone(), w.qlen.clone())
        };
        qlen.fetch_add(1, Ordering::Relaxed);
        if tx.send(req).await.is_err() {
            qlen.fetch_sub(1, Ordering::Relaxed);
            return Err(Error::JoggerGone(mpath.to_path_buf()));
        }
        Ok(())
    }

    pub fn queue_len(&self, mpath: &Path) -> usize {
        self.workers
            .lock()
            .unwrap()
            .get(mpath)
            .map_or(0, |w| w.qlen.load(Ordering::Relaxed))
    }

    /// The busiest queue across all mountpaths.
    pub fn max_queue_len(&self) -> usize {
        self.workers
            .lock()
            .unwrap()
            .values()
            .map(|w| w.qlen.load(Ordering::Relaxed))
            .max()
            .unwrap_or(0)
    }
}
