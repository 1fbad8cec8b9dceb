//! Restore-side xaction. A restore registers its slice collector
//! *before* any request leaves the node, so an arriving slice can
//! never miss its waiter; the caller unblocks on main-object
//! availability while missing slices re-upload in the background.

use crate::manager::EngineCx;
use crate::{
    action, pack_opaque, slice, slice_name, store, Error, Joggers, Md, Result, IDLE_TIMEOUT,
    REQUEST_BUF_FS, RESTORE_TIMEOUT,
};
use bytes::Bytes;
use cluster::{hrw, Bck, EcConf};
use lom::Lom;
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use transport::{Header, IntraReq, Msg, ObjAttrs, SendArg};
use xaction::{Kind, Xact, XactBase, XactDemand};

pub(crate) struct GetReq {
    lom: Lom,
    tx: oneshot::Sender<Result<Vec<u8>>>,
}

struct Collector {
    // Slot i holds slice id i+1.
    slots: Vec<Option<Vec<u8>>>,
    delivered: Vec<bool>,
    md: Option<Md>,
    count_tx: watch::Sender<usize>,
}

pub struct XactGet {
    pub demand: XactDemand,
    conf: EcConf,
    bck: Bck,
    joggers: Joggers<GetReq>,
    cx: Arc<EngineCx>,
    writers: Mutex<HashMap<String, Collector>>,
}

impl XactGet {
    pub fn new(cx: Arc<EngineCx>, bck: Bck, conf: EcConf) -> Arc<XactGet> {
        Arc::new_cyclic(|weak: &std::sync::Weak<XactGet>| {
            let demand = XactDemand::new(Kind::EcGet, Some(bck.clone()), IDLE_TIMEOUT);
            let abort = demand.base.abort_watch();
            let mpaths: Vec<PathBuf> = cx.vol.mpi().iter().map(|m| m.path.clone()).collect();
            let weak = weak.clone();
            let joggers = Joggers::new(&mpaths, abort, REQUEST_BUF_FS, move |mpath, req: GetReq| {
                let weak = weak.clone();
                async move {
                    if let Some(x) = weak.upgrade() {
                        x.handle(&mpath, req).await;
                    }
                }
            });
            XactGet {
                demand,
                conf,
                bck,
                joggers,
                cx,
                writers: Mutex::new(HashMap::new()),
            }
        })
    }

    pub fn mountpath_added(&self, path: &Path) {
        self.joggers.add(path);
    }

    pub fn mountpath_removed(&self, path: &Path) {
        self.joggers.remove(path);
    }

    pub fn queue_len(&self, mpath: &Path) -> usize {
        self.joggers.queue_len(mpath)
    }

    /// Restore the object; resolves with its bytes once rebuilt and
    /// durably written locally.
    pub async fn restore(&self, lom: Lom) -> Result<Vec<u8>> {
        self.demand.bump();
        let (tx, rx) = oneshot::channel();
        let mpath = lom.mpath.path.clone();
        self.joggers.dispatch(&mpath, GetReq { lom, tx }).await?;
        rx.await.map_err(|_| Error::Aborted)?
    }

    /// Hand a slice that arrived on the resp stream to its waiting
    /// collector. Returns false when no restore is in flight for the
    /// object, in which case the caller stores the slice instead.
    pub(crate) fn deliver(&self, uname: &str, slice_id: usize, md: &Md, data: &[u8]) -> bool {
        let mut writers = self.writers.lock().unwrap();
        let Some(c) = writers.get_mut(uname) else {
            return false;
        };
        if slice_id == 0 || slice_id > c.slots.len() || c.slots[slice_id - 1].is_some() {
            return true; // duplicate or out-of-range: consumed, ignored
        }
        c.slots[slice_id - 1] = Some(data.to_vec());
        c.delivered[slice_id - 1] = true;
        if c.md.is_none() {
            c.md = Some(md.clone());
        }
        let have = c.slots.iter().filter(|s| s.is_some()).count();
        let _ = c.count_tx.send(have);
        true
    }

    async fn handle(&self, _mpath: &Path, req: GetReq) {
        if self.demand.base.aborted() {
            let _ = req.tx.send(Err(Error::Aborted));
            return;
        }
        if !self.cx.enabled() {
            let _ = req.tx.send(Err(Error::Disabled(self.bck.uname())));
            return;
        }
        let started = std::time::Instant::now();
        let res = self.do_restore(&req.lom).await;
        match &res {
            Ok(obj) => {
                self.demand.base.stats.add_in_obj(obj.len() as i64);
                self.cx.stats.incr(stats::EC_RESTORE_COUNT);
                self.cx.stats.add_latency(stats::EC_RESTORE_LATENCY, started.elapsed());
            }
            Err(err) => {
                tracing::warn!(obj = %req.lom.uname, %err, "ec restore failed");
                self.cx.stats.incr(stats::ERR_COUNT);
            }
        }
        let _ = req.tx.send(res);
    }

    async fn do_restore(&self, lom: &Lom) -> Result<Vec<u8>> {
        let smap = self.cx.smap();
        let need = self.conf.required_restore_targets();
        let have = smap.count_targets();
        if have < need {
            return Err(Error::InsufficientTargets { have, need });
        }

        let num = self.conf.num_slices();
        let (count_tx, mut count_rx) = watch::channel(0usize);
        self.writers.lock().unwrap().insert(
            lom.uname.clone(),
            Collector {
                slots: vec![None; num],
                delivered: vec![false; num],
                md: None,
                count_tx,
            },
        );

        // Ask each slice's HRW peer for its piece.
        let peers = hrw::hrw_targets(&lom.uname, &smap, num + 1)?;
        for slice_id in 1..=num {
            let Some(peer) = peers.get(slice_id) else {
                break;
            };
            let msg = Msg {
                header: Header {
                    bck: lom.bck.clone(),
                    obj_name: slice_name(&lom.obj_name, slice_id),
                    attrs: ObjAttrs::default(),
                    opaque: pack_opaque(
                        &IntraReq {
                            sender: self.cx.self_id.clone(),
                            action: action::GET,
                            exists: false,
                        },
                        None,
                    ),
                },
                payload: None,
            };
            if let Err(err) = self.cx.req.send_to(&peer.id, SendArg::new(msg)).await {
                tracing::warn!(peer = %peer.id, slice_id, %err, "slice request failed");
            }
        }

        // Wait for enough slices, the timeout, or our own abort.
        let mut abort = self.demand.base.abort_watch();
        let need_slices = self.conf.data_slices;
        let outcome = tokio::select! {
            waited = tokio::time::timeout(
                RESTORE_TIMEOUT,
                count_rx.wait_for(|have| *have >= need_slices),
            ) => waited.map(|r| r.map(|_| ())),
            _ = abort.wait_for(|v| *v) => {
                self.writers.lock().unwrap().remove(&lom.uname);
                return Err(Error::Aborted);
            }
        };

        let collector = self
            .writers
            .lock()
            .unwrap()
            .remove(&lom.uname)
            .expect("collector registered above");

        match outcome {
            Err(_elapsed) => {
                let got = collector.slots.iter().filter(|s| s.is_some()).count();
                if got < need_slices {
                    return Err(Error::NotEnoughSlices {
                        uname: lom.uname.clone(),
                        have: got,
                        need: need_slices,
                    });
                }
            }
            Ok(Err(_closed)) => return Err(Error::Aborted),
            Ok(Ok(())) => {}
        }

        let md = collector
            .md
            .clone()
            .expect("metadata arrives with the first slice");
        let (obj, full) = slice::restore(collector.slots, &self.conf, md.obj_size as usize)?;

        // Make the main object durably available before unblocking.
        store::write_via_workfile(
            &self.cx.specs,
            &lom.mpath.path,
            &lom.bck,
            &lom.obj_name,
            &obj,
            &lom.fqn,
        )?;

        // Re-upload whatever was lost, off the caller's critical path.
        let missing: Vec<usize> = collector
            .delivered
            .iter()
            .enumerate()
            .filter(|(_, d)| !**d)
            .map(|(i, _)| i + 1)
            .collect();
        if !missing.is_empty() {
            self.respawn_slices(lom, md, full, missing);
        }

        Ok(obj)
    }

    fn respawn_slices(&self, lom: &Lom, md: Md, full: Vec<Vec<u8>>, missing: Vec<usize>) {
        let cx = self.cx.clone();
        let lom = lom.clone();
        let num = self.conf.num_slices();
        tokio::spawn(async move {
            let smap = cx.smap();
            let peers = match hrw::hrw_targets(&lom.uname, &smap, num + 1) {
                Ok(p) => p,
                Err(err) => {
                    tracing::warn!(obj = %lom.uname, %err, "cannot re-upload slices");
                    return;
                }
            };
            for slice_id in missing {
                let Some(peer) = peers.get(slice_id) else {
                    continue;
                };
                let data = Bytes::from(full[slice_id - 1].clone());
                let md = Md {
                    slice_id,
                    ..md.clone()
                };
                let msg = Msg {
                    header: Header {
                        bck: lom.bck.clone(),
                        obj_name: slice_name(&lom.obj_name, slice_id),
                        attrs: ObjAttrs {
                            size: data.len() as i64,
                            ..Default::default()
                        },
                        opaque: pack_opaque(
                            &IntraReq {
                                sender: cx.self_id.clone(),
                                action: action::PUT,
                                exists: true,
                            },
                            Some(&md),
                        ),
                    },
                    payload: Some(data),
                };
                match cx.resp.send_to(&peer.id, SendArg::new(msg)).await {
                    Ok(()) => {
                        tracing::debug!(obj = %lom.uname, slice_id, peer = %peer.id, "re-uploaded slice")
                    }
                    Err(err) => {
                        tracing::warn!(obj = %lom.uname, slice_id, %err, "slice re-upload failed")
                    }
                }
            }
        });
    }
}

impl Xact for XactGet {
    fn base(&self) -> &XactBase {
        &self.demand.base
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
