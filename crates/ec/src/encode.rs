//! Encode-side xaction: slices objects (or replicates small ones) and
//! ships the pieces to HRW-selected peers.

use crate::manager::EngineCx;
use crate::{
    action, pack_opaque, slice, slice_name, Error, Joggers, Md, Result, IDLE_TIMEOUT,
    REQUEST_BUF_FS,
};
use bytes::Bytes;
use cluster::{hrw, Bck, EcConf};
use lom::Lom;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use transport::{Header, IntraReq, Msg, ObjAttrs, SendArg};
use xaction::{Kind, Xact, XactBase, XactDemand};

pub(crate) enum PutOp {
    Encode,
    Cleanup,
}

pub(crate) struct PutReq {
    op: PutOp,
    lom: Lom,
    tx: oneshot::Sender<Result<()>>,
}

pub struct XactPut {
    pub demand: XactDemand,
    conf: EcConf,
    bck: Bck,
    joggers: Joggers<PutReq>,
    cx: Arc<EngineCx>,
}

impl XactPut {
    pub fn new(cx: Arc<EngineCx>, bck: Bck, conf: EcConf) -> Arc<XactPut> {
        Arc::new_cyclic(|weak: &std::sync::Weak<XactPut>| {
            let demand = XactDemand::new(Kind::EcPut, Some(bck.clone()), IDLE_TIMEOUT);
            let abort = demand.base.abort_watch();
            let mpaths: Vec<PathBuf> = cx.vol.mpi().iter().map(|m| m.path.clone()).collect();
            let weak = weak.clone();
            let joggers = Joggers::new(&mpaths, abort, REQUEST_BUF_FS, move |mpath, req: PutReq| {
                let weak = weak.clone();
                async move {
                    if let Some(x) = weak.upgrade() {
                        x.handle(&mpath, req).await;
                    }
                }
            });
            XactPut {
                demand,
                conf,
                bck,
                joggers,
                cx,
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

    /// Encode the object. The completion promise is created before the
    /// request is queued, so the caller can never miss the signal.
    pub async fn encode(&self, lom: Lom) -> Result<()> {
        self.submit(PutOp::Encode, lom).await
    }

    /// Remove every slice and replica of the object, here and on peers.
    pub async fn cleanup(&self, lom: Lom) -> Result<()> {
        self.submit(PutOp::Cleanup, lom).await
    }

    async fn submit(&self, op: PutOp, lom: Lom) -> Result<()> {
        self.demand.bump();
        let (tx, rx) = oneshot::channel();
        let mpath = lom.mpath.path.clone();
        self.joggers.dispatch(&mpath, PutReq { op, lom, tx }).await?;
        rx.await.map_err(|_| Error::Aborted)?
    }

    async fn handle(&self, _mpath: &Path, req: PutReq) {
        if self.demand.base.aborted() {
            let _ = req.tx.send(Err(Error::Aborted));
            return;
        }
        if !self.cx.enabled() {
            let _ = req.tx.send(Err(Error::Disabled(self.bck.uname())));
            return;
        }
        let res = match req.op {
            PutOp::Encode => self.do_encode(&req.lom).await,
            PutOp::Cleanup => self.do_cleanup(&req.lom).await,
        };
        if let Err(err) = &res {
            tracing::warn!(obj = %req.lom.uname, %err, "ec put failed");
            self.cx.stats.incr(stats::ERR_COUNT);
        }
        let _ = req.tx.send(res);
    }

    async fn do_encode(&self, lom: &Lom) -> Result<()> {
        let smap = self.cx.smap();
        let need = self.conf.required_encode_targets();
        let have = smap.count_targets();
        if have < need {
            return Err(Error::InsufficientTargets { have, need });
        }

        let data = tokio::fs::read(&lom.fqn).await?;
        let num = self.conf.num_slices();
        let peers = hrw::hrw_targets(&lom.uname, &smap, num + 1)?;

        if (data.len() as i64) <= self.conf.obj_size_limit {
            // Small object: full replicas instead of slices, one per
            // parity count.
            let md = self.md_for(lom, &data, 0);
            for peer in peers.iter().skip(1).take(self.conf.parity_slices) {
                self.ship(&peer.id, lom, 0, Bytes::copy_from_slice(&data), &md)
                    .await?;
            }
        } else {
            let slices = slice::split(&data, &self.conf)?;
            for (i, s) in slices.into_iter().enumerate() {
                let slice_id = i + 1;
                let md = self.md_for(lom, &data, slice_id);
                self.ship(&peers[slice_id].id, lom, slice_id, Bytes::from(s), &md)
                    .await?;
            }
        }

        self.demand.base.stats.add_obj(data.len() as i64);
        self.cx.stats.incr(stats::EC_ENCODE_COUNT);
        tracing::debug!(obj = %lom.uname, size = data.len(), "encoded");
        Ok(())
    }

    fn md_for(&self, lom: &Lom, data: &[u8], slice_id: usize) -> Md {
        Md {
            obj_size: data.len() as i64,
            data_slices: self.conf.data_slices,
            parity_slices: self.conf.parity_slices,
            slice_id,
            obj_cksum: lom.md.cksum.clone(),
            obj_version: lom.md.version.clone(),
        }
    }

    async fn ship(
        &self,
        peer: &str,
        lom: &Lom,
        slice_id: usize,
        data: Bytes,
        md: &Md,
    ) -> Result<()> {
        let opaque = pack_opaque(
            &IntraReq {
                sender: self.cx.self_id.clone(),
                action: action::PUT,
                exists: true,
            },
            Some(md),
        );
        let size = data.len() as i64;
        let msg = Msg {
            header: Header {
                bck: lom.bck.clone(),
                obj_name: slice_name(&lom.obj_name, slice_id),
                attrs: ObjAttrs {
                    size,
                    atime: lom.md.atime,
                    version: lom.md.version.clone(),
                    cksum: lom.md.cksum.clone(),
                },
                opaque,
            },
            payload: Some(data),
        };
        self.cx.resp.send_to(peer, SendArg::new(msg)).await?;
        self.cx.stats.incr(stats::TX_COUNT);
        self.cx.stats.add(stats::TX_BYTES, size);
        Ok(())
    }

    async fn do_cleanup(&self, lom: &Lom) -> Result<()> {
        let removed =
            crate::store::delete_slices(&self.cx.vol, &lom.bck, &lom.obj_name, self.conf.num_slices())?;

        // Peers drop their pieces too.
        let smap = self.cx.smap();
        let num = self.conf.num_slices();
        let peers = hrw::hrw_targets(&lom.uname, &smap, num + 1)?;
        let opaque = pack_opaque(
            &IntraReq {
                sender: self.cx.self_id.clone(),
                action: action::DELETE,
                exists: false,
            },
            None,
        );
        for peer in peers.iter().skip(1) {
            let msg = Msg {
                header: Header {
                    bck: lom.bck.clone(),
                    obj_name: lom.obj_name.clone(),
                    attrs: ObjAttrs::default(),
                    opaque: opaque.clone(),
                },
                payload: None,
            };
            if let Err(err) = self.cx.req.send_to(&peer.id, SendArg::new(msg)).await {
                tracing::warn!(peer = %peer.id, obj = %lom.uname, %err, "cleanup notify failed");
            }
        }
        tracing::debug!(obj = %lom.uname, removed, "cleaned up local slices");
        Ok(())
    }
}

impl Xact for XactPut {
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
