//! Respond-side xaction: serves slice requests from peers and stores
//! slices pushed at this node. Frames are fully consumed on every
//! path, success or failure, so stream framing is always preserved.

use crate::manager::EngineCx;
use crate::{
    action, pack_opaque, parse_slice_name, store, Error, Joggers, Md, Result, IDLE_TIMEOUT,
    REQUEST_BUF_FS,
};
use bytes::Bytes;
use cluster::{Bck, EcConf};
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use transport::{Header, IntraReq, Msg, ObjAttrs, SendArg};
use xaction::{Kind, Xact, XactBase, XactDemand};

pub(crate) enum RespondReq {
    /// A peer wants a slice we hold; reply on the resp stream.
    Serve {
        bck: Bck,
        slice: String,
        requester: String,
    },
    /// A peer pushed a slice for us to keep.
    Store {
        bck: Bck,
        obj_name: String,
        slice_id: usize,
        md: Md,
        data: Bytes,
    },
    /// Drop all local pieces of an object.
    Delete { bck: Bck, obj_name: String },
}

pub struct XactRespond {
    pub demand: XactDemand,
    conf: EcConf,
    joggers: Joggers<RespondReq>,
    cx: Arc<EngineCx>,
}

impl XactRespond {
    pub fn new(cx: Arc<EngineCx>, bck: Bck, conf: EcConf) -> Arc<XactRespond> {
        Arc::new_cyclic(|weak: &std::sync::Weak<XactRespond>| {
            let demand = XactDemand::new(Kind::EcRespond, Some(bck), IDLE_TIMEOUT);
            let abort = demand.base.abort_watch();
            let mpaths: Vec<PathBuf> = cx.vol.mpi().iter().map(|m| m.path.clone()).collect();
            let weak = weak.clone();
            let joggers =
                Joggers::new(&mpaths, abort, REQUEST_BUF_FS, move |mpath, req: RespondReq| {
                    let weak = weak.clone();
                    async move {
                        if let Some(x) = weak.upgrade() {
                            x.handle(&mpath, req).await;
                        }
                    }
                });
            XactRespond {
                demand,
                conf,
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

    /// Route the request to the jogger of the mountpath that owns (or
    /// will own) the slice.
    pub(crate) async fn dispatch(&self, req: RespondReq) -> Result<()> {
        self.demand.bump();
        let uname = match &req {
            RespondReq::Serve { bck, slice, .. } => bck.make_uname(slice),
            RespondReq::Store {
                bck,
                obj_name,
                slice_id,
                ..
            } => bck.make_uname(&crate::slice_name(obj_name, *slice_id)),
            // Deletes touch every local slice; any jogger will do, so
            // pick by object name for stable distribution.
            RespondReq::Delete { bck, obj_name } => bck.make_uname(obj_name),
        };
        let mpath = self.cx.vol.hrw_mountpath(&uname)?;
        self.joggers.dispatch(&mpath.path, req).await
    }

    async fn handle(&self, _mpath: &Path, req: RespondReq) {
        let res = match req {
            RespondReq::Serve {
                bck,
                slice,
                requester,
            } => self.serve(&bck, &slice, &requester).await,
            RespondReq::Store {
                bck,
                obj_name,
                slice_id,
                md,
                data,
            } => self.store(&bck, &obj_name, slice_id, &md, &data),
            RespondReq::Delete { bck, obj_name } => self.delete(&bck, &obj_name),
        };
        if let Err(err) = res {
            tracing::warn!(%err, "ec respond failed");
            self.cx.stats.incr(stats::ERR_COUNT);
        }
    }

    async fn serve(&self, bck: &Bck, slice: &str, requester: &str) -> Result<()> {
        let Some((obj_name, slice_id)) = parse_slice_name(slice) else {
            return Err(Error::Codec(format!("bad slice request {slice}")));
        };

        let found = store::read_slice(&self.cx.vol, bck, obj_name, slice_id)?;
        let (data, md, exists) = match found {
            Some((data, md)) => (Some(data), Some(md), true),
            None => (None, None, false),
        };

        let opaque = pack_opaque(
            &IntraReq {
                sender: self.cx.self_id.clone(),
                action: action::PUT,
                exists,
            },
            md.as_ref(),
        );
        let size = data.as_ref().map_or(0, |d| d.len() as i64);
        let msg = Msg {
            header: Header {
                bck: bck.clone(),
                obj_name: slice.to_string(),
                attrs: ObjAttrs {
                    size,
                    ..Default::default()
                },
                opaque,
            },
            payload: data.map(Bytes::from),
        };
        self.cx.resp.send_to(requester, SendArg::new(msg)).await?;
        if exists {
            self.demand.base.stats.add_obj(size);
            self.cx.stats.incr(stats::TX_COUNT);
            self.cx.stats.add(stats::TX_BYTES, size);
        }
        Ok(())
    }

    fn store(&self, bck: &Bck, obj_name: &str, slice_id: usize, md: &Md, data: &[u8]) -> Result<()> {
        store::write_slice(&self.cx.vol, &self.cx.specs, bck, obj_name, slice_id, data, md)?;
        self.demand.base.stats.add_in_obj(data.len() as i64);
        tracing::debug!(bck = %bck, obj_name, slice_id, size = data.len(), "stored slice");
        Ok(())
    }

    fn delete(&self, bck: &Bck, obj_name: &str) -> Result<()> {
        let removed = store::delete_slices(&self.cx.vol, bck, obj_name, self.conf.num_slices())?;
        tracing::debug!(bck = %bck, obj_name, removed, "deleted slices");
        Ok(())
    }
}

impl Xact for XactRespond {
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
