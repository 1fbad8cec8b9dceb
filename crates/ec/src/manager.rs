use crate::encode::XactPut;
use crate::respond::{RespondReq, XactRespond};
use crate::restore::XactGet;
use crate::{action, parse_slice_name, unpack_opaque, Error, Result};
use cluster::{Bck, Bmd, EcConf, Smap};
use lom::Lom;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use transport::{Bundle, Msg};
use volume::{ContentSpecs, Mountpath, Vol};
use xaction::{Kind, Registry, XactProvider};

/// Shared engine dependencies, explicitly constructed and threaded
/// through every xaction (no process-wide singletons).
pub struct EngineCx {
    pub self_id: String,
    pub vol: Arc<Vol>,
    pub specs: Arc<ContentSpecs>,
    pub req: Arc<Bundle>,
    pub resp: Arc<Bundle>,
    pub stats: Arc<stats::Registry>,
    smap: RwLock<Arc<Smap>>,
    gate: AtomicBool,
}

impl EngineCx {
    pub fn new(
        self_id: impl Into<String>,
        vol: Arc<Vol>,
        specs: Arc<ContentSpecs>,
        req: Arc<Bundle>,
        resp: Arc<Bundle>,
        stats: Arc<stats::Registry>,
    ) -> Arc<EngineCx> {
        Arc::new(EngineCx {
            self_id: self_id.into(),
            vol,
            specs,
            req,
            resp,
            stats,
            smap: RwLock::new(Arc::new(Smap::default())),
            gate: AtomicBool::new(true),
        })
    }

    pub fn smap(&self) -> Arc<Smap> {
        self.smap.read().unwrap().clone()
    }

    pub fn set_smap(&self, smap: Arc<Smap>) {
        *self.smap.write().unwrap() = smap;
    }

    /// False while requests are cleared; new EC work is refused and
    /// queued work drains with [`Error::Disabled`].
    pub fn enabled(&self) -> bool {
        self.gate.load(Ordering::Acquire)
    }

    fn set_enabled(&self, v: bool) {
        self.gate.store(v, Ordering::Release);
    }
}

struct PutProvider {
    cx: Arc<EngineCx>,
    bck: Bck,
    conf: EcConf,
}

impl XactProvider for PutProvider {
    fn kind(&self) -> Kind {
        Kind::EcPut
    }
    fn start(&self, _bck: Option<&Bck>) -> xaction::Result<Arc<dyn xaction::Xact>> {
        let x = XactPut::new(self.cx.clone(), self.bck.clone(), self.conf);
        let monitor = x.clone();
        tokio::spawn(async move { monitor.demand.idle_monitor().await });
        Ok(x)
    }
}

struct GetProvider {
    cx: Arc<EngineCx>,
    bck: Bck,
    conf: EcConf,
}

impl XactProvider for GetProvider {
    fn kind(&self) -> Kind {
        Kind::EcGet
    }
    fn start(&self, _bck: Option<&Bck>) -> xaction::Result<Arc<dyn xaction::Xact>> {
        let x = XactGet::new(self.cx.clone(), self.bck.clone(), self.conf);
        let monitor = x.clone();
        tokio::spawn(async move { monitor.demand.idle_monitor().await });
        Ok(x)
    }
}

struct RespondProvider {
    cx: Arc<EngineCx>,
    bck: Bck,
    conf: EcConf,
}

impl XactProvider for RespondProvider {
    fn kind(&self) -> Kind {
        Kind::EcRespond
    }
    fn start(&self, _bck: Option<&Bck>) -> xaction::Result<Arc<dyn xaction::Xact>> {
        let x = XactRespond::new(self.cx.clone(), self.bck.clone(), self.conf);
        let monitor = x.clone();
        tokio::spawn(async move { monitor.demand.idle_monitor().await });
        Ok(x)
    }
}

#[derive(Clone)]
pub struct BckXacts {
    pub put: Arc<XactPut>,
    pub get: Arc<XactGet>,
    pub respond: Arc<XactRespond>,
}

/// The EC manager of one target: per-bucket xactions, BMD/Smap change
/// handling, and the request gate.
pub struct Manager {
    pub cx: Arc<EngineCx>,
    reg: Arc<Registry>,
    bmd_version: AtomicI64,
    confs: Mutex<HashMap<String, EcConf>>,
}

impl Manager {
    pub fn new(cx: Arc<EngineCx>, reg: Arc<Registry>) -> Arc<Manager> {
        Arc::new(Manager {
            cx,
            reg,
            bmd_version: AtomicI64::new(0),
            confs: Mutex::new(HashMap::new()),
        })
    }

    /// Stop accepting EC requests; queued requests drain with an error.
    pub fn clear_requests(&self) {
        self.cx.set_enabled(false);
        tracing::info!("ec requests cleared");
    }

    pub fn enable_requests(&self) {
        self.cx.set_enabled(true);
        tracing::info!("ec requests enabled");
    }

    fn conf_of(&self, bck: &Bck) -> Result<EcConf> {
        if let Some(conf) = self.confs.lock().unwrap().get(&bck.uname()) {
            if !conf.enabled {
                return Err(Error::Disabled(bck.uname()));
            }
            return Ok(*conf);
        }
        // Fall back to the properties riding on the bucket handle.
        let props = bck.props();
        if !props.ec.enabled {
            return Err(Error::Disabled(bck.uname()));
        }
        Ok(props.ec)
    }

    /// The three per-bucket xactions, renewed through the registry.
    /// Renew keeps a running instance, so repeated calls are cheap.
    pub fn bucket_xacts(&self, bck: &Bck) -> Result<BckXacts> {
        let conf = self.conf_of(bck)?;
        let cx = self.cx.clone();

        let put = self
            .reg
            .renew(
                Arc::new(PutProvider {
                    cx: cx.clone(),
                    bck: bck.clone(),
                    conf,
                }),
                Some(bck),
            )
            .map_err(|e| Error::Codec(e.to_string()))?
            .xact
            .as_any_arc()
            .downcast::<XactPut>()
            .ok()
            .expect("ec-put xaction type");
        let get = self
            .reg
            .renew(
                Arc::new(GetProvider {
                    cx: cx.clone(),
                    bck: bck.clone(),
                    conf,
                }),
                Some(bck),
            )
            .map_err(|e| Error::Codec(e.to_string()))?
            .xact
            .as_any_arc()
            .downcast::<XactGet>()
            .ok()
            .expect("ec-get xaction type");
        let respond = self
            .reg
            .renew(
                Arc::new(RespondProvider {
                    cx,
                    bck: bck.clone(),
                    conf,
                }),
                Some(bck),
            )
            .map_err(|e| Error::Codec(e.to_string()))?
            .xact
            .as_any_arc()
            .downcast::<XactRespond>()
            .ok()
            .expect("ec-respond xaction type");

        Ok(BckXacts { put, get, respond })
    }

    /// Encode `lom` across the cluster; resolves when all slices are
    /// queued to their peers.
    pub async fn encode(&self, lom: &Lom) -> Result<()> {
        if !self.cx.enabled() {
            return Err(Error::Disabled(lom.bck.uname()));
        }
        self.bucket_xacts(&lom.bck)?.put.encode(lom.clone()).await
    }

    /// Restore the main object from remote slices; resolves with the
    /// object bytes once it is locally available again.
    pub async fn restore(&self, lom: &Lom) -> Result<Vec<u8>> {
        if !self.cx.enabled() {
            return Err(Error::Disabled(lom.bck.uname()));
        }
        self.bucket_xacts(&lom.bck)?.get.restore(lom.clone()).await
    }

    pub async fn cleanup(&self, lom: &Lom) -> Result<()> {
        self.bucket_xacts(&lom.bck)?.put.cleanup(lom.clone()).await
    }

    /// Apply a new BMD: track per-bucket EC configs and abort the
    /// xactions of buckets whose EC got disabled.
    pub fn bmd_changed(&self, bmd: &Bmd) {
        let prev = self.bmd_version.swap(bmd.version, Ordering::AcqRel);
        if prev >= bmd.version {
            return;
        }
        let mut disabled: Vec<String> = Vec::new();
        {
            let mut confs = self.confs.lock().unwrap();
            let mut next = HashMap::new();
            for (uname, props) in bmd.iter() {
                next.insert(uname.clone(), props.ec);
                if !props.ec.enabled && confs.get(uname).map_or(false, |c| c.enabled) {
                    disabled.push(uname.clone());
                }
            }
            *confs = next;
        }
        for uname in disabled {
            tracing::info!(bck = %uname, "ec disabled by bmd change; aborting xactions");
            self.abort_bucket_by_uname(&uname);
        }
    }

    /// Apply a new Smap: retarget the bundles and abort per-bucket
    /// xactions that can no longer meet their target requirements.
    pub async fn smap_changed(&self, smap: Arc<Smap>) {
        self.cx.set_smap(smap.clone());
        if let Err(err) = self.cx.req.smap_changed(&smap).await {
            tracing::warn!(%err, "ec req bundle failed to follow smap");
        }
        if let Err(err) = self.cx.resp.smap_changed(&smap).await {
            tracing::warn!(%err, "ec resp bundle failed to follow smap");
        }

        let have = smap.count_targets();
        let starved: Vec<String> = self
            .confs
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, conf)| conf.enabled && have < conf.required_restore_targets())
            .map(|(uname, _)| uname.clone())
            .collect();
        for uname in starved {
            tracing::warn!(bck = %uname, have, "not enough targets; aborting ec xactions");
            self.abort_bucket_by_uname(&uname);
        }
    }

    /// The busiest EC jogger queue on the given mountpath, across all
    /// bucket xactions. The LOM housekeeper uses this as its throttle.
    pub fn max_queue_len(&self, mpath: &std::path::Path) -> usize {
        let mut max = 0;
        for snap in self.reg.query(&xaction::Filter::default()) {
            let Some(x) = self.reg.get_by_id(&snap.id) else {
                continue;
            };
            let qlen = match snap.kind {
                Kind::EcPut => x
                    .as_any()
                    .downcast_ref::<XactPut>()
                    .map_or(0, |p| p.queue_len(mpath)),
                Kind::EcGet => x
                    .as_any()
                    .downcast_ref::<XactGet>()
                    .map_or(0, |g| g.queue_len(mpath)),
                Kind::EcRespond => x
                    .as_any()
                    .downcast_ref::<XactRespond>()
                    .map_or(0, |r| r.queue_len(mpath)),
                _ => 0,
            };
            max = max.max(qlen);
        }
        max
    }

    fn abort_bucket_by_uname(&self, uname: &str) {
        for snap in self.reg.query(&xaction::Filter::default()) {
            let matches = snap.bck.as_ref().map_or(false, |b| b.uname() == uname)
                && matches!(snap.kind, Kind::EcPut | Kind::EcGet | Kind::EcRespond);
            if matches {
                if let Some(x) = self.reg.get_by_id(&snap.id) {
                    x.base().abort();
                }
            }
        }
    }

    /// Inbound frame on the `req` stream: a peer asks us to serve or
    /// delete a slice we hold.
    pub async fn recv_req(&self, msg: Msg) -> Result<()> {
        let (intra, _md) = unpack_opaque(&msg.header.opaque)?;
        let bck = msg.header.bck.clone();
        let xacts = self.bucket_xacts_for_peer(&bck)?;

        match intra.action {
            action::GET => {
                xacts
                    .respond
                    .dispatch(RespondReq::Serve {
                        bck,
                        slice: msg.header.obj_name,
                        requester: intra.sender,
                    })
                    .await
            }
            action::DELETE => {
                xacts
                    .respond
                    .dispatch(RespondReq::Delete {
                        bck,
                        obj_name: msg.header.obj_name,
                    })
                    .await
            }
            other => Err(Error::Codec(format!("unexpected req action {other}"))),
        }
    }

    /// Inbound frame on the `resp` stream: either a slice we asked for
    /// (restore in flight) or a slice pushed at us to store (encode on
    /// the primary).
    pub async fn recv_resp(&self, msg: Msg) -> Result<()> {
        let (intra, md) = unpack_opaque(&msg.header.opaque)?;
        if intra.action != action::PUT {
            return Err(Error::Codec(format!(
                "unexpected resp action {}",
                intra.action
            )));
        }
        if !intra.exists {
            // Negative reply: the peer does not hold the slice. The
            // restore waiter times out or completes on other slices.
            tracing::debug!(obj = %msg.header.obj_name, sender = %intra.sender, "peer reports missing slice");
            return Ok(());
        }

        let bck = msg.header.bck.clone();
        let (base, slice_id) = match parse_slice_name(&msg.header.obj_name) {
            Some(parsed) => parsed,
            None => return Err(Error::Codec("resp frame without slice suffix".to_string())),
        };
        let md = md.ok_or_else(|| Error::Codec("resp frame without metadata".to_string()))?;
        let payload = msg.payload.unwrap_or_default();
        self.cx.stats.incr(stats::RX_COUNT);
        self.cx.stats.add(stats::RX_BYTES, payload.len() as i64);

        let xacts = self.bucket_xacts_for_peer(&bck)?;
        // A registered restore writer wins; everything else is a slice
        // to keep.
        if xacts
            .get
            .deliver(&bck.make_uname(base), slice_id, &md, &payload)
        {
            return Ok(());
        }
        xacts
            .respond
            .dispatch(RespondReq::Store {
                bck,
                obj_name: base.to_string(),
                slice_id,
                md,
                data: payload,
            })
            .await
    }

    // Serving peers must work even when the bucket handle carries no
    // props: fall back to the tracked BMD conf.
    fn bucket_xacts_for_peer(&self, bck: &Bck) -> Result<BckXacts> {
        match self.bucket_xacts(bck) {
            Ok(x) => Ok(x),
            Err(Error::Disabled(_)) => {
                let conf = self
                    .confs
                    .lock()
                    .unwrap()
                    .get(&bck.uname())
                    .copied()
                    .ok_or_else(|| Error::Disabled(bck.uname()))?;
                if !conf.enabled {
                    return Err(Error::Disabled(bck.uname()));
                }
                self.bucket_xacts(bck)
            }
            Err(e) => Err(e),
        }
    }
}

impl volume::MountpathListener for Manager {
    fn mountpath_added(&self, mp: &Arc<Mountpath>) {
        for snap in self.reg.query(&xaction::Filter::default()) {
            if let Some(x) = self.reg.get_by_id(&snap.id) {
                match snap.kind {
                    Kind::EcPut => {
                        if let Some(put) = x.as_any().downcast_ref::<XactPut>() {
                            put.mountpath_added(&mp.path);
                        }
                    }
                    Kind::EcGet => {
                        if let Some(get) = x.as_any().downcast_ref::<XactGet>() {
                            get.mountpath_added(&mp.path);
                        }
                    }
                    Kind::EcRespond => {
                        if let Some(r) = x.as_any().downcast_ref::<XactRespond>() {
                            r.mountpath_added(&mp.path);
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn mountpath_removed(&self, mp: &Arc<Mountpath>) {
        for snap in self.reg.query(&xaction::Filter::default()) {
            if let Some(x) = self.reg.get_by_id(&snap.id) {
                match snap.kind {
                    Kind::EcPut => {
                        if let Some(put) = x.as_any().downcast_ref::<XactPut>() {
                            put.mountpath_removed(&mp.path);
                        }
                    }
                    Kind::EcGet => {
                        if let Some(get) = x.as_any().downcast_ref::<XactGet>() {
                            get.mountpath_removed(&mp.path);
                        }
                    }
                    Kind::EcRespond => {
                        if let Some(r) = x.as_any().downcast_ref::<XactRespond>() {
                            r.mountpath_removed(&mp.path);
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Adapter: the `req` stream's receive side.
pub struct ReqHandler(pub Arc<Manager>);

#[async_trait::async_trait]
impl transport::RecvHandler for ReqHandler {
    async fn recv(&self, msg: Msg) -> transport::Result<()> {
        if let Err(err) = self.0.recv_req(msg).await {
            tracing::warn!(%err, "ec req dispatch failed");
        }
        Ok(())
    }
}

/// Adapter: the `resp` stream's receive side.
pub struct RespHandler(pub Arc<Manager>);

#[async_trait::async_trait]
impl transport::RecvHandler for RespHandler {
    async fn recv(&self, msg: Msg) -> transport::Result<()> {
        if let Err(err) = self.0.recv_resp(msg).await {
            tracing::warn!(%err, "ec resp dispatch failed");
        }
        Ok(())
    }
}
