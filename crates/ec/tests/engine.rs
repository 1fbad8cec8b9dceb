//! End-to-end engine exercise over in-memory pipes: three targets,
//! encode on the primary, lose a slice, restore, and watch the missing
//! slice get re-uploaded in the background.

use cluster::{Bck, BckProps, Bmd, EcConf, NodeKind, Smap, Snode};
use ec::manager::{EngineCx, Manager, ReqHandler, RespHandler};
use lom::Lom;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use transport::{Bundle, Dialer};
use volume::{ContentSpecs, Mountpath, Vol};

type Managers = Arc<Mutex<HashMap<String, Arc<Manager>>>>;

struct PipeDialer {
    managers: Managers,
    // Which handler the remote end runs for this bundle.
    kind: HandlerKind,
}

#[derive(Clone, Copy)]
enum HandlerKind {
    Req,
    Resp,
}

#[async_trait::async_trait]
impl Dialer for PipeDialer {
    async fn dial(
        &self,
        node: &Snode,
    ) -> transport::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let (client, server) = tokio::io::duplex(1 << 20);
        let manager = self
            .managers
            .lock()
            .unwrap()
            .get(&node.id)
            .expect("peer manager registered")
            .clone();
        let kind = self.kind;
        let (abort_tx, abort_rx) = watch::channel(false);
        tokio::spawn(async move {
            let _abort_tx = abort_tx;
            let result = match kind {
                HandlerKind::Req => {
                    transport::serve(server, Arc::new(ReqHandler(manager)), abort_rx).await
                }
                HandlerKind::Resp => {
                    transport::serve(server, Arc::new(RespHandler(manager)), abort_rx).await
                }
            };
            if let Err(err) = result {
                eprintln!("pipe serve failed: {err}");
            }
        });
        Ok(Box::new(client))
    }
}

struct Node {
    id: String,
    _dir: tempfile::TempDir,
    vol: Arc<Vol>,
    manager: Arc<Manager>,
}

fn ec_conf() -> EcConf {
    EcConf {
        enabled: true,
        obj_size_limit: 0,
        data_slices: 1,
        parity_slices: 1,
    }
}

fn ec_bck() -> Bck {
    Bck::ais("ecb").with_props(Arc::new(BckProps {
        ec: ec_conf(),
        ..Default::default()
    }))
}

async fn make_node(id: &str, managers: &Managers) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let mut mpaths = Vec::new();
    for name in ["mp1", "mp2"] {
        let p = dir.path().join(name);
        std::fs::create_dir_all(&p).unwrap();
        mpaths.push(Mountpath::new(p, "dev".into(), "ext4".into(), 1));
    }
    let vol = Vol::init(id, mpaths).unwrap();

    let req = Bundle::new(
        "ec-req",
        id,
        Arc::new(PipeDialer {
            managers: managers.clone(),
            kind: HandlerKind::Req,
        }),
        false,
        64,
    );
    let resp = Bundle::new(
        "ec-resp",
        id,
        Arc::new(PipeDialer {
            managers: managers.clone(),
            kind: HandlerKind::Resp,
        }),
        true,
        64,
    );

    let cx = EngineCx::new(
        id,
        vol.clone(),
        Arc::new(ContentSpecs::new()),
        req,
        resp,
        stats::Registry::standard(),
    );
    let manager = Manager::new(cx, xaction::Registry::new());
    managers.lock().unwrap().insert(id.to_string(), manager.clone());

    Node {
        id: id.to_string(),
        _dir: dir,
        vol,
        manager,
    }
}

fn find_files(root: &Path, needle: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if !root.exists() {
        return out;
    }
    for entry in std::fs::read_dir(root).unwrap() {
        let p = entry.unwrap().path();
        if p.is_dir() {
            out.extend(find_files(&p, needle));
        } else if p.to_string_lossy().contains(needle) {
            out.push(p);
        }
    }
    out
}

#[tokio::test]
async fn encode_lose_slice_restore_reupload() {
    let managers: Managers = Arc::new(Mutex::new(HashMap::new()));
    let mut nodes = Vec::new();
    for id in ["t1", "t2", "t3"] {
        nodes.push(make_node(id, &managers).await);
    }

    let mut smap = Smap::new(1);
    for n in &nodes {
        smap.add_target(Snode::new(n.id.clone(), NodeKind::Target));
    }
    let smap = Arc::new(smap);

    let mut bmd = Bmd::new(1);
    bmd.set(
        &ec_bck(),
        BckProps {
            ec: ec_conf(),
            ..Default::default()
        },
    );
    for n in &nodes {
        n.manager.bmd_changed(&bmd);
        n.manager.smap_changed(smap.clone()).await;
    }

    // Pick an object whose HRW primary is t1, so t1 legitimately
    // initiates the encode.
    let bck = ec_bck();
    let primary = &nodes[0];
    let obj_name = (0..)
        .map(|i| format!("obj-{i}"))
        .find(|name| {
            cluster::hrw::hrw_target(&bck.make_uname(name), &smap).unwrap().id == primary.id
        })
        .unwrap();

    // PUT the object on the primary.
    let body: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let mut lom = Lom::init(bck.clone(), obj_name.clone(), &primary.vol).unwrap();
    std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
    std::fs::write(&lom.fqn, &body).unwrap();
    lom.md.size = body.len() as i64;

    primary.manager.encode(&lom).await.unwrap();

    // Slices land on the two peers (1 data + 1 parity).
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut slice_files = Vec::new();
    for n in &nodes[1..] {
        for mp in n.vol.mpi() {
            slice_files.extend(
                find_files(&mp.path.join("ec"), ".s").into_iter().filter(|p| {
                    // Skip metadata sidecars.
                    !p.to_string_lossy().ends_with(".md")
                }),
            );
        }
    }
    assert_eq!(slice_files.len(), 2, "expected 2 slices, got {slice_files:?}");

    // Lose the data slice (id 1), wherever it landed.
    let s1 = slice_files
        .iter()
        .find(|p| p.to_string_lossy().ends_with(".s1"))
        .unwrap();
    std::fs::remove_file(s1).unwrap();

    // Lose the main object too, then restore through the engine.
    std::fs::remove_file(&lom.fqn).unwrap();
    let restored = primary.manager.restore(&lom).await.unwrap();
    assert_eq!(restored, body);
    assert_eq!(std::fs::read(&lom.fqn).unwrap(), body);

    // The missing slice is re-uploaded in the background: slice count
    // returns to data + parity.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut s1_count = 0;
    for n in &nodes[1..] {
        for mp in n.vol.mpi() {
            s1_count += find_files(&mp.path.join("ec"), ".s1")
                .into_iter()
                .filter(|p| !p.to_string_lossy().ends_with(".md"))
                .count();
        }
    }
    assert_eq!(s1_count, 1, "data slice was not re-uploaded");
}

#[tokio::test]
async fn encode_needs_enough_targets() {
    let managers: Managers = Arc::new(Mutex::new(HashMap::new()));
    let node = make_node("t1", &managers).await;

    // A single target cannot satisfy data=1, parity=1 (needs 3).
    let mut smap = Smap::new(1);
    smap.add_target(Snode::new("t1", NodeKind::Target));
    node.manager.smap_changed(Arc::new(smap)).await;

    let bck = ec_bck();
    let mut lom = Lom::init(bck, "obj", &node.vol).unwrap();
    std::fs::create_dir_all(lom.fqn.parent().unwrap()).unwrap();
    std::fs::write(&lom.fqn, b"payload").unwrap();
    lom.md.size = 7;

    let err = node.manager.encode(&lom).await.unwrap_err();
    assert!(matches!(err, ec::Error::InsufficientTargets { have: 1, need: 3 }));
}

#[tokio::test]
async fn cleared_requests_are_refused() {
    let managers: Managers = Arc::new(Mutex::new(HashMap::new()));
    let node = make_node("t1", &managers).await;

    let bck = ec_bck();
    let lom = Lom::init(bck, "obj", &node.vol).unwrap();

    node.manager.clear_requests();
    assert!(matches!(
        node.manager.encode(&lom).await.unwrap_err(),
        ec::Error::Disabled(_)
    ));
    assert!(matches!(
        node.manager.restore(&lom).await.unwrap_err(),
        ec::Error::Disabled(_)
    ));

    node.manager.enable_requests();
    // With the gate re-opened the request proceeds to target checks.
    assert!(matches!(
        node.manager.encode(&lom).await.unwrap_err(),
        ec::Error::InsufficientTargets { .. }
    ));
}
