//! The storage target daemon: brings up the volume, the metadata
//! cache and its housekeeper, the stats tracker, the xaction registry,
//! and the erasure-coding engine with its intra-cluster transport.

mod config;
mod net;

use clap::Parser;
use cluster::{NodeKind, Smap, Snode};
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "shoal-node", about = "shoal storage target")]
struct Args {
    /// Path to the node configuration file.
    #[arg(long, env = "SHOAL_CONFIG")]
    config: PathBuf,

    /// Log filter, e.g. "info" or "shoal=debug,transport=trace".
    #[arg(long, env = "SHOAL_LOG", default_value = "info")]
    log: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log)?)
        .with_target(true)
        .init();

    let cfg = Config::load(&args.config)?;
    tracing::info!(daemon_id = %cfg.daemon_id, mountpaths = cfg.mountpaths.len(), "starting");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    // Volume first: VMD integrity errors are fatal and the node must
    // refuse to run.
    let mut mpaths = Vec::with_capacity(cfg.mountpaths.len());
    for p in &cfg.mountpaths {
        mpaths.push(volume::Mountpath::resolve(p)?);
    }
    let vol = volume::Vol::init(cfg.daemon_id.clone(), mpaths)?;

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    // Stats core with optional StatsD push.
    let registry = stats::Registry::standard();
    let sink = match &cfg.statsd {
        Some(addr) => Some(stats::StatsdSink::connect(addr, "shoal").await?),
        None => None,
    };
    tokio::spawn(stats::track(
        registry.clone(),
        cfg.stats_time,
        sink,
        stop_rx.clone(),
    ));

    // LOM cache + housekeeper.
    let caches = lom::LomCaches::new(&vol.mpi());
    vol.subscribe(caches.clone());
    let meta_store: Arc<dyn lom::MetaStore> = Arc::new(lom::XattrStore);
    let usage: Arc<dyn memsys::UsageReader> = Arc::new(memsys::ProcReader);

    let xreg = xaction::Registry::new();

    // Erasure coding over the intra-data network.
    let specs = Arc::new(volume::ContentSpecs::new());
    let req_bundle = transport::Bundle::new(
        net::TR_EC_REQ,
        &cfg.daemon_id,
        net::TcpDialer::new(net::TR_EC_REQ, cfg.timeouts.data),
        false,
        64,
    );
    let resp_bundle = transport::Bundle::new(
        net::TR_EC_RESP,
        &cfg.daemon_id,
        net::TcpDialer::new(net::TR_EC_RESP, cfg.timeouts.data),
        cfg.compress_data,
        64,
    );
    let engine_cx = ec::EngineCx::new(
        &cfg.daemon_id,
        vol.clone(),
        specs,
        req_bundle,
        resp_bundle,
        registry.clone(),
    );
    let manager = ec::Manager::new(engine_cx, xreg.clone());
    vol.subscribe(manager.clone());

    // Housekeeper throttles on the busiest EC queue of a mountpath.
    let hk_manager = manager.clone();
    let hk = lom::Housekeeper::new(
        caches.clone(),
        meta_store,
        usage,
        Some(Box::new(move |mpath| hk_manager.max_queue_len(mpath))),
    );
    tokio::spawn(hk.run(stop_rx.clone()));

    // Static bootstrap of the cluster map; a control plane would feed
    // live versions through the same call.
    let mut smap = Smap::new(1);
    smap.add_target(Snode::new(cfg.daemon_id.clone(), NodeKind::Target));
    for peer in &cfg.cluster.targets {
        let mut node = Snode::new(peer.id.clone(), NodeKind::Target);
        node.intra_data_url = peer.data_addr.clone();
        smap.add_target(node);
    }
    manager.smap_changed(Arc::new(smap)).await;

    // Accept intra-data connections from peers.
    let listener = tokio::net::TcpListener::bind(&cfg.data_addr).await?;
    tracing::info!(addr = %cfg.data_addr, "intra-data listener up");
    tokio::spawn(net::serve_data(listener, manager.clone(), stop_rx.clone()));

    wait_for_shutdown().await;
    tracing::info!("shutting down");

    let aborted = xreg.abort_all();
    if aborted > 0 {
        tracing::info!(aborted, "aborted running xactions");
    }
    manager.cx.req.close().await;
    manager.cx.resp.close().await;
    let _ = stop_tx.send(true);
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("sigterm handler installs");
    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = term.recv() => tracing::info!("received SIGTERM"),
    }
}
