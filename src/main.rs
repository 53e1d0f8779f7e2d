//! Image preheat daemon entry point.
//!
//! One process per node: watches the target image list, runs the
//! periodic preheat scheduler, keeps the peer list fresh, and serves the
//! P2P/metrics HTTP surface until asked to shut down.

use std::sync::Arc;

use anyhow::Result;
use image_preheater::config::AppConfig;
use image_preheater::engine::cli::DockerCliEngine;
use image_preheater::engine::ContainerEngine;
use image_preheater::image_list::ImageListCache;
use image_preheater::lock::DistributedLock;
use image_preheater::metrics::Metrics;
use image_preheater::peers::{resolve_self_ip, PeerSelector};
use image_preheater::{api, scheduler, AppState};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting image preheat daemon");
    info!(node = %config.node_name, listen_addr = %config.listen_addr, "configuration loaded");

    let engine: Arc<dyn ContainerEngine> = Arc::new(DockerCliEngine::new(
        config.docker_bin.clone(),
        config.docker_root_dir.clone().into(),
        config.docker_storage_driver.clone(),
    ));

    let self_ip = resolve_self_ip(&config.pod_ip);
    let peers = PeerSelector::new(
        config.ranker_host.clone(),
        config.peer_discovery_service_name.clone(),
        self_ip,
        config.pulling_timeout,
    );

    // A missing/unreachable lock store is non-fatal: this node still
    // serves P2P downloads, it just never wins an upstream pull lock.
    let lock = match DistributedLock::new(
        &config.k8s_namespace,
        &config.k8s_lock_configmap,
        config.k8s_lock_timeout,
    )
    .await
    {
        Ok(lock) => Some(lock),
        Err(e) => {
            warn!(error = %e, "distributed lock unavailable, this node will not perform upstream pulls");
            None
        }
    };

    let metrics = Metrics::new()?;
    let state = AppState::new(config.clone(), engine, peers, lock, metrics);

    let image_list = Arc::new(ImageListCache::new(config.image_list_path.clone()));
    image_list.reload().await;

    // One synchronous peer refresh up front so the first scheduler tick
    // and the HTTP surface start with a non-empty peer set where one is
    // actually reachable, rather than waiting for the first interval tick.
    if let Err(e) = state.peers().refresh(&config.node_name).await {
        warn!(error = %e, "initial peer discovery failed, starting with an empty peer list");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watch_handle = tokio::spawn({
        let image_list = image_list.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { image_list.watch(shutdown_rx).await }
    });

    let peer_discovery_handle = tokio::spawn({
        let state = state.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        let node_name = state.config().node_name.clone();
        let interval = state.config().peer_discovery_interval;
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; the initial refresh already ran
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = state.peers().refresh(&node_name).await {
                            warn!(error = %e, "peer discovery failed, keeping the previous peer list");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }
    });

    let scheduler_handle = tokio::spawn({
        let state = state.clone();
        let image_list = image_list.clone();
        let shutdown_rx = shutdown_rx.clone();
        let interval = state.config().interval;
        async move { scheduler::run(state, &image_list, interval, shutdown_rx).await }
    });

    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "listening for connections");

    let server_shutdown_rx = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = server_shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("server exited normally"),
                Ok(Err(e)) => error!(error = %e, "server error"),
                Err(e) => error!(error = %e, "server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("waiting for background tasks to shut down...");
    let grace = config.shutdown_grace_period;

    for (name, handle) in [
        ("image list watcher", watch_handle),
        ("peer discovery", peer_discovery_handle),
        ("scheduler", scheduler_handle),
    ] {
        if tokio::time::timeout(grace, handle).await.is_err() {
            warn!(task = name, "background task did not shut down in time");
        }
    }

    info!("daemon shutdown complete");
    Ok(())
}
