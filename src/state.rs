//! Shared application state, handed to every HTTP handler and background
//! task via an `Arc`-wrapped clone.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::digest_index::PreheatedDigestIndex;
use crate::engine::ContainerEngine;
use crate::gates::{DownloadServeGate, InFlightGuard, PreheatGate, RateBucket};
use crate::lock::DistributedLock;
use crate::metrics::Metrics;
use crate::peers::PeerSelector;

/// All shared, long-lived component handles for one daemon instance.
///
/// Cheap to clone (it's a single `Arc`); cloned into every Axum handler
/// and background task the way `plfm-control-plane`'s `AppState` is.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    config: AppConfig,
    engine: Arc<dyn ContainerEngine>,
    digest_index: PreheatedDigestIndex,
    peers: PeerSelector,
    lock: Option<Arc<DistributedLock>>,
    preheat_gate: PreheatGate,
    download_gate: DownloadServeGate,
    rate_bucket: RateBucket,
    in_flight: InFlightGuard,
    metrics: Metrics,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        engine: Arc<dyn ContainerEngine>,
        peers: PeerSelector,
        lock: Option<DistributedLock>,
        metrics: Metrics,
    ) -> Self {
        let preheat_gate = PreheatGate::new(config.preheat_concurrency);
        let download_gate = DownloadServeGate::new(config.download_api_concurrency);
        let rate_bucket = RateBucket::new(config.download_rate_limit_bytes);

        Self {
            inner: Arc::new(Inner {
                config,
                engine,
                digest_index: PreheatedDigestIndex::new(),
                peers,
                lock: lock.map(Arc::new),
                preheat_gate,
                download_gate,
                rate_bucket,
                in_flight: InFlightGuard::new(),
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn engine(&self) -> &dyn ContainerEngine {
        self.inner.engine.as_ref()
    }

    pub fn digest_index(&self) -> &PreheatedDigestIndex {
        &self.inner.digest_index
    }

    pub fn peers(&self) -> &PeerSelector {
        &self.inner.peers
    }

    pub fn lock(&self) -> Option<Arc<DistributedLock>> {
        self.inner.lock.clone()
    }

    pub fn preheat_gate(&self) -> &PreheatGate {
        &self.inner.preheat_gate
    }

    pub fn download_gate(&self) -> &DownloadServeGate {
        &self.inner.download_gate
    }

    pub fn rate_bucket(&self) -> &RateBucket {
        &self.inner.rate_bucket
    }

    pub fn in_flight(&self) -> &InFlightGuard {
        &self.inner.in_flight
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }
}
