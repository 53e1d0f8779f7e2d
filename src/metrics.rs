//! Process-wide metric registry, exposed verbatim at `GET /metrics`.

use prometheus::{
    exponential_buckets, CounterVec, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};

/// Owned metric registry plus typed handles for every series this daemon
/// emits. Handles are `Clone` (prometheus's vec types are internally
/// `Arc`-backed) so they can be cloned into whichever component records
/// them; the `Registry` itself is only ever touched by the `/metrics`
/// handler.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub registry_pull_total: CounterVec,
    pub registry_pull_duration_seconds: HistogramVec,
    pub p2p_fetch_total: CounterVec,
    pub p2p_fetch_duration_seconds: HistogramVec,
    pub p2p_fetch_failed_total: CounterVec,
    pub image_preheat_total: CounterVec,
    pub image_preheat_failed_total: CounterVec,
    pub registry_pulling: GaugeVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let registry_pull_total = CounterVec::new(
            Opts::new(
                "registry_pull_total",
                "Total number of upstream registry pulls",
            ),
            &["image", "result"],
        )?;
        let registry_pull_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "registry_pull_duration_seconds",
                "Duration of upstream registry pulls",
            )
            .buckets(exponential_buckets(1.0, 2.0, 10)?),
            &["image"],
        )?;
        let p2p_fetch_total = CounterVec::new(
            Opts::new("p2p_fetch_total", "Total number of P2P image fetches"),
            &["image", "peer"],
        )?;
        let p2p_fetch_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "p2p_fetch_duration_seconds",
                "Duration of P2P image fetches",
            )
            .buckets(exponential_buckets(0.5, 2.0, 10)?),
            &["image", "peer"],
        )?;
        let p2p_fetch_failed_total = CounterVec::new(
            Opts::new("p2p_fetch_failed_total", "Total number of failed P2P fetches"),
            &["image", "peer", "reason"],
        )?;
        let image_preheat_total = CounterVec::new(
            Opts::new("image_preheat_total", "Total number of successful preheats"),
            &["image", "source"],
        )?;
        let image_preheat_failed_total = CounterVec::new(
            Opts::new("image_preheat_failed_total", "Total number of failed preheats"),
            &["image", "source"],
        )?;
        let registry_pulling = GaugeVec::new(
            Opts::new("registry_pulling", "1 while a registry pull is in flight"),
            &["image", "node"],
        )?;

        registry.register(Box::new(registry_pull_total.clone()))?;
        registry.register(Box::new(registry_pull_duration_seconds.clone()))?;
        registry.register(Box::new(p2p_fetch_total.clone()))?;
        registry.register(Box::new(p2p_fetch_duration_seconds.clone()))?;
        registry.register(Box::new(p2p_fetch_failed_total.clone()))?;
        registry.register(Box::new(image_preheat_total.clone()))?;
        registry.register(Box::new(image_preheat_failed_total.clone()))?;
        registry.register(Box::new(registry_pulling.clone()))?;

        Ok(Self {
            registry,
            registry_pull_total,
            registry_pull_duration_seconds,
            p2p_fetch_total,
            p2p_fetch_duration_seconds,
            p2p_fetch_failed_total,
            image_preheat_total,
            image_preheat_failed_total,
            registry_pulling,
        })
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn encode(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        Ok(encoder.encode_to_string(&metric_families)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_known_series_names() {
        let metrics = Metrics::new().unwrap();
        metrics
            .registry_pull_total
            .with_label_values(&["alpine:3.19", "success"])
            .inc();

        let text = metrics.encode().unwrap();
        assert!(text.contains("registry_pull_total"));
    }
}
