//! Process configuration, loaded once at startup from the environment.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};

/// Fully-resolved, immutable configuration for one daemon instance.
///
/// Constructed once via [`AppConfig::from_env`] and handed to every other
/// component; never re-read after startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Identity used in the lock holder field. Empty is accepted: the node
    /// is still useful as a P2P server, it just cannot win the upstream
    /// pull lock (see [`AppConfig::node_name`] callers).
    pub node_name: String,
    /// Self IP used to filter the peer set. Empty falls back to interface
    /// enumeration at peer-refresh time.
    pub pod_ip: String,

    pub k8s_namespace: String,
    pub k8s_lock_configmap: String,
    pub k8s_lock_timeout: Duration,

    pub image_list_path: String,

    pub preheat_concurrency: usize,
    pub download_api_concurrency: usize,

    pub interval: Duration,
    pub pulling_timeout: Duration,
    pub download_rate_limit_bytes: u64,

    pub peer_discovery_service_name: String,
    pub peer_discovery_interval: Duration,
    /// Optional external peer-priority ranker host; unset disables the
    /// ranker step and goes straight to DNS discovery.
    pub ranker_host: Option<String>,

    pub layers_check_concurrency: usize,
    pub max_digests_per_request: usize,

    pub docker_root_dir: String,
    pub docker_storage_driver: String,
    pub docker_bin: String,

    pub listen_addr: String,
    pub shutdown_grace_period: Duration,
}

impl AppConfig {
    /// Load configuration from the environment, applying documented
    /// defaults for anything unset. Fails if a present value cannot be
    /// parsed; `NODE_NAME` and `POD_IP` are the only variables allowed to
    /// be empty.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            node_name: env_string("NODE_NAME", ""),
            pod_ip: env_string("POD_IP", ""),

            k8s_namespace: env_string("K8S_NAMESPACE", "default"),
            k8s_lock_configmap: env_string("K8S_LOCK_CM", "image-preheat-lock"),
            k8s_lock_timeout: env_duration("K8S_LOCK_TIMEOUT", "5m")?,

            image_list_path: env_string("IMAGE_LIST_PATH", "/etc/preheater/images.list"),

            preheat_concurrency: env_usize("PREHEAT_CONCURRENCY", 1)?,
            download_api_concurrency: env_usize("DOWNLOAD_API_CONCURRENCY", 4)?,

            interval: env_duration("INTERVAL", "1m")?,
            pulling_timeout: env_duration("PULLING_TIMEOUT", "5m")?,
            download_rate_limit_bytes: env_byte_size("DOWNLOAD_RATE_LIMIT", "500MiB")?,

            peer_discovery_service_name: env_string(
                "PEER_DISCOVERY_SERVICE_NAME",
                "image-preheat-peers.default.svc.cluster.local",
            ),
            peer_discovery_interval: env_duration("PEER_DISCOVERY_INTERVAL", "30s")?,
            ranker_host: std::env::var("RANKER_HOST").ok().filter(|s| !s.is_empty()),

            layers_check_concurrency: env_usize("LAYERS_CHECK_CONCURRENCY", 2)?,
            max_digests_per_request: env_usize("MAX_DIGESTS_PER_REQUEST", 50)?,

            docker_root_dir: env_string("DOCKER_ROOT_DIR", "/var/lib/docker"),
            docker_storage_driver: env_string("DOCKER_STORAGE_DRIVER", "overlay2"),
            docker_bin: env_string("DOCKER_BIN", "docker"),

            listen_addr: env_string("LISTEN_ADDR", "0.0.0.0:8080"),
            shutdown_grace_period: env_duration("SHUTDOWN_GRACE_PERIOD", "15s")?,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{key}={v:?} is not a valid unsigned integer")),
        Err(_) => Ok(default),
    }
}

/// Parse a Go-style duration string: a bare integer of seconds, or an
/// integer followed by `s`, `m`, or `h`.
fn env_duration(key: &str, default: &str) -> Result<Duration> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    parse_duration(&raw).with_context(|| format!("{key}={raw:?} is not a valid duration"))
}

fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (number, unit_secs) = match raw.strip_suffix('h') {
        Some(n) => (n, 3600),
        None => match raw.strip_suffix('m') {
            Some(n) => (n, 60),
            None => match raw.strip_suffix('s') {
                Some(n) => (n, 1),
                None => (raw, 1),
            },
        },
    };
    let value: f64 = number
        .parse()
        .map_err(|_| anyhow!("invalid numeric duration component {number:?}"))?;
    Ok(Duration::from_secs_f64(value * unit_secs as f64))
}

/// Parse a byte size: a bare integer of bytes, or an integer followed by
/// `KiB`, `MiB`, or `GiB`.
fn env_byte_size(key: &str, default: &str) -> Result<u64> {
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    parse_byte_size(&raw).with_context(|| format!("{key}={raw:?} is not a valid byte size"))
}

fn parse_byte_size(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let (number, multiplier) = if let Some(n) = raw.strip_suffix("GiB") {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = raw.strip_suffix("MiB") {
        (n, 1024 * 1024)
    } else if let Some(n) = raw.strip_suffix("KiB") {
        (n, 1024)
    } else {
        (raw, 1)
    };
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| anyhow!("invalid numeric byte-size component {number:?}"))?;
    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_suffixed_durations() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn parses_plain_and_suffixed_byte_sizes() {
        assert_eq!(parse_byte_size("500MiB").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_byte_size("1GiB").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_byte_size("2048").unwrap(), 2048);
        assert_eq!(parse_byte_size("4KiB").unwrap(), 4096);
    }

    #[test]
    fn rejects_unparseable_duration() {
        assert!(parse_duration("soon").is_err());
    }
}
