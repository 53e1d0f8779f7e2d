//! Peer discovery and selection.
//!
//! Mirrors the original `PeerSelector`: an optional external ranker is
//! tried first, falling back to a headless-service DNS lookup on any
//! non-2xx response or empty result. `refresh` replaces the peer list
//! atomically; the round-robin cursor survives a refresh modulo the new
//! length (`% len` naturally handles that once peers changes).

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PeerDiscoveryError {
    #[error("ranker and DNS discovery both failed: {0}")]
    AllSourcesFailed(String),
}

/// Maintains a freshened peer list and offers round-robin / random
/// selection over it. Self's address is excluded at refresh time.
pub struct PeerSelector {
    http: reqwest::Client,
    ranker_host: Option<String>,
    dns_service_name: String,
    self_ip: Option<IpAddr>,
    peers: RwLock<Vec<String>>,
    cursor: AtomicUsize,
}

/// Sentinel returned by [`PeerSelector::next`] / [`PeerSelector::random`]
/// when the peer list is empty — callers treat it as "no peer available".
pub const NO_PEER: &str = "";

impl PeerSelector {
    pub fn new(
        ranker_host: Option<String>,
        dns_service_name: impl Into<String>,
        self_ip: Option<IpAddr>,
        request_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("reqwest client builds with a plain timeout");
        Self {
            http,
            ranker_host,
            dns_service_name: dns_service_name.into(),
            self_ip,
            peers: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    /// The shared client backing ranker discovery, reused by callers
    /// (e.g. the coordinator's peer fetch) that want the same connection
    /// pool and timeout rather than building their own.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Rebuild the peer list wholesale: try the ranker, then DNS.
    pub async fn refresh(&self, node_name: &str) -> Result<(), PeerDiscoveryError> {
        let mut ranker_err = None;
        if let Some(host) = &self.ranker_host {
            match self.discover_from_ranker(host, node_name).await {
                Ok(peers) if !peers.is_empty() => {
                    let peers = self.exclude_self(peers);
                    info!(count = peers.len(), "refreshed peers from ranker");
                    *self.peers.write().await = peers;
                    return Ok(());
                }
                Ok(_) => ranker_err = Some("empty peer list".to_string()),
                Err(e) => {
                    warn!(error = %e, "ranker peer discovery failed, falling back to DNS");
                    ranker_err = Some(e);
                }
            }
        }

        match self.discover_from_dns().await {
            Ok(peers) => {
                let peers = self.exclude_self(peers);
                info!(count = peers.len(), "refreshed peers from DNS");
                *self.peers.write().await = peers;
                Ok(())
            }
            Err(dns_err) => Err(PeerDiscoveryError::AllSourcesFailed(format!(
                "ranker: {}; dns: {dns_err}",
                ranker_err.unwrap_or_else(|| "not configured".to_string())
            ))),
        }
    }

    async fn discover_from_ranker(&self, host: &str, node_name: &str) -> Result<Vec<String>, String> {
        let url = format!("http://{host}:8080/peers/priority?node={node_name}");
        let resp = self.http.get(&url).send().await.map_err(|e| e.to_string())?;
        if !resp.status().is_success() {
            return Err(format!("non-2xx status {}", resp.status()));
        }
        resp.json::<Vec<String>>().await.map_err(|e| e.to_string())
    }

    async fn discover_from_dns(&self) -> Result<Vec<String>, String> {
        let target = format!("{}:0", self.dns_service_name);
        let addrs = tokio::net::lookup_host(&target)
            .await
            .map_err(|e| e.to_string())?;
        Ok(addrs.map(|addr| addr.ip().to_string()).collect())
    }

    fn exclude_self(&self, peers: Vec<String>) -> Vec<String> {
        match self.self_ip {
            Some(ip) => peers.into_iter().filter(|p| p != &ip.to_string()).collect(),
            None => peers,
        }
    }

    /// A lock-protected copy of the current peer list.
    pub async fn snapshot(&self) -> Vec<String> {
        self.peers.read().await.clone()
    }

    /// Round-robin next peer, or [`NO_PEER`] if the list is empty.
    pub async fn next(&self) -> String {
        let peers = self.peers.read().await;
        if peers.is_empty() {
            return NO_PEER.to_string();
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % peers.len();
        peers[i].clone()
    }

    /// A uniformly random peer, or [`NO_PEER`] if the list is empty.
    ///
    /// The original selects by `time.Now().UnixNano() % len`; this uses a
    /// proper PRNG seeded once per process instead (REDESIGN FLAG).
    pub async fn random(&self) -> String {
        let peers = self.peers.read().await;
        if peers.is_empty() {
            return NO_PEER.to_string();
        }
        let i = rand::rng().random_range(0..peers.len());
        peers[i].clone()
    }
}

/// Resolve this process's own address: the injected `POD_IP`, or else
/// the first non-loopback IPv4 interface address.
pub fn resolve_self_ip(pod_ip: &str) -> Option<IpAddr> {
    if !pod_ip.is_empty() {
        if let Ok(ip) = pod_ip.parse() {
            return Some(ip);
        }
    }
    first_non_loopback_ipv4()
}

/// Enumerate local interface addresses via `getifaddrs(3)`, mirroring the
/// original's `net.InterfaceAddrs()` fallback when `POD_IP` is unset.
fn first_non_loopback_ipv4() -> Option<IpAddr> {
    use std::net::Ipv4Addr;

    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: `head` is a valid out-pointer; `getifaddrs` allocates a
    // linked list we walk read-only below and free unconditionally.
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return None;
    }

    let mut found = None;
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: `cursor` is non-null and was produced by `getifaddrs`.
        let ifa = unsafe { &*cursor };
        if !ifa.ifa_addr.is_null() {
            // SAFETY: non-null `ifa_addr` points to a `sockaddr` at least
            // as large as `sockaddr_in` when `sa_family` is `AF_INET`.
            let sa = unsafe { &*ifa.ifa_addr };
            if sa.sa_family as i32 == libc::AF_INET {
                let sin = unsafe { &*(ifa.ifa_addr as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                if !ip.is_loopback() {
                    found = Some(IpAddr::V4(ip));
                    break;
                }
            }
        }
        cursor = ifa.ifa_next;
    }

    // SAFETY: `head` was returned by a successful `getifaddrs` call above.
    unsafe { libc::freeifaddrs(head) };
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_robin_wraps() {
        let selector = PeerSelector::new(None, "unused", None, Duration::from_secs(1));
        *selector.peers.write().await = vec!["a".into(), "b".into()];

        assert_eq!(selector.next().await, "a");
        assert_eq!(selector.next().await, "b");
        assert_eq!(selector.next().await, "a");
    }

    #[tokio::test]
    async fn empty_peer_list_yields_sentinel() {
        let selector = PeerSelector::new(None, "unused", None, Duration::from_secs(1));
        assert_eq!(selector.next().await, NO_PEER);
        assert_eq!(selector.random().await, NO_PEER);
    }

    #[tokio::test]
    async fn exclude_self_filters_matching_ip() {
        let selector = PeerSelector::new(
            None,
            "unused",
            Some("10.0.0.5".parse().unwrap()),
            Duration::from_secs(1),
        );
        let filtered = selector.exclude_self(vec!["10.0.0.5".into(), "10.0.0.6".into()]);
        assert_eq!(filtered, vec!["10.0.0.6".to_string()]);
    }
}
