//! Per-image preheat decision and execution: try peers, else lock and
//! pull from the registry, then publish the resulting layer digests.

use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use crate::lock::AcquireResult;
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum PreheatError {
    #[error("lock subsystem not configured (NODE_NAME unset or lock store unavailable)")]
    LockNotConfigured,

    #[error("lock error: {0}")]
    Lock(#[from] crate::lock::LockError),

    #[error("registry pull failed: {0}")]
    Engine(#[from] crate::engine::EngineError),

    #[error("another preheat of this image is already in flight on this node")]
    AlreadyInFlight,
}

/// Reason a P2P peer attempt failed, used as the `reason` label on
/// `p2p_fetch_failed_total`.
#[derive(Debug, Clone, Copy)]
enum PeerFailureReason {
    Network,
    Http(u16),
    LoadError,
}

impl PeerFailureReason {
    fn as_label(&self) -> String {
        match self {
            PeerFailureReason::Network => "network".to_string(),
            PeerFailureReason::Http(code) => format!("http_{code}"),
            PeerFailureReason::LoadError => "load_error".to_string(),
        }
    }
}

/// Ensure `image` is resident on this node: try P2P peers first, falling
/// back to a locked upstream pull. Entered through the per-image
/// in-flight guard and the local preheat-slot semaphore, both acquired
/// before any I/O.
pub async fn preheat(state: &AppState, image: &str) -> Result<(), PreheatError> {
    let Some(_in_flight) = state.in_flight().try_enter(image) else {
        return Err(PreheatError::AlreadyInFlight);
    };
    let _slot = state.preheat_gate().acquire().await;

    if try_peers(state, image).await {
        state.metrics().image_preheat_total.with_label_values(&[image, "p2p"]).inc();
        return Ok(());
    }

    // Ok(false): another node holds the lock, it will populate this
    // image; not an error, and — matching the original — not counted as
    // a preheat failure either.
    pull_with_lock(state, image).await.map(|_| ())
}

/// Round-robin once through the peer set, then up to 3 random picks.
/// Returns true on the first successful import.
async fn try_peers(state: &AppState, image: &str) -> bool {
    let peers = state.peers().snapshot().await;
    if peers.is_empty() {
        return false;
    }

    for _ in 0..peers.len() {
        let peer = state.peers().next().await;
        if peer.is_empty() {
            continue;
        }
        if try_peer(state, &peer, image).await {
            publish_digests(state, image).await;
            return true;
        }
    }

    for _ in 0..3 {
        let peer = state.peers().random().await;
        if peer.is_empty() {
            continue;
        }
        if try_peer(state, &peer, image).await {
            publish_digests(state, image).await;
            return true;
        }
    }

    false
}

/// One peer attempt: `GET` the image tar, import it via the engine,
/// timed and bounded by `pulling_timeout`. Never propagates an error up;
/// failures are recorded as metrics and the caller moves to the next
/// peer.
async fn try_peer(state: &AppState, peer: &str, image: &str) -> bool {
    let timer = std::time::Instant::now();
    let url = format!(
        "http://{peer}:8080/images/download?image={}",
        urlencoding_image(image)
    );

    let response = tokio::time::timeout(
        state.config().pulling_timeout,
        state.peers().http_client().get(&url).send(),
    )
    .await;

    let response = match response {
        Ok(Ok(resp)) => resp,
        Ok(Err(_)) | Err(_) => {
            record_peer_failure(state, image, peer, PeerFailureReason::Network);
            return false;
        }
    };

    if !response.status().is_success() {
        record_peer_failure(state, image, peer, PeerFailureReason::Http(response.status().as_u16()));
        return false;
    }

    let byte_stream = response
        .bytes_stream()
        .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
    let mut reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(StreamReader::new(byte_stream));

    let import_result = tokio::time::timeout(
        state.config().pulling_timeout,
        state.engine().import(&mut *reader),
    )
    .await;

    match import_result {
        Ok(Ok(())) => {
            let duration = timer.elapsed().as_secs_f64();
            state
                .metrics()
                .p2p_fetch_total
                .with_label_values(&[image, peer])
                .inc();
            state
                .metrics()
                .p2p_fetch_duration_seconds
                .with_label_values(&[image, peer])
                .observe(duration);
            true
        }
        Ok(Err(_)) => {
            record_peer_failure(state, image, peer, PeerFailureReason::LoadError);
            false
        }
        Err(_) => {
            // Timed out mid-import; never produced a usable image.
            record_peer_failure(state, image, peer, PeerFailureReason::Network);
            false
        }
    }
}

fn record_peer_failure(state: &AppState, image: &str, peer: &str, reason: PeerFailureReason) {
    state
        .metrics()
        .p2p_fetch_failed_total
        .with_label_values(&[image, peer, &reason.as_label()])
        .inc();
}

async fn publish_digests(state: &AppState, image: &str) {
    if let Err(e) = state.digest_index().update(state.engine(), image).await {
        warn!(image, error = %e, "failed to update preheated digest index after peer fetch");
    }
}

/// Require a configured lock and a non-empty node identity, acquire the
/// cluster-wide lock, run a heartbeat refresher alongside the pull, and
/// release unconditionally on the way out.
///
/// Returns `Ok(true)` on a pull performed and completed by this node,
/// `Ok(false)` when another node already held the lock (not an error).
async fn pull_with_lock(state: &AppState, image: &str) -> Result<bool, PreheatError> {
    if state.config().node_name.is_empty() {
        return Err(PreheatError::LockNotConfigured);
    }
    let Some(lock) = state.lock() else {
        return Err(PreheatError::LockNotConfigured);
    };
    let node = state.config().node_name.as_str();

    match lock.try_acquire(image, node).await? {
        AcquireResult::HeldByOther => {
            info!(image, "lock held by another node, skipping this tick");
            return Ok(false);
        }
        AcquireResult::Acquired => {}
    }

    let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel::<()>();
    let refresher = tokio::spawn(run_heartbeat(
        lock.clone(),
        image.to_string(),
        node.to_string(),
        state.config().k8s_lock_timeout,
        cancel_rx,
    ));

    let result = pull_and_publish(state, image).await;

    let _ = cancel_tx.send(());
    let _ = refresher.await;
    if let Err(e) = lock.release(image, node).await {
        warn!(image, error = %e, "failed to release pull lock, lease will expire naturally");
    }

    result.map(|()| true)
}

/// Background heartbeat: refresh the lease every `lease_ttl / 3` until
/// `cancel` fires, which happens unconditionally on the way out of
/// [`pull_with_lock`] regardless of how the pull itself ended.
async fn run_heartbeat(
    lock: std::sync::Arc<crate::lock::DistributedLock>,
    image: String,
    node: String,
    lease_ttl: Duration,
    mut cancel: tokio::sync::oneshot::Receiver<()>,
) {
    let mut interval = tokio::time::interval(lease_ttl / 3);
    interval.tick().await; // first tick fires immediately; skip it
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = lock.refresh(&image, &node).await {
                    warn!(image = %image, error = %e, "lock heartbeat refresh failed");
                }
            }
            _ = &mut cancel => break,
        }
    }
}

async fn pull_and_publish(state: &AppState, image: &str) -> Result<(), PreheatError> {
    let node = state.config().node_name.as_str();
    state
        .metrics()
        .registry_pulling
        .with_label_values(&[image, node])
        .set(1.0);
    let timer = std::time::Instant::now();

    let result = state.engine().pull(image).await;

    state
        .metrics()
        .registry_pull_duration_seconds
        .with_label_values(&[image])
        .observe(timer.elapsed().as_secs_f64());
    state
        .metrics()
        .registry_pulling
        .with_label_values(&[image, node])
        .set(0.0);

    match result {
        Ok(()) => {
            state
                .metrics()
                .registry_pull_total
                .with_label_values(&[image, "success"])
                .inc();
            publish_digests(state, image).await;
            state
                .metrics()
                .image_preheat_total
                .with_label_values(&[image, "registry"])
                .inc();
            Ok(())
        }
        Err(e) => {
            state
                .metrics()
                .registry_pull_total
                .with_label_values(&[image, "failed"])
                .inc();
            state
                .metrics()
                .image_preheat_failed_total
                .with_label_values(&[image, "registry"])
                .inc();
            Err(e.into())
        }
    }
}

/// Percent-encode the subset of characters that appear in image
/// references and would otherwise break a query string (`:`, `@`, `/`).
fn urlencoding_image(image: &str) -> String {
    let mut out = String::with_capacity(image.len());
    for b in image.bytes() {
        match b {
            b':' => out.push_str("%3A"),
            b'@' => out.push_str("%40"),
            b'/' => out.push_str("%2F"),
            _ => out.push(b as char),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_reserved_characters() {
        assert_eq!(
            urlencoding_image("library/alpine:3.19"),
            "library%2Falpine%3A3.19"
        );
    }

    #[test]
    fn peer_failure_reason_labels() {
        assert_eq!(PeerFailureReason::Network.as_label(), "network");
        assert_eq!(PeerFailureReason::Http(503).as_label(), "http_503");
        assert_eq!(PeerFailureReason::LoadError.as_label(), "load_error");
    }
}
