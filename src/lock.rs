//! Cluster-wide distributed lock, backed by a single Kubernetes
//! ConfigMap data key.
//!
//! One cell per deployment, not one per image (spec §9, an explicitly
//! permitted simplification carried over from the original). CAS safety
//! comes from conditioning every write on the `resourceVersion` read
//! alongside the data: the API server rejects a `replace` whose object
//! carries a stale `resourceVersion` with a 409, which this module
//! surfaces as a retryable conflict rather than a hard error.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, PostParams};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

const LOCK_KEY: &str = "pulling-lock";
const CAS_RETRY_ATTEMPTS: u32 = 5;
const CAS_RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock store error: {0}")]
    Store(#[from] kube::Error),

    #[error("lock record is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockRecord {
    image: String,
    node: String,
    timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum AcquireResult {
    Acquired,
    HeldByOther,
}

/// Single shared cell, typed CAS, implemented on a Kubernetes ConfigMap.
pub struct DistributedLock {
    configmaps: Api<ConfigMap>,
    name: String,
    lease_ttl: Duration,
}

impl DistributedLock {
    pub async fn new(namespace: &str, name: &str, lease_ttl: Duration) -> Result<Self, LockError> {
        let client = kube::Client::try_default().await?;
        Ok(Self {
            configmaps: Api::namespaced(client, namespace),
            name: name.to_string(),
            lease_ttl,
        })
    }

    /// Read the cell; if empty or the existing record is stale, attempt a
    /// CAS write claiming `(image, node)`. Retries up to
    /// [`CAS_RETRY_ATTEMPTS`] times on a resourceVersion conflict, with a
    /// fixed backoff between attempts, then reports held-by-other.
    ///
    /// A stale lease for *this same* image, previously held by this same
    /// node, is displaced through the identical path as any other stale
    /// lease (spec §9 Open Question: preserved as-is, no special case).
    pub async fn try_acquire(&self, image: &str, node: &str) -> Result<AcquireResult, LockError> {
        for attempt in 0..CAS_RETRY_ATTEMPTS {
            let mut cm = self.get_or_init_configmap().await?;
            if let Some(record) = self.read_record(&cm)? {
                if !self.is_stale(&record) {
                    return Ok(AcquireResult::HeldByOther);
                }
            }

            let record = LockRecord {
                image: image.to_string(),
                node: node.to_string(),
                timestamp: chrono::Utc::now(),
            };
            self.write_record(&mut cm, &record);

            match self
                .configmaps
                .replace(&self.name, &PostParams::default(), &cm)
                .await
            {
                Ok(_) => return Ok(AcquireResult::Acquired),
                Err(kube::Error::Api(e)) if e.code == 409 => {
                    debug!(attempt, image, "lock CAS conflict, retrying");
                    sleep(CAS_RETRY_BACKOFF).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(AcquireResult::HeldByOther)
    }

    /// Rewrite the record's timestamp, but only if it still names
    /// `(image, node)` — never extend a lease held by someone else.
    pub async fn refresh(&self, image: &str, node: &str) -> Result<(), LockError> {
        let mut cm = self.get_or_init_configmap().await?;
        let Some(record) = self.read_record(&cm)? else {
            return Ok(());
        };
        if record.image != image || record.node != node {
            return Ok(());
        }

        let record = LockRecord {
            timestamp: chrono::Utc::now(),
            ..record
        };
        self.write_record(&mut cm, &record);

        match self
            .configmaps
            .replace(&self.name, &PostParams::default(), &cm)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(image, node, "lock refresh lost a CAS race, letting next tick retry");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Clear the cell, but only if it still names `(image, node)`.
    pub async fn release(&self, image: &str, node: &str) -> Result<(), LockError> {
        let mut cm = self.get_or_init_configmap().await?;
        let Some(record) = self.read_record(&cm)? else {
            return Ok(());
        };
        if record.image != image || record.node != node {
            return Ok(());
        }

        cm.data.get_or_insert_with(BTreeMap::new).remove(LOCK_KEY);

        match self
            .configmaps
            .replace(&self.name, &PostParams::default(), &cm)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(image, node, "lock release lost a CAS race; the holder already moved on");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn is_stale(&self, record: &LockRecord) -> bool {
        record_is_stale(record, chrono::Utc::now(), self.lease_ttl)
    }

    fn read_record(&self, cm: &ConfigMap) -> Result<Option<LockRecord>, LockError> {
        let Some(data) = &cm.data else { return Ok(None) };
        let Some(raw) = data.get(LOCK_KEY) else {
            return Ok(None);
        };
        if raw.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(raw)
            .map(Some)
            .map_err(|e| LockError::Corrupt(e.to_string()))
    }

    fn write_record(&self, cm: &mut ConfigMap, record: &LockRecord) {
        let encoded = serde_json::to_string(record).expect("LockRecord always serializes");
        cm.data.get_or_insert_with(BTreeMap::new).insert(LOCK_KEY.to_string(), encoded);
    }

    /// Fetch the cell, creating it empty if it does not yet exist. The
    /// original assumes the ConfigMap pre-exists (created by a manifest);
    /// this is a defensive first-run convenience, not a behavior change.
    async fn get_or_init_configmap(&self) -> Result<ConfigMap, LockError> {
        match self.configmaps.get(&self.name).await {
            Ok(cm) => Ok(cm),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                let cm = ConfigMap {
                    metadata: kube::api::ObjectMeta {
                        name: Some(self.name.clone()),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::new()),
                    ..Default::default()
                };
                match self
                    .configmaps
                    .create(&PostParams::default(), &cm)
                    .await
                {
                    Ok(cm) => Ok(cm),
                    // Another node created it between our GET and our
                    // CREATE; re-fetch and let the caller's CAS loop run.
                    Err(kube::Error::Api(e)) if e.code == 409 => {
                        Ok(self.configmaps.get(&self.name).await?)
                    }
                    Err(e) => Err(e.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Whether `record`'s lease has expired as of `now` under `ttl`.
/// Negative ages (clock skew putting the timestamp in the future) are
/// treated as fresh rather than stale.
fn record_is_stale(record: &LockRecord, now: chrono::DateTime<chrono::Utc>, ttl: Duration) -> bool {
    match now.signed_duration_since(record.timestamp).to_std() {
        Ok(age) => age >= ttl,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(image: &str, node: &str, age: chrono::Duration) -> LockRecord {
        LockRecord {
            image: image.to_string(),
            node: node.to_string(),
            timestamp: chrono::Utc::now() - age,
        }
    }

    #[test]
    fn fresh_record_is_not_stale() {
        let r = record("alpine:3.19", "node-a", chrono::Duration::seconds(1));
        assert!(!record_is_stale(&r, chrono::Utc::now(), Duration::from_secs(300)));
    }

    #[test]
    fn record_past_ttl_is_stale() {
        let r = record("alpine:3.19", "node-a", chrono::Duration::seconds(400));
        assert!(record_is_stale(&r, chrono::Utc::now(), Duration::from_secs(300)));
    }

    #[test]
    fn lock_record_round_trips_through_json() {
        let original = record("alpine:3.19", "node-a", chrono::Duration::seconds(0));
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: LockRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(original, decoded);
    }
}
