//! In-memory map from a preheated image to the set of layer digests it
//! contributed, used to classify digests in `/layers/check` answers.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::info;

use crate::engine::{ContainerEngine, EngineError};

/// Tracks which images have been preheated on this node and which layer
/// digests each one is known to have contributed.
///
/// All mutations are serialized through the single `RwLock`; readers see
/// either the pre- or post-update state of a given `update`, never a
/// partial one.
pub struct PreheatedDigestIndex {
    images: RwLock<HashMap<String, HashSet<String>>>,
}

impl PreheatedDigestIndex {
    pub fn new() -> Self {
        Self {
            images: RwLock::new(HashMap::new()),
        }
    }

    /// Re-resolve `image`'s layer digests via the engine and replace any
    /// prior entry. Idempotent: calling this twice in a row for the same
    /// image converges on the same set (modulo the engine's own state).
    pub async fn update(
        &self,
        engine: &dyn ContainerEngine,
        image: &str,
    ) -> Result<(), EngineError> {
        let digests: HashSet<String> = engine.layers(image)?.into_iter().collect();
        let count = digests.len();
        self.images.write().await.insert(image.to_string(), digests);
        info!(image, digest_count = count, "updated preheated digest index");
        Ok(())
    }

    pub async fn is_preheated_image(&self, image: &str) -> bool {
        self.images.read().await.contains_key(image)
    }

    /// Whether `digest` belongs to the layer set of *any* preheated
    /// image. Scans every entry; the total digest population is small
    /// relative to lookup frequency.
    pub async fn is_preheated_digest(&self, digest: &str) -> bool {
        self.images
            .read()
            .await
            .values()
            .any(|digests| digests.contains(digest))
    }

    pub async fn remove(&self, image: &str) {
        self.images.write().await.remove(image);
    }
}

impl Default for PreheatedDigestIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet as StdHashSet;
    use tokio::io::AsyncRead;

    struct FakeEngine {
        layers: Vec<String>,
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn list(&self) -> Result<StdHashSet<String>, EngineError> {
            Ok(StdHashSet::new())
        }
        async fn pull(&self, _image: &str) -> Result<(), EngineError> {
            Ok(())
        }
        async fn export(&self, _image: &str) -> Result<crate::engine::BoxedAsyncRead, EngineError> {
            unimplemented!()
        }
        async fn import(
            &self,
            _source: &mut (dyn AsyncRead + Send + Unpin),
        ) -> Result<(), EngineError> {
            Ok(())
        }
        fn layers(&self, _image: &str) -> Result<Vec<String>, EngineError> {
            Ok(self.layers.clone())
        }
        fn layer_present(&self, _digest: &str) -> Result<bool, EngineError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn update_then_classify() {
        let engine = FakeEngine {
            layers: vec!["sha256:a".into(), "sha256:b".into()],
        };
        let index = PreheatedDigestIndex::new();
        index.update(&engine, "alpine:3.19").await.unwrap();

        assert!(index.is_preheated_image("alpine:3.19").await);
        assert!(index.is_preheated_digest("sha256:a").await);
        assert!(!index.is_preheated_digest("sha256:z").await);
    }

    #[tokio::test]
    async fn update_is_idempotent() {
        let engine = FakeEngine {
            layers: vec!["sha256:a".into()],
        };
        let index = PreheatedDigestIndex::new();
        index.update(&engine, "alpine:3.19").await.unwrap();
        index.update(&engine, "alpine:3.19").await.unwrap();
        assert!(index.is_preheated_digest("sha256:a").await);
    }

    #[tokio::test]
    async fn remove_drops_entry() {
        let engine = FakeEngine {
            layers: vec!["sha256:a".into()],
        };
        let index = PreheatedDigestIndex::new();
        index.update(&engine, "alpine:3.19").await.unwrap();
        index.remove("alpine:3.19").await;
        assert!(!index.is_preheated_image("alpine:3.19").await);
        assert!(!index.is_preheated_digest("sha256:a").await);
    }
}
