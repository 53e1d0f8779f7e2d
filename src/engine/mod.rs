//! Uniform interface to the container engine.
//!
//! This is the only part of the daemon that touches the engine binary or
//! its on-disk layout. It is expressed as a trait so the layer-presence
//! layout, which is specific to a storage driver and engine version, can
//! be substituted without touching any caller (C5, C7, C9).

pub mod cli;
pub mod layers;

use std::collections::HashSet;
use std::pin::Pin;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine command failed: {0}")]
    CommandFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse engine output: {0}")]
    Parse(String),
}

/// A boxed, owned byte stream. Used for `export`/`import` so the trait
/// stays object-safe: callers get a `dyn AsyncRead` instead of a generic
/// engine-specific type.
pub type BoxedAsyncRead = Pin<Box<dyn AsyncRead + Send + Unpin>>;

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// The set of image references currently resident on this node.
    async fn list(&self) -> Result<HashSet<String>, EngineError>;

    /// Pull `image` from its upstream registry.
    async fn pull(&self, image: &str) -> Result<(), EngineError>;

    /// Open a tar-stream export of `image`, analogous to `docker save`.
    async fn export(&self, image: &str) -> Result<BoxedAsyncRead, EngineError>;

    /// Import a tar stream produced by `export` on another node, analogous
    /// to `docker load`.
    async fn import(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), EngineError>;

    /// Distribution digests of `image`'s layers, in the image's layer
    /// order. Diff-ids with no resolvable distribution digest are skipped
    /// (and a warning logged by the implementation).
    fn layers(&self, image: &str) -> Result<Vec<String>, EngineError>;

    /// Whether a layer identified by distribution digest `d` is present
    /// on disk. Absence (of either the digest mapping or the layer
    /// database entry) is `Ok(false)`, not an error; I/O errors other
    /// than not-found propagate.
    fn layer_present(&self, digest: &str) -> Result<bool, EngineError>;
}
