//! Container engine adapter that shells out to a Docker-CLI-compatible
//! binary, the way the original daemon's `CommandLineClient` does.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use super::layers::{layer_present, resolve_distribution_digest};
use super::{BoxedAsyncRead, ContainerEngine, EngineError};

/// Drives `docker` (or an equivalent CLI) via subprocess, and resolves
/// layer presence by reading the engine's on-disk metadata directly.
pub struct DockerCliEngine {
    bin: String,
    docker_root: PathBuf,
    storage_driver: String,
}

impl DockerCliEngine {
    pub fn new(bin: impl Into<String>, docker_root: PathBuf, storage_driver: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            docker_root,
            storage_driver: storage_driver.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<Vec<u8>, EngineError> {
        let output = Command::new(&self.bin)
            .args(args)
            .output()
            .await
            .map_err(EngineError::Io)?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed(format!(
                "{} {}: {}",
                self.bin,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ContainerEngine for DockerCliEngine {
    async fn list(&self) -> Result<HashSet<String>, EngineError> {
        let stdout = self
            .run(&["images", "--format", "{{.Repository}}:{{.Tag}}"])
            .await?;
        let text = String::from_utf8_lossy(&stdout);
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.ends_with(":<none>"))
            .map(str::to_string)
            .collect())
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        self.run(&["pull", image]).await?;
        Ok(())
    }

    async fn export(&self, image: &str) -> Result<BoxedAsyncRead, EngineError> {
        let mut child = Command::new(&self.bin)
            .args(["save", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(EngineError::Io)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::CommandFailed("docker save: no stdout pipe".into()))?;

        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    warn!(status = %status, "docker save exited non-zero");
                }
                Err(e) => warn!(error = %e, "docker save wait failed"),
                _ => {}
            }
        });

        Ok(Box::pin(stdout))
    }

    async fn import(
        &self,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), EngineError> {
        let mut child = Command::new(&self.bin)
            .arg("load")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(EngineError::Io)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::CommandFailed("docker load: no stdin pipe".into()))?;

        let copy_result = tokio::io::copy(source, &mut stdin).await;
        stdin.shutdown().await.ok();
        drop(stdin);
        copy_result.map_err(EngineError::Io)?;

        let output = child.wait_with_output().await.map_err(EngineError::Io)?;
        if !output.status.success() {
            return Err(EngineError::CommandFailed(format!(
                "docker load: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    fn layers(&self, image: &str) -> Result<Vec<String>, EngineError> {
        let output = std::process::Command::new(&self.bin)
            .args(["inspect", "--format={{json .RootFS.Layers}}", image])
            .output()
            .map_err(EngineError::Io)?;

        if !output.status.success() {
            return Err(EngineError::CommandFailed(format!(
                "docker inspect {image}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let diffids: Vec<String> = serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::Parse(format!("inspect RootFS.Layers: {e}")))?;

        let mut digests = Vec::with_capacity(diffids.len());
        for diffid in diffids {
            match resolve_distribution_digest(&self.docker_root, &self.storage_driver, &diffid)? {
                Some(digest) => digests.push(digest),
                None => {
                    debug!(diffid = %diffid, image = %image, "no distribution digest for diff-id, skipping");
                }
            }
        }
        Ok(digests)
    }

    fn layer_present(&self, digest: &str) -> Result<bool, EngineError> {
        layer_present(&self.docker_root, &self.storage_driver, digest)
    }
}
