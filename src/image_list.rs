//! Hot-reloadable, newline-separated list of target image references.
//!
//! Mirrors the original `ImageListCache`: watch the *directory* containing
//! the file (not the file itself — editors often replace-by-rename, which
//! a direct file watch can miss), filter events down to the exact path,
//! and reload on any write. A reload that fails to open or scan the file
//! leaves the previous snapshot in place.

use std::path::{Path, PathBuf};

use notify::{RecursiveMode, Watcher};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

pub struct ImageListCache {
    path: PathBuf,
    images: RwLock<Vec<String>>,
}

impl ImageListCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            images: RwLock::new(Vec::new()),
        }
    }

    /// Parse the file once and install the result as the current
    /// snapshot. Called at startup and on every relevant watch event.
    pub async fn reload(&self) {
        match load_file(&self.path) {
            Ok(images) => {
                info!(count = images.len(), path = %self.path.display(), "image list reloaded");
                *self.images.write().await = images;
            }
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "image list reload failed, keeping prior snapshot");
            }
        }
    }

    /// A lock-protected copy of the current list, in file order.
    pub async fn snapshot(&self) -> Vec<String> {
        self.images.read().await.clone()
    }

    /// Load once, then watch the containing directory for writes to this
    /// exact path and reload on each one. Runs until `shutdown` fires.
    pub async fn watch(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        self.reload().await;

        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = match notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        }) {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "failed to create image list watcher");
                return;
            }
        };

        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            error!(error = %e, dir = %dir.display(), "failed to watch image list directory");
            return;
        }

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(Ok(event)) => {
                            if is_write_to(&event, &self.path) {
                                info!("image list change detected, reloading");
                                self.reload().await;
                            }
                        }
                        Some(Err(e)) => warn!(error = %e, "image list watcher error"),
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

fn is_write_to(event: &notify::Event, path: &Path) -> bool {
    use notify::EventKind;
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event.paths.iter().any(|p| p == path)
}

fn load_file(path: &Path) -> std::io::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_and_trims_skipping_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("images.list");
        std::fs::write(&file, "  alpine:3.19  \n\n# a comment\nredis:7\n").unwrap();

        let cache = ImageListCache::new(&file);
        cache.reload().await;

        assert_eq!(cache.snapshot().await, vec!["alpine:3.19", "redis:7"]);
    }

    #[tokio::test]
    async fn missing_file_keeps_prior_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("images.list");
        std::fs::write(&file, "alpine:3.19\n").unwrap();

        let cache = ImageListCache::new(&file);
        cache.reload().await;
        std::fs::remove_file(&file).unwrap();
        cache.reload().await;

        assert_eq!(cache.snapshot().await, vec!["alpine:3.19"]);
    }
}
