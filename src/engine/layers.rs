//! On-disk layer digest resolution and presence checks.
//!
//! Specific to the overlay2 driver's metadata layout under a Docker data
//! root. No part of this module talks to the engine binary; it only
//! reads engine-owned files, which is why it is kept separate from
//! [`super::cli`] even though both back the same [`super::ContainerEngine`]
//! implementation.

use std::path::{Path, PathBuf};

use super::EngineError;

/// `<root>/image/<driver>/distribution/diffid-by-digest/sha256/<digest>`
pub fn diffid_by_digest_path(root: &Path, driver: &str, digest_hex: &str) -> PathBuf {
    root.join("image")
        .join(driver)
        .join("distribution/diffid-by-digest/sha256")
        .join(digest_hex)
}

/// `<root>/image/<driver>/layerdb/sha256/<diffid>`
pub fn layerdb_path(root: &Path, driver: &str, diffid_hex: &str) -> PathBuf {
    root.join("image")
        .join(driver)
        .join("layerdb/sha256")
        .join(diffid_hex)
}

/// `<root>/image/<driver>/distribution/v2metadata-by-diffid/sha256/<diffid>`
pub fn v2metadata_by_diffid_path(root: &Path, driver: &str, diffid_hex: &str) -> PathBuf {
    root.join("image")
        .join(driver)
        .join("distribution/v2metadata-by-diffid/sha256")
        .join(diffid_hex)
}

/// Strip a `sha256:` (or other algorithm) prefix, returning the hex part
/// used as a filename component. Digests with no prefix are returned
/// unchanged.
pub fn hex_component(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}

/// Resolve a diff-id to its distribution digest via the v2metadata file,
/// which holds a JSON array of `{"Digest": "...", ...}` records; the
/// first entry's digest is authoritative.
pub fn resolve_distribution_digest(
    root: &Path,
    driver: &str,
    diffid: &str,
) -> Result<Option<String>, EngineError> {
    let path = v2metadata_by_diffid_path(root, driver, hex_component(diffid));
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EngineError::Io(e)),
    };

    #[derive(serde::Deserialize)]
    struct V2Metadata {
        #[serde(rename = "Digest")]
        digest: String,
    }

    let entries: Vec<V2Metadata> = serde_json::from_slice(&bytes)
        .map_err(|e| EngineError::Parse(format!("v2metadata-by-diffid: {e}")))?;
    Ok(entries.into_iter().next().map(|e| e.digest))
}

/// Whether distribution digest `digest` is present on disk: both the
/// digest→diffid mapping and the layerdb entry for the resolved diffid
/// must exist. Either absence is `Ok(false)`; other I/O errors propagate.
pub fn layer_present(root: &Path, driver: &str, digest: &str) -> Result<bool, EngineError> {
    let diffid_path = diffid_by_digest_path(root, driver, hex_component(digest));
    let diffid = match std::fs::read_to_string(&diffid_path) {
        Ok(s) => s.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(EngineError::Io(e)),
    };

    let layerdb_entry = layerdb_path(root, driver, hex_component(&diffid));
    match layerdb_entry.try_exists() {
        Ok(exists) => Ok(exists),
        Err(e) => Err(EngineError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_digest_mapping_is_not_present() {
        let dir = tempfile::tempdir().unwrap();
        let present = layer_present(dir.path(), "overlay2", "sha256:deadbeef").unwrap();
        assert!(!present);
    }

    #[test]
    fn present_when_both_files_exist() {
        let dir = tempfile::tempdir().unwrap();
        let diffid_dir = dir
            .path()
            .join("image/overlay2/distribution/diffid-by-digest/sha256");
        fs::create_dir_all(&diffid_dir).unwrap();
        fs::write(diffid_dir.join("deadbeef"), "sha256:cafef00d\n").unwrap();

        let layerdb_dir = dir.path().join("image/overlay2/layerdb/sha256");
        fs::create_dir_all(&layerdb_dir).unwrap();
        fs::write(layerdb_dir.join("cafef00d"), "").unwrap();

        let present = layer_present(dir.path(), "overlay2", "sha256:deadbeef").unwrap();
        assert!(present);
    }

    #[test]
    fn resolve_digest_returns_none_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let resolved =
            resolve_distribution_digest(dir.path(), "overlay2", "sha256:cafef00d").unwrap();
        assert!(resolved.is_none());
    }

    #[test]
    fn resolve_digest_reads_first_entry() {
        let dir = tempfile::tempdir().unwrap();
        let meta_dir = dir
            .path()
            .join("image/overlay2/distribution/v2metadata-by-diffid/sha256");
        fs::create_dir_all(&meta_dir).unwrap();
        fs::write(
            meta_dir.join("cafef00d"),
            r#"[{"Digest":"sha256:abc123","SourceRepository":"docker.io/library/alpine"}]"#,
        )
        .unwrap();

        let resolved =
            resolve_distribution_digest(dir.path(), "overlay2", "sha256:cafef00d").unwrap();
        assert_eq!(resolved, Some("sha256:abc123".to_string()));
    }
}
