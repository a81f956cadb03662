//! Content-fingerprint manifests for incremental image work.
//!
//! Two stages skip files they have already handled:
//!
//! - **next-gen** keeps `<image_output>/.nextgen-manifest.json`, mapping each
//!   raster (relative to the output image root) to the hash of the bytes its
//!   WebP sibling was encoded from;
//! - **compress** keeps the signature file (default `src/img/.tinypng-sigs`),
//!   mapping each source image to the hash of the bytes the compression
//!   service returned.
//!
//! Keys are content hashes rather than modification times so the records
//! survive `git checkout`, copies between machines, and coarse filesystem
//! timestamp resolution. A file is reprocessed at most once per content change.
//!
//! ## Storage
//!
//! Versioned JSON. A missing, corrupt, or wrong-version file loads as an
//! empty manifest, which simply means everything is processed once more.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// File name of the next-gen manifest inside the output image directory.
pub const NEXTGEN_MANIFEST_FILENAME: &str = ".nextgen-manifest.json";

/// Version of the manifest format. Bump to invalidate existing manifests.
const MANIFEST_VERSION: u32 = 1;

/// A single fingerprint record.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    pub source_hash: String,
}

/// On-disk manifest mapping relative paths to their last processed fingerprint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FingerprintManifest {
    pub version: u32,
    pub entries: BTreeMap<String, CacheEntry>,
}

impl FingerprintManifest {
    /// Create an empty manifest (first run or forced rebuild).
    pub fn empty() -> Self {
        Self {
            version: MANIFEST_VERSION,
            entries: BTreeMap::new(),
        }
    }

    /// Load from `path`. Returns an empty manifest if the file doesn't exist
    /// or can't be parsed.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return Self::empty(),
        };
        let manifest: Self = match serde_json::from_str(&content) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable manifest");
                return Self::empty();
            }
        };
        if manifest.version != MANIFEST_VERSION {
            return Self::empty();
        }
        manifest
    }

    /// Save to `path`, creating the parent directory if needed.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    /// True when `key` was last processed from exactly `source_hash`.
    pub fn is_current(&self, key: &str, source_hash: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|e| e.source_hash == source_hash)
    }

    /// Record that `key` has been processed from `source_hash`.
    pub fn record(&mut self, key: String, source_hash: String) {
        self.entries.insert(key, CacheEntry { source_hash });
    }

    /// Drop entries whose key is not in `live`. Keeps the manifest from
    /// growing when images are deleted or renamed.
    pub fn retain_keys<'a>(&mut self, live: impl IntoIterator<Item = &'a str>) {
        let live: std::collections::HashSet<&str> = live.into_iter().collect();
        self.entries.retain(|k, _| live.contains(k.as_str()));
    }
}

/// SHA-256 hash of a file's contents, returned as a hex string.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hash_bytes(&bytes))
}

/// SHA-256 hash of a byte slice, returned as a hex string.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Manifest key for `path` relative to `root`, always `/`-separated.
pub fn relative_key(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Resolve the next-gen manifest path for an output image directory.
pub fn nextgen_manifest_path(image_output: &Path) -> PathBuf {
    image_output.join(NEXTGEN_MANIFEST_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn empty_manifest_has_no_entries() {
        let m = FingerprintManifest::empty();
        assert_eq!(m.version, MANIFEST_VERSION);
        assert!(m.entries.is_empty());
    }

    #[test]
    fn is_current_after_record() {
        let mut m = FingerprintManifest::empty();
        m.record("a/b.png".into(), "h1".into());
        assert!(m.is_current("a/b.png", "h1"));
        assert!(!m.is_current("a/b.png", "h2"));
        assert!(!m.is_current("a/c.png", "h1"));
    }

    #[test]
    fn record_overwrites_previous_hash() {
        let mut m = FingerprintManifest::empty();
        m.record("x.jpg".into(), "old".into());
        m.record("x.jpg".into(), "new".into());
        assert!(m.is_current("x.jpg", "new"));
        assert_eq!(m.entries.len(), 1);
    }

    #[test]
    fn retain_keys_drops_deleted_images() {
        let mut m = FingerprintManifest::empty();
        m.record("keep.png".into(), "1".into());
        m.record("gone.png".into(), "2".into());
        m.retain_keys(["keep.png"]);
        assert!(m.entries.contains_key("keep.png"));
        assert!(!m.entries.contains_key("gone.png"));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/.sigs");
        let mut m = FingerprintManifest::empty();
        m.record("x.png".into(), "s1".into());
        m.save(&path).unwrap();

        let loaded = FingerprintManifest::load(&path);
        assert!(loaded.is_current("x.png", "s1"));
    }

    #[test]
    fn load_missing_file_returns_empty() {
        let tmp = TempDir::new().unwrap();
        let m = FingerprintManifest::load(&tmp.path().join("none.json"));
        assert!(m.entries.is_empty());
    }

    #[test]
    fn load_corrupt_json_returns_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("m.json");
        fs::write(&path, "not json").unwrap();
        assert!(FingerprintManifest::load(&path).entries.is_empty());
    }

    #[test]
    fn load_wrong_version_returns_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("m.json");
        let json = format!(
            r#"{{"version": {}, "entries": {{"a": {{"source_hash":"h"}}}}}}"#,
            MANIFEST_VERSION + 1
        );
        fs::write(&path, json).unwrap();
        assert!(FingerprintManifest::load(&path).entries.is_empty());
    }

    #[test]
    fn hash_file_changes_with_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("test.bin");

        fs::write(&path, b"version 1").unwrap();
        let h1 = hash_file(&path).unwrap();
        fs::write(&path, b"version 2").unwrap();
        let h2 = hash_file(&path).unwrap();

        assert_ne!(h1, h2);
        assert_eq!(h1.len(), 64);
        assert_eq!(hash_bytes(b"version 2"), h2);
    }

    #[test]
    fn relative_key_uses_forward_slashes() {
        let root = Path::new("/site/dist/img");
        let path = root.join("icons").join("logo.png");
        assert_eq!(relative_key(root, &path), "icons/logo.png");
    }
}
