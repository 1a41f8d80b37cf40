//! Content-Addressable Storage (CAS) for generated artifacts.
//!
//! Every artifact is named by its SHA256 digest, so identical content produced
//! by different descriptors or by different runs lands on the same path.
//!
//! # Architecture
//!
//! ```text
//! <cache_dir>/
//! └── .cas/
//!     ├── a1b2c3...  # config body, env file, or compiled stack
//!     └── ...
//! ```
//!
//! Feeding only stages content in memory; [`CasStore::write`] flushes it.
//! Existing blobs are never rewritten.

use crate::error::{DsppError, Result};
use crate::paths;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Address of one staged blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasEntry {
    /// SHA256 hex digest of the content
    pub hash: String,
    /// Posix path relative to the project root, as written into the stack
    pub path: String,
}

/// Content-Addressable Storage manager.
#[derive(Debug)]
pub struct CasStore {
    /// Project root every relative path is joined to
    base_dir: PathBuf,
    /// Blob directory relative to `base_dir`
    blobs_dir: String,
    /// Staged blobs, keyed by relative path
    staged: BTreeMap<String, Vec<u8>>,
}

/// Compute the SHA256 hex digest of data.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

impl CasStore {
    /// Create a store rooted at `<project_root>/<cache_dir>/.cas`. Nothing touches disk yet.
    pub fn new(project_root: &Path, cache_dir: &str) -> Self {
        Self {
            base_dir: project_root.to_path_buf(),
            blobs_dir: paths::to_posix(&paths::cas_dir(cache_dir)),
            staged: BTreeMap::new(),
        }
    }

    /// Stage a blob and return its address. Feeding the same bytes twice is a no-op.
    pub fn feed(&mut self, data: impl Into<Vec<u8>>) -> CasEntry {
        let data = data.into();
        let hash = digest(&data);
        let path = format!("{}/{}", self.blobs_dir, hash);

        if !self.staged.contains_key(&path) {
            debug!(digest = %hash, size = data.len(), "Staged blob");
            self.staged.insert(path.clone(), data);
        }
        CasEntry { hash, path }
    }

    /// Read `rel` relative to `fragment`, stage it, and return its CAS path.
    pub fn env(&mut self, project_root: &Path, fragment: &Path, rel: &str) -> Result<String> {
        let file_path = paths::resolve_within(project_root, fragment, rel)?;
        let body = fs::read(&file_path).map_err(|e| DsppError::FileReadError {
            path: file_path.display().to_string(),
            source: e,
        })?;
        Ok(self.feed(body).path)
    }

    /// Staged content for a CAS path.
    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.staged.get(path).map(Vec::as_slice)
    }

    /// Number of staged blobs.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    /// Absolute location of a CAS path.
    pub fn blob_path(&self, path: &str) -> PathBuf {
        self.base_dir.join(path)
    }

    /// Flush staged blobs to disk, skipping any that already exist.
    ///
    /// Returns the number of blobs written.
    pub fn write(&self) -> Result<usize> {
        let dir = self.base_dir.join(&self.blobs_dir);
        fs::create_dir_all(&dir).map_err(|e| DsppError::io(&dir, e))?;

        let mut written = 0;
        for (path, data) in &self.staged {
            let blob_path = self.blob_path(path);
            if blob_path.exists() {
                continue;
            }
            fs::write(&blob_path, data).map_err(|e| DsppError::io(&blob_path, e))?;
            written += 1;
        }

        if written > 0 {
            info!(written, staged = self.staged.len(), "Wrote CAS blobs");
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_feed_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut store = CasStore::new(temp.path(), ".docker-stack");

        let first = store.feed("Hello, World!");
        let second = store.feed("Hello, World!");
        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
        assert_eq!(first.path, format!(".docker-stack/.cas/{}", first.hash));
        assert_eq!(first.hash.len(), 64);
    }

    #[test]
    fn test_write_never_rewrites() {
        let temp = TempDir::new().unwrap();
        let mut store = CasStore::new(temp.path(), ".docker-stack");
        let entry = store.feed("port: 8080\n");
        assert_eq!(store.write().unwrap(), 1);

        // Tamper with the blob; a second flush must leave it alone.
        let blob = store.blob_path(&entry.path);
        fs::write(&blob, "tampered").unwrap();
        assert_eq!(store.write().unwrap(), 0);
        assert_eq!(fs::read_to_string(&blob).unwrap(), "tampered");
    }

    #[test]
    fn test_env_reads_relative_to_fragment() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("web")).unwrap();
        fs::write(temp.path().join("web/app.env"), "A=1\n").unwrap();

        let mut store = CasStore::new(temp.path(), ".docker-stack");
        let path = store.env(temp.path(), &temp.path().join("web/compose.yml"), "app.env").unwrap();
        assert_eq!(store.get(&path), Some(b"A=1\n".as_slice()));
    }

    #[test]
    fn test_env_rejects_escape() {
        let temp = TempDir::new().unwrap();
        let mut store = CasStore::new(temp.path(), ".docker-stack");
        let err = store
            .env(temp.path(), &temp.path().join("compose.yml"), "../../etc/passwd")
            .unwrap_err();
        assert!(matches!(err, DsppError::PathEscape { .. }));
    }
}
