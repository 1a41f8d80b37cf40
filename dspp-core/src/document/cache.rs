//! Per-compile file read cache.
//!
//! Fragments are read once while discovering includes and again while
//! merging; descriptor files can be shared between descriptors. The cache
//! lives for one compile so repeated runs stay independent.

use crate::error::{DsppError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Memoized file reads keyed by path.
#[derive(Debug, Default)]
pub struct FileCache {
    entries: Mutex<HashMap<PathBuf, Arc<Vec<u8>>>>,
}

impl FileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a file, returning the cached bytes on repeated calls.
    pub fn read(&self, path: &Path) -> Result<Arc<Vec<u8>>> {
        if let Some(hit) = self.lock().get(path) {
            return Ok(hit.clone());
        }

        let bytes = std::fs::read(path).map_err(|e| DsppError::FileReadError {
            path: path.display().to_string(),
            source: e,
        })?;
        debug!(path = %path.display(), size = bytes.len(), "Read file");

        let bytes = Arc::new(bytes);
        self.lock().insert(path.to_path_buf(), bytes.clone());
        Ok(bytes)
    }

    /// Read a file as UTF-8 text.
    pub fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes.as_ref().clone()).map_err(|e| DsppError::FileReadError {
            path: path.display().to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })
    }

    /// Number of distinct files read so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<Vec<u8>>>> {
        // A poisoned map still holds complete entries.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
