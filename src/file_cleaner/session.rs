use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::Category;
use crate::error::{CleanerError, ErrorCode, Result};
use crate::platform::FileSystem;

/// Name of the synthetic category that aggregates one scan.
pub const TOTAL_CATEGORY: &str = "Total Cleanable";

/// Result of one aggregate scan, handed from the scan phase to the clean phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCache {
    pub scan_results: Category,
    pub total_size: u64,
    pub total_files: usize,
    pub scanned_at: DateTime<Utc>,
}

impl SessionCache {
    pub fn new(scan_results: Category, scanned_at: DateTime<Utc>) -> Self {
        SessionCache {
            total_size: scan_results.size,
            total_files: scan_results.file_count,
            scan_results,
            scanned_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_files == 0
    }
}

/// The single persisted scan artifact (`scan_results.json`).
#[derive(Clone)]
pub struct SessionStore {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
}

impl SessionStore {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        SessionStore {
            fs,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.fs.exists(&self.path)
    }

    pub fn save(&self, cache: &SessionCache) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            self.fs
                .create_dir_private(dir)
                .map_err(|err| CleanerError::io(err, dir))?;
        }
        let body = serde_json::to_vec_pretty(cache).map_err(|err| {
            CleanerError::new(ErrorCode::CleanFailed, "failed to encode session cache")
                .with_source(err)
        })?;
        self.fs
            .write_private(&self.path, &body)
            .map_err(|err| CleanerError::io(err, &self.path))?;
        log::debug!(
            "Saved {} files ({} bytes) to {}",
            cache.total_files,
            cache.total_size,
            self.path.display()
        );
        Ok(())
    }

    pub fn load(&self) -> Result<SessionCache> {
        let body = match self.fs.read_to_string(&self.path) {
            Ok(body) => body,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CleanerError::new(
                    ErrorCode::SessionNotFound,
                    "no saved scan results",
                )
                .with_path(&self.path)
                .with_source(err));
            }
            Err(err) => return Err(CleanerError::io(err, &self.path)),
        };
        serde_json::from_str(&body).map_err(|err| {
            CleanerError::new(ErrorCode::SessionCorrupt, "saved scan results are corrupt")
                .with_path(&self.path)
                .with_source(err)
        })
    }

    /// Remove the cache; an absent file is not an error.
    pub fn clear(&self) -> Result<()> {
        match self.fs.remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(CleanerError::io(err, &self.path)),
        }
    }
}
