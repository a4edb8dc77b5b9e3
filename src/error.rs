// src/error.rs

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T, E = CleanerError> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    PermissionDenied,
    FileNotFound,
    PathProtected,
    InvalidPath,
    BackupFailed,
    BackupCorrupted,
    RestoreFailed,
    ScanCancelled,
    ScanTimeout,
    InvalidPattern,
    CleanFailed,
    SafetyCheckFailed,
    SizeLimitExceeded,
    ConfigInvalid,
    CategoryNotFound,
    DiskFull,
    SessionNotFound,
    SessionCorrupt,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::FileNotFound => "FILE_NOT_FOUND",
            ErrorCode::PathProtected => "PATH_PROTECTED",
            ErrorCode::InvalidPath => "INVALID_PATH",
            ErrorCode::BackupFailed => "BACKUP_FAILED",
            ErrorCode::BackupCorrupted => "BACKUP_CORRUPTED",
            ErrorCode::RestoreFailed => "RESTORE_FAILED",
            ErrorCode::ScanCancelled => "SCAN_CANCELLED",
            ErrorCode::ScanTimeout => "SCAN_TIMEOUT",
            ErrorCode::InvalidPattern => "INVALID_PATTERN",
            ErrorCode::CleanFailed => "CLEAN_FAILED",
            ErrorCode::SafetyCheckFailed => "SAFETY_CHECK_FAILED",
            ErrorCode::SizeLimitExceeded => "SIZE_LIMIT_EXCEEDED",
            ErrorCode::ConfigInvalid => "CONFIG_INVALID",
            ErrorCode::CategoryNotFound => "CATEGORY_NOT_FOUND",
            ErrorCode::DiskFull => "DISK_FULL",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::SessionCorrupt => "SESSION_CORRUPT",
        }
    }

    /// Suggestions attached to every error of this kind unless the caller
    /// replaces them.
    fn default_suggestions(self) -> &'static [&'static str] {
        match self {
            ErrorCode::PermissionDenied => &[
                "Re-run with elevated privileges (sudo)",
                "Deselect categories that live outside your home directory",
            ],
            ErrorCode::FileNotFound => &["Re-run the scan to refresh the file list"],
            ErrorCode::PathProtected => &[
                "Remove the protected path from the category",
                "Review protected_paths in the [safety] section of the configuration",
            ],
            ErrorCode::InvalidPath => &["Use absolute paths without '..' components"],
            ErrorCode::BackupFailed => &[
                "Check free space and permissions under the backup directory",
                "Disable safe_mode to continue without a manifest",
            ],
            ErrorCode::BackupCorrupted => &["Delete the damaged manifest; it is an audit record only"],
            ErrorCode::RestoreFailed => &["Manifests list removed paths; file contents cannot be restored"],
            ErrorCode::ScanCancelled => &["Start the scan again when ready"],
            ErrorCode::ScanTimeout => &[
                "Raise timeout_secs in the [scan] section",
                "Scan fewer categories at once",
            ],
            ErrorCode::InvalidPattern => &["Fix the regular expression in the configuration"],
            ErrorCode::CleanFailed => &["Check the errors list of the cleaning report"],
            ErrorCode::SafetyCheckFailed => &[
                "Review the category before cleaning",
                "Use a dry run to preview the operation",
            ],
            ErrorCode::SizeLimitExceeded => &["Raise max_deletion_size_mb or clean categories separately"],
            ErrorCode::ConfigInvalid => &["Fix the configuration file or delete it to regenerate defaults"],
            ErrorCode::CategoryNotFound => &["List configured categories and check the name"],
            ErrorCode::DiskFull => &["Free some space on the target filesystem and retry"],
            ErrorCode::SessionNotFound => &["Run a scan before cleaning"],
            ErrorCode::SessionCorrupt => &["Run a new scan to regenerate the session cache"],
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error shared by every component of the cleaner.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct CleanerError {
    code: ErrorCode,
    message: String,
    #[source]
    source: Option<BoxError>,
    context: BTreeMap<String, String>,
    suggestions: Vec<String>,
}

impl CleanerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        CleanerError {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
            suggestions: code
                .default_suggestions()
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_source(mut self, source: impl Into<BoxError>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.context.insert(key.into(), value.to_string());
        self
    }

    pub fn with_path(self, path: &Path) -> Self {
        self.with_context("path", path.display())
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn suggestions(&self) -> &[String] {
        &self.suggestions
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == ErrorCode::ScanCancelled
    }

    pub fn is_permission_denied(&self) -> bool {
        self.code == ErrorCode::PermissionDenied
    }

    /// Wrap an I/O failure on `path`, keeping the original error as source.
    pub fn io(err: io::Error, path: &Path) -> Self {
        let code = match err.kind() {
            io::ErrorKind::PermissionDenied => ErrorCode::PermissionDenied,
            io::ErrorKind::NotFound => ErrorCode::FileNotFound,
            _ if err.raw_os_error() == Some(libc::ENOSPC) => ErrorCode::DiskFull,
            _ => ErrorCode::CleanFailed,
        };
        let message = match code {
            ErrorCode::PermissionDenied => format!("unable to access {}", path.display()),
            ErrorCode::FileNotFound => format!("{} no longer exists", path.display()),
            ErrorCode::DiskFull => format!("no space left while writing {}", path.display()),
            _ => format!("I/O failure on {}: {}", path.display(), err),
        };
        CleanerError::new(code, message)
            .with_path(path)
            .with_source(err)
    }

    pub fn cancelled() -> Self {
        CleanerError::new(ErrorCode::ScanCancelled, "operation cancelled")
    }

    pub fn path_protected(path: &Path, prefix: &Path) -> Self {
        CleanerError::new(
            ErrorCode::PathProtected,
            format!(
                "{} is inside protected path {}",
                path.display(),
                prefix.display()
            ),
        )
        .with_path(path)
        .with_context("protected_prefix", prefix.display())
    }

    pub fn safety(message: impl Into<String>) -> Self {
        CleanerError::new(ErrorCode::SafetyCheckFailed, message)
    }

    pub fn config(message: impl Into<String>) -> Self {
        CleanerError::new(ErrorCode::ConfigInvalid, message)
    }

    pub fn invalid_pattern(pattern: &str, err: regex::Error) -> Self {
        CleanerError::new(
            ErrorCode::InvalidPattern,
            format!("invalid pattern {:?}", pattern),
        )
        .with_context("pattern", pattern)
        .with_source(err)
    }
}
