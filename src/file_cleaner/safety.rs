use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::types::{Category, RiskLevel};
use crate::error::{CleanerError, ErrorCode, Result};
use crate::format::humanize;
use crate::platform::FileSystem;

const BYTES_PER_MB: u64 = 1_048_576;

pub const DEFAULT_PROTECTED_PATHS: &[&str] = &[
    "/bin",
    "/usr/bin",
    "/usr/sbin",
    "/sbin",
    "/etc",
    "/var/lib",
    "/boot",
    "/sys",
    "/proc",
    "/dev",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyPolicy {
    pub require_confirmation: bool,
    pub max_deletion_size_mb: u64,
    pub protected_paths: Vec<PathBuf>,
    pub safe_mode: bool,
    pub shred_passes: u32,
    /// Write a text manifest of each real clean (not a content backup).
    pub backup_enabled: bool,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        SafetyPolicy {
            require_confirmation: true,
            max_deletion_size_mb: 10 * 1024,
            protected_paths: DEFAULT_PROTECTED_PATHS.iter().map(PathBuf::from).collect(),
            safe_mode: true,
            shred_passes: 1,
            backup_enabled: true,
        }
    }
}

impl SafetyPolicy {
    pub fn max_deletion_bytes(&self) -> u64 {
        self.max_deletion_size_mb.saturating_mul(BYTES_PER_MB)
    }

    pub fn passes(&self) -> u32 {
        self.shred_passes.max(1)
    }

    /// Checks run before any file of `category` is touched, dry run included.
    pub(crate) fn preflight(
        &self,
        fs: &dyn FileSystem,
        protected: &ProtectedPaths,
        category: &Category,
        dry_run: bool,
    ) -> Result<()> {
        if category.risk == RiskLevel::High && !dry_run && self.safe_mode {
            return Err(CleanerError::safety(format!(
                "category {:?} is High risk and safe mode is enabled",
                category.name
            ))
            .with_context("category", &category.name)
            .with_suggestion("Disable safe_mode to clean High risk categories"));
        }

        let limit = self.max_deletion_bytes();
        if category.size > limit {
            return Err(CleanerError::safety(format!(
                "category size {} exceeds maximum deletion size {}",
                humanize(category.size),
                humanize(limit)
            ))
            .with_context("category", &category.name)
            .with_context("size", category.size)
            .with_context("limit", limit));
        }

        for file in &category.files {
            protected.check(fs, &file.path)?;
        }
        Ok(())
    }
}

/// Protected prefixes, each kept in configured and canonical form so that
/// `/bin` still matches when it is a symlink to `/usr/bin`.
#[derive(Debug, Clone)]
pub(crate) struct ProtectedPaths {
    prefixes: Vec<(PathBuf, Option<PathBuf>)>,
}

impl ProtectedPaths {
    pub(crate) fn new(fs: &dyn FileSystem, policy: &SafetyPolicy) -> Self {
        let prefixes = policy
            .protected_paths
            .iter()
            .map(|prefix| (prefix.clone(), fs.canonicalize(prefix).ok()))
            .collect();
        ProtectedPaths { prefixes }
    }

    /// Fails when `path` is malformed, cannot be resolved, or resolves
    /// inside a protected prefix. Prefixes match whole components only.
    pub(crate) fn check(&self, fs: &dyn FileSystem, path: &Path) -> Result<()> {
        validate_input_path(path)?;

        let resolved = resolve(fs, path).map_err(|err| {
            CleanerError::new(
                ErrorCode::PathProtected,
                format!(
                    "cannot resolve {}; refusing to treat it as deletable",
                    path.display()
                ),
            )
            .with_path(path)
            .with_source(err)
        })?;

        for (prefix, canonical) in &self.prefixes {
            let hit = resolved.starts_with(prefix)
                || path.starts_with(prefix)
                || canonical.as_ref().map_or(false, |c| resolved.starts_with(c));
            if hit {
                return Err(CleanerError::path_protected(path, prefix));
            }
        }
        Ok(())
    }
}

fn validate_input_path(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(CleanerError::new(
            ErrorCode::InvalidPath,
            format!("{} is not an absolute path", path.display()),
        )
        .with_path(path));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(CleanerError::new(
            ErrorCode::InvalidPath,
            format!("{} contains '..'", path.display()),
        )
        .with_path(path));
    }
    Ok(())
}

/// Canonical form of `path`. Components that no longer exist are rejoined
/// onto the nearest ancestor that does, so a vanished subtree still
/// resolves and can be checked against the prefixes.
fn resolve(fs: &dyn FileSystem, path: &Path) -> io::Result<PathBuf> {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        match fs.canonicalize(current) {
            Ok(resolved) => {
                return Ok(missing
                    .iter()
                    .rev()
                    .fold(resolved, |acc: PathBuf, name| acc.join(name)))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let (Some(parent), Some(name)) = (current.parent(), current.file_name()) else {
                    return Err(err);
                };
                missing.push(name);
                current = parent;
            }
            Err(err) => return Err(err),
        }
    }
}
