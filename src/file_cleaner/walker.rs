use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;

use super::types::FileRecord;
use crate::error::{CleanerError, Result};
use crate::platform::{EntryKind, Environment, FileSystem, WalkEntry};

/// Decides whether an entry (and, for directories, its subtree) is skipped.
pub(crate) trait IgnoreRule: Sync {
    fn is_ignored(&self, path: &Path) -> bool;
}

/// Disjunction of the configured regex fragments, matched against the
/// absolute path.
#[derive(Debug, Clone, Default)]
pub(crate) struct IgnorePatterns {
    combined: Option<Regex>,
}

impl IgnorePatterns {
    pub(crate) fn compile(patterns: &[String]) -> Result<Self> {
        if patterns.is_empty() {
            return Ok(Self::default());
        }
        for pattern in patterns {
            Regex::new(pattern).map_err(|err| CleanerError::invalid_pattern(pattern, err))?;
        }
        let joined = patterns
            .iter()
            .map(|p| format!("(?:{})", p))
            .collect::<Vec<_>>()
            .join("|");
        let combined =
            Regex::new(&joined).map_err(|err| CleanerError::invalid_pattern(&joined, err))?;
        Ok(IgnorePatterns {
            combined: Some(combined),
        })
    }
}

impl IgnoreRule for IgnorePatterns {
    fn is_ignored(&self, path: &Path) -> bool {
        self.combined
            .as_ref()
            .map_or(false, |re| re.is_match(&path.to_string_lossy()))
    }
}

/// Category filters: a basename is admitted when every filter matches it.
#[derive(Debug, Clone, Default)]
pub(crate) struct NameFilters {
    filters: Vec<Regex>,
}

impl NameFilters {
    pub(crate) fn compile(filters: &[String]) -> Result<Self> {
        let filters = filters
            .iter()
            .map(|f| Regex::new(f).map_err(|err| CleanerError::invalid_pattern(f, err)))
            .collect::<Result<Vec<_>>>()?;
        Ok(NameFilters { filters })
    }

    pub(crate) fn admits(&self, path: &Path) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        self.filters.iter().all(|re| re.is_match(&name))
    }
}

/// Admission rule for files found by the category scanner.
pub(crate) struct CategoryAdmission {
    pub(crate) filters: NameFilters,
    pub(crate) min_age_days: u32,
    pub(crate) now: DateTime<Utc>,
}

impl CategoryAdmission {
    pub(crate) fn admits(&self, entry: &WalkEntry) -> bool {
        if !self.filters.admits(&entry.path) {
            return false;
        }
        if self.min_age_days > 0 {
            let age = self.now.signed_duration_since(entry.meta.modified);
            if age < ChronoDuration::days(i64::from(self.min_age_days)) {
                return false;
            }
        }
        true
    }
}

pub(crate) enum WalkItem {
    Dir,
    File(FileRecord),
}

pub(crate) struct WalkOptions<'a> {
    /// Directories below the root that may be entered.
    pub(crate) max_depth: usize,
    pub(crate) ignore: &'a dyn IgnoreRule,
    pub(crate) admit: &'a dyn Fn(&WalkEntry) -> bool,
}

/// Expand `~/` and glob wildcards. A pattern without matches comes back
/// unchanged as the only root.
pub(crate) fn expand(fs: &dyn FileSystem, env: &dyn Environment, pattern: &str) -> Vec<PathBuf> {
    let expanded = match pattern.strip_prefix("~/") {
        Some(rest) => match env.home_dir() {
            Some(home) => home.join(rest).to_string_lossy().into_owned(),
            None => pattern.to_string(),
        },
        None => pattern.to_string(),
    };

    match fs.glob(&expanded) {
        Ok(matches) if !matches.is_empty() => matches,
        Ok(_) => vec![PathBuf::from(expanded)],
        Err(err) => {
            log::debug!("Treating {:?} as a literal path: {}", expanded, err);
            vec![PathBuf::from(expanded)]
        }
    }
}

/// Depth-first traversal of `root` that never follows symlinks.
///
/// A missing or non-directory root yields nothing. Unreadable entries
/// below the root are skipped; an unreadable root is reported as
/// PermissionDenied so callers can warn about it.
pub(crate) fn walk(
    fs: &dyn FileSystem,
    token: &CancellationToken,
    root: &Path,
    options: &WalkOptions<'_>,
    visit: &mut dyn FnMut(WalkItem) -> Result<()>,
) -> Result<()> {
    if token.is_cancelled() {
        return Err(CleanerError::cancelled());
    }
    match fs.symlink_metadata(root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(CleanerError::io(err, root)),
    }

    let mut entries = fs.walk(root, options.max_depth.saturating_add(1));
    while let Some(next) = entries.next_entry() {
        if token.is_cancelled() {
            return Err(CleanerError::cancelled());
        }
        let entry = match next {
            Ok(entry) => entry,
            Err(failure) if failure.source.kind() == ErrorKind::PermissionDenied => {
                if failure.path == root {
                    return Err(CleanerError::io(failure.source, root));
                }
                log::debug!("Skipping unreadable {}", failure.path.display());
                continue;
            }
            Err(failure) => return Err(CleanerError::io(failure.source, &failure.path)),
        };

        if options.ignore.is_ignored(&entry.path) {
            if entry.meta.is_dir() {
                entries.skip_current_dir();
            }
            continue;
        }

        match entry.meta.kind {
            EntryKind::Dir => visit(WalkItem::Dir)?,
            EntryKind::File => {
                if (options.admit)(&entry) {
                    visit(WalkItem::File(FileRecord {
                        size: entry.meta.len,
                        mod_time: entry.meta.modified,
                        path: entry.path,
                    }))?;
                }
            }
            EntryKind::Symlink | EntryKind::Other => {}
        }
    }
    Ok(())
}
