use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::types::Category;
use crate::error::{CleanerError, ErrorCode, Result};
use crate::format::humanize;
use crate::platform::FileSystem;

const MANIFEST_SUFFIX: &str = ".tar.gz.manifest";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const HEADER: &str = "# Deletion manifest. Lists what was removed; it cannot restore anything.";

/// Text record of one real clean: when, which category, and every path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupManifest {
    pub created_at: DateTime<Utc>,
    pub category: String,
    pub file_count: usize,
    pub total_size: u64,
    pub paths: Vec<PathBuf>,
}

impl BackupManifest {
    pub fn for_category(category: &Category, created_at: DateTime<Utc>) -> Self {
        BackupManifest {
            created_at,
            category: category.name.clone(),
            file_count: category.file_count,
            total_size: category.size,
            paths: category.files.iter().map(|f| f.path.clone()).collect(),
        }
    }

    /// `<category>_<YYYYMMDD_HHMMSS>.tar.gz.manifest`
    pub fn file_name(&self) -> String {
        let name: String = self
            .category
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!(
            "{}_{}{}",
            name,
            self.created_at.format(STAMP_FORMAT),
            MANIFEST_SUFFIX
        )
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", HEADER);
        let _ = writeln!(out, "Timestamp: {}", self.created_at.to_rfc3339());
        let _ = writeln!(out, "Category: {}", self.category);
        let _ = writeln!(out, "Files: {}", self.file_count);
        let _ = writeln!(
            out,
            "Total Size: {} ({})",
            self.total_size,
            humanize(self.total_size)
        );
        out.push('\n');
        for path in &self.paths {
            let _ = writeln!(out, "{}", path.display());
        }
        out
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut created_at = None;
        let mut category = None;
        let mut file_count = None;
        let mut total_size = None;
        let mut lines = text.lines();

        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
            if line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| corrupted(format!("malformed header line {:?}", line)))?;
            match key {
                "Timestamp" => {
                    let parsed = DateTime::parse_from_rfc3339(value)
                        .map_err(|err| corrupted("invalid timestamp").with_source(err))?;
                    created_at = Some(parsed.with_timezone(&Utc));
                }
                "Category" => category = Some(value.to_string()),
                "Files" => {
                    file_count = Some(
                        value
                            .parse::<usize>()
                            .map_err(|err| corrupted("invalid file count").with_source(err))?,
                    )
                }
                "Total Size" => {
                    let bytes = value.split_whitespace().next().unwrap_or_default();
                    total_size = Some(
                        bytes
                            .parse::<u64>()
                            .map_err(|err| corrupted("invalid total size").with_source(err))?,
                    )
                }
                other => log::debug!("Ignoring unknown manifest header {:?}", other),
            }
        }

        let paths: Vec<PathBuf> = lines
            .filter(|line| !line.is_empty())
            .map(PathBuf::from)
            .collect();

        let manifest = BackupManifest {
            created_at: created_at.ok_or_else(|| corrupted("missing Timestamp"))?,
            category: category.ok_or_else(|| corrupted("missing Category"))?,
            file_count: file_count.ok_or_else(|| corrupted("missing Files"))?,
            total_size: total_size.ok_or_else(|| corrupted("missing Total Size"))?,
            paths,
        };
        if manifest.file_count != manifest.paths.len() {
            return Err(corrupted(format!(
                "header lists {} files but {} paths follow",
                manifest.file_count,
                manifest.paths.len()
            )));
        }
        Ok(manifest)
    }

    pub fn read(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let text = fs
            .read_to_string(path)
            .map_err(|err| CleanerError::io(err, path))?;
        Self::parse(&text).map_err(|err| err.with_path(path))
    }

    /// Write the manifest into `dir`, returning its path.
    pub(crate) fn write(&self, fs: &dyn FileSystem, dir: &Path) -> Result<PathBuf> {
        let target = dir.join(self.file_name());
        fs.create_dir_private(dir)
            .and_then(|()| fs.write_private(&target, self.render().as_bytes()))
            .map_err(|err| {
                CleanerError::new(
                    ErrorCode::BackupFailed,
                    format!("failed to write manifest for {}", self.category),
                )
                .with_path(&target)
                .with_source(err)
            })?;
        Ok(target)
    }
}

fn corrupted(message: impl Into<String>) -> CleanerError {
    CleanerError::new(ErrorCode::BackupCorrupted, message)
}

/// Manifests in `dir`, newest first. A missing directory has none.
pub fn list_manifests(fs: &dyn FileSystem, dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs.read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(CleanerError::io(err, dir)),
    };
    let mut manifests: Vec<(String, PathBuf)> = entries
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let stem = name.strip_suffix(MANIFEST_SUFFIX)?;
            let stamp = stem.get(stem.len().checked_sub(15)?..)?.to_string();
            Some((stamp, path))
        })
        .collect();
    manifests.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    Ok(manifests.into_iter().map(|(_, path)| path).collect())
}
