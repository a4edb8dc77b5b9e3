use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CleanerError, ErrorCode, Result};
use crate::file_cleaner::{Category, RiskLevel, SafetyPolicy};
use crate::platform::FileSystem;

pub const MAX_SCAN_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub max_depth: usize,             // Default: 5, range 1..=10
    pub ignore_patterns: Vec<String>, // Regex fragments matched against absolute paths
    pub enable_all: bool,             // Default: true
    pub dry_run_default: bool,        // Default: false
    pub timeout_secs: u64,            // Default: 0 (no limit)
}

impl Default for ScanSettings {
    fn default() -> Self {
        ScanSettings {
            max_depth: 5,
            ignore_patterns: vec![
                r"/\.git/".to_string(),
                r"/node_modules/".to_string(),
                r"\.lock$".to_string(),
            ],
            enable_all: true,
            dry_run_default: false,
            timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scan: ScanSettings,
    pub safety: SafetyPolicy,
    pub categories: Vec<Category>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            scan: ScanSettings::default(),
            safety: SafetyPolicy::default(),
            categories: default_categories(),
        }
    }
}

impl Config {
    /// Read the TOML document at `path`, writing the defaults there first
    /// when it does not exist yet.
    pub fn load(fs: &dyn FileSystem, path: &Path) -> Result<Self> {
        let text = match fs.read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::info!("No config at {}, writing defaults", path.display());
                let config = Config::default();
                config.save(fs, path)?;
                return Ok(config);
            }
            Err(err) => return Err(CleanerError::io(err, path)),
        };

        let config: Config = toml::from_str(&text).map_err(|err| {
            CleanerError::config(format!("failed to parse {}", path.display()))
                .with_path(path)
                .with_source(err)
        })?;
        config.validate().map_err(|err| err.with_path(path))?;
        Ok(config)
    }

    pub fn save(&self, fs: &dyn FileSystem, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|err| {
            CleanerError::config("failed to encode configuration").with_source(err)
        })?;
        if let Some(dir) = path.parent() {
            fs.create_dir_private(dir)
                .map_err(|err| CleanerError::io(err, dir))?;
        }
        fs.write_private(path, text.as_bytes())
            .map_err(|err| CleanerError::io(err, path))
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_SCAN_DEPTH).contains(&self.scan.max_depth) {
            return Err(CleanerError::config(format!(
                "max_depth must be between 1 and {}, got {}",
                MAX_SCAN_DEPTH, self.scan.max_depth
            )));
        }
        for pattern in &self.scan.ignore_patterns {
            Regex::new(pattern).map_err(|err| CleanerError::invalid_pattern(pattern, err))?;
        }
        if self.safety.shred_passes == 0 {
            return Err(CleanerError::config("shred_passes must be at least 1"));
        }
        if let Some(path) = self.safety.protected_paths.iter().find(|p| !p.is_absolute()) {
            return Err(CleanerError::config(format!(
                "protected path {} is not absolute",
                path.display()
            )));
        }

        let mut names = HashSet::new();
        for category in &self.categories {
            if category.name.trim().is_empty() {
                return Err(CleanerError::config("category name must not be empty"));
            }
            if !names.insert(category.name.as_str()) {
                return Err(CleanerError::config(format!(
                    "duplicate category name {:?}",
                    category.name
                )));
            }
            if category.paths.is_empty() {
                return Err(CleanerError::config(format!(
                    "category {:?} has no paths",
                    category.name
                )));
            }
            for filter in &category.filters {
                Regex::new(filter).map_err(|err| {
                    CleanerError::invalid_pattern(filter, err).with_context("category", &category.name)
                })?;
            }
        }
        Ok(())
    }

    pub fn category(&self, name: &str) -> Result<&Category> {
        self.categories
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| {
                CleanerError::new(
                    ErrorCode::CategoryNotFound,
                    format!("no category named {:?}", name),
                )
                .with_context("category", name)
            })
    }

    /// Every category when `enable_all`, otherwise the selected ones.
    pub fn enabled_categories(&self) -> Vec<Category> {
        self.categories
            .iter()
            .filter(|c| self.scan.enable_all || c.selected)
            .cloned()
            .collect()
    }

    /// Enabled categories a real clean may touch under the safety policy.
    /// High risk categories are left out while safe mode is on, so one of
    /// them cannot block the whole aggregate.
    pub fn cleanable_categories(&self) -> Vec<Category> {
        self.enabled_categories()
            .into_iter()
            .filter(|c| {
                let refused = self.safety.safe_mode && c.risk == RiskLevel::High;
                if refused {
                    log::warn!("Skipping High risk category {} while safe mode is on", c.name);
                }
                !refused
            })
            .collect()
    }
}

fn default_categories() -> Vec<Category> {
    vec![
        // Package managers
        Category::new("APT Cache", vec!["/var/cache/apt/archives".into()])
            .with_filters(&[r"\.deb$"]),
        Category::new("DNF Cache", vec!["/var/cache/dnf".into()])
            .with_filters(&[r"\.(rpm|solv|xml\.gz)$"]),
        Category::new("Pacman Cache", vec!["/var/cache/pacman/pkg".into()])
            .with_filters(&[r"\.pkg\.tar"])
            .with_risk(RiskLevel::Medium),
        // Developer tools
        Category::new("Pip Cache", vec!["~/.cache/pip".into()]),
        Category::new("npm Cache", vec!["~/.npm/_cacache".into()]),
        Category::new("Yarn Cache", vec!["~/.cache/yarn".into()]),
        Category::new("Cargo Registry Cache", vec!["~/.cargo/registry/cache".into()])
            .with_risk(RiskLevel::Medium),
        Category::new("Go Build Cache", vec!["~/.cache/go-build".into()]),
        // Browsers
        Category::new(
            "Firefox Cache",
            vec!["~/.cache/mozilla/firefox/*/cache2".into()],
        ),
        Category::new("Chromium Cache", vec!["~/.cache/chromium/*/Cache".into()]),
        Category::new(
            "Chrome Cache",
            vec!["~/.cache/google-chrome/*/Cache".into()],
        ),
        // Desktop
        Category::new("Thumbnails", vec!["~/.cache/thumbnails".into()]),
        Category::new("Trash", vec!["~/.local/share/Trash/files".into()])
            .with_risk(RiskLevel::Medium),
        // Logs
        Category::new("User Logs", vec!["~/.local/state".into()])
            .with_filters(&[r"\.log(\.\d+)?$"])
            .with_min_age_days(7),
        Category::new("Rotated System Logs", vec!["/var/log".into()])
            .with_filters(&[r"\.(gz|xz|old|\d+)$"])
            .with_risk(RiskLevel::Medium)
            .with_min_age_days(7),
        // Media servers
        Category::new(
            "Media Server Transcodes",
            vec![
                "/var/cache/jellyfin/transcodes".into(),
                "/tmp/Transcode".into(),
            ],
        )
        .with_min_age_days(1),
        // Crash reports
        Category::new("Crash Dumps", vec!["/var/crash".into()])
            .with_risk(RiskLevel::High)
            .shredded(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MemoryFileSystem;

    const CONFIG: &str = "/home/u/.config/linux-cleaner/config.toml";

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(config.categories.iter().all(|c| !c.paths.is_empty()));
        assert_eq!(config.enabled_categories().len(), config.categories.len());
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let fs = MemoryFileSystem::new();
        let loaded = Config::load(&fs, Path::new(CONFIG)).unwrap();
        assert_eq!(loaded, Config::default());
        assert_eq!(fs.mode(CONFIG), Some(0o600));
        assert_eq!(Config::load(&fs, Path::new(CONFIG)).unwrap(), loaded);
    }

    #[test]
    fn partial_documents_fill_in_defaults() {
        let fs = MemoryFileSystem::new();
        fs.add_file(
            CONFIG,
            r#"
[scan]
max_depth = 3
enable_all = false

[safety]
safe_mode = false

[[categories]]
name = "Scratch"
paths = ["/tmp/scratch"]
filters = ['\.tmp$']
risk = "high"
min_age_days = 2
selected = true

[[categories]]
name = "Other"
paths = ["/tmp/other"]
"#,
        );
        let config = Config::load(&fs, Path::new(CONFIG)).unwrap();
        assert_eq!(config.scan.max_depth, 3);
        assert!(!config.safety.safe_mode);
        assert_eq!(config.safety.max_deletion_size_mb, 10 * 1024);

        let enabled = config.enabled_categories();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].risk, RiskLevel::High);
        assert_eq!(enabled[0].min_age_days, Some(2));
        assert_eq!(config.category("Other").unwrap().paths, vec!["/tmp/other"]);
        assert_eq!(
            config.category("Nope").unwrap_err().code(),
            ErrorCode::CategoryNotFound
        );
    }

    #[test]
    fn safe_mode_keeps_high_risk_out_of_the_cleanable_set() {
        let mut config = Config::default();
        let cleanable = config.cleanable_categories();
        assert!(cleanable.iter().all(|c| c.risk != RiskLevel::High));
        assert!(!cleanable.iter().any(|c| c.name == "Crash Dumps"));
        assert_eq!(cleanable.len(), config.enabled_categories().len() - 1);

        config.safety.safe_mode = false;
        assert_eq!(config.cleanable_categories(), config.enabled_categories());
    }

    #[test]
    fn validation_rejects_bad_documents() {
        let mut config = Config::default();
        config.scan.max_depth = 11;
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::ConfigInvalid);

        let mut config = Config::default();
        config.categories[0].filters = vec!["(".into()];
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::InvalidPattern);

        let mut config = Config::default();
        let duplicate = config.categories[0].clone();
        config.categories.push(duplicate);
        assert_eq!(config.validate().unwrap_err().code(), ErrorCode::ConfigInvalid);

        let mut config = Config::default();
        config.safety.protected_paths.push("relative/dir".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn unparseable_toml_is_a_config_error() {
        let fs = MemoryFileSystem::new();
        fs.add_file(CONFIG, "[scan\nmax_depth = ");
        let err = Config::load(&fs, Path::new(CONFIG)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigInvalid);
    }
}
