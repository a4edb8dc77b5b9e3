use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{CleanerError, ErrorCode, Result};

pub const APP_NAME: &str = "linux-cleaner";

pub trait Environment: Send + Sync {
    fn var(&self, key: &str) -> Option<String>;

    fn home_dir(&self) -> Option<PathBuf> {
        self.non_empty("HOME").map(PathBuf::from)
    }

    fn non_empty(&self, key: &str) -> Option<String> {
        self.var(key).filter(|value| !value.trim().is_empty())
    }
}

/// Reads the real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn home_dir(&self) -> Option<PathBuf> {
        self.non_empty("HOME")
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
    }
}

/// Map-backed environment used by tests and embedders.
#[derive(Debug, Default, Clone)]
pub struct StaticEnv {
    vars: HashMap<String, String>,
}

impl StaticEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.vars.insert(key.to_string(), value.into());
        self
    }
}

impl Environment for StaticEnv {
    fn var(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

/// Locations of every artifact the cleaner reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub home: PathBuf,
    pub config_file: PathBuf,
    pub session_cache: PathBuf,
    pub audit_log: PathBuf,
    pub backup_dir: PathBuf,
}

impl AppPaths {
    pub fn from_env(env: &dyn Environment) -> Result<Self> {
        let home = env.home_dir().ok_or_else(|| {
            CleanerError::new(ErrorCode::ConfigInvalid, "could not determine home directory")
                .with_suggestion("Set the HOME environment variable")
        })?;

        let config_root = env
            .non_empty("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".config"));
        let cache_root = env
            .non_empty("XDG_CACHE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".cache"));
        let data_root = env
            .non_empty("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".local").join("share"));

        Ok(AppPaths {
            config_file: config_root.join(APP_NAME).join("config.toml"),
            session_cache: cache_root.join(APP_NAME).join("scan_results.json"),
            audit_log: home
                .join(".local")
                .join("share")
                .join(APP_NAME)
                .join("logs")
                .join("audit.log"),
            backup_dir: data_root.join(APP_NAME).join("backups"),
            home,
        })
    }
}
