//! Append-only record of the actions that changed the system.
//!
//! One line per entry:
//! `[<RFC3339>] user=<name> operation=<op> args=[<a> <b>] result=<str>[ error=<text>]`

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{CleanerError, ErrorCode, Result};
use crate::platform::{Clock, Environment, FileHandle, FileSystem};

const LOG_MODE: u32 = 0o600;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    /// Filled from the sink's clock when absent.
    pub timestamp: Option<DateTime<Utc>>,
    /// Filled from the environment when absent.
    pub user: Option<String>,
    pub operation: String,
    pub args: Vec<String>,
    pub result: String,
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn new(operation: impl Into<String>, result: impl Into<String>) -> Self {
        AuditEntry {
            timestamp: None,
            user: None,
            operation: operation.into(),
            args: Vec::new(),
            result: result.into(),
            error: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn render(&self) -> String {
        let timestamp = self
            .timestamp
            .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        let mut line = format!(
            "[{}] user={} operation={} args=[{}] result={}",
            timestamp,
            self.user.as_deref().unwrap_or("unknown"),
            self.operation,
            self.args.join(" "),
            self.result
        );
        if let Some(error) = &self.error {
            line.push_str(" error=");
            line.push_str(error);
        }
        line
    }
}

/// Where audit entries go. Implementations serialize concurrent writers.
pub trait AuditSink: Send + Sync {
    fn log(&self, entry: AuditEntry) -> Result<()>;

    fn close(&self) -> Result<()>;

    fn log_package(&self, action: &str, packages: &[String], result: &str) -> Result<()> {
        self.log(AuditEntry::new(format!("package_{}", action), result).with_args(packages.iter().cloned()))
    }

    fn log_service(&self, action: &str, service: &str, result: &str) -> Result<()> {
        self.log(AuditEntry::new(format!("service_{}", action), result).with_args([service]))
    }

    fn log_container(&self, action: &str, container: &str, result: &str) -> Result<()> {
        self.log(AuditEntry::new(format!("container_{}", action), result).with_args([container]))
    }

    fn log_clean(
        &self,
        category: &str,
        files: usize,
        bytes: u64,
        error: Option<&str>,
    ) -> Result<()> {
        let result = if error.is_some() { "partial" } else { "success" };
        let mut entry = AuditEntry::new("clean", result).with_args([
            category.replace(' ', "_"),
            files.to_string(),
            bytes.to_string(),
        ]);
        if let Some(error) = error {
            entry = entry.with_error(error);
        }
        self.log(entry)
    }
}

/// First non-empty of the configured name, `USER`, `SUDO_USER`.
pub fn resolve_user(configured: Option<&str>, env: &dyn Environment) -> String {
    configured
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .or_else(|| env.non_empty("USER"))
        .or_else(|| env.non_empty("SUDO_USER"))
        .unwrap_or_else(|| "unknown".to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Appends to the audit log file and syncs after every line.
pub struct FileAuditLogger {
    clock: Arc<dyn Clock>,
    user: String,
    path: PathBuf,
    handle: Mutex<Option<Box<dyn FileHandle>>>,
}

impl FileAuditLogger {
    pub fn open(
        fs: &dyn FileSystem,
        clock: Arc<dyn Clock>,
        env: &dyn Environment,
        configured_user: Option<&str>,
        path: &Path,
    ) -> Result<Self> {
        if let Some(dir) = path.parent() {
            fs.create_dir_private(dir)
                .map_err(|err| CleanerError::io(err, dir))?;
        }
        let handle = fs
            .open_append(path, LOG_MODE)
            .map_err(|err| CleanerError::io(err, path))?;
        Ok(FileAuditLogger {
            clock,
            user: resolve_user(configured_user, env),
            path: path.to_path_buf(),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for FileAuditLogger {
    fn log(&self, mut entry: AuditEntry) -> Result<()> {
        entry.timestamp.get_or_insert_with(|| self.clock.now());
        if entry.user.as_deref().map_or(true, str::is_empty) {
            entry.user = Some(self.user.clone());
        }
        let mut line = entry.render();
        line.push('\n');

        let mut guard = lock(&self.handle);
        let handle = guard.as_mut().ok_or_else(|| {
            CleanerError::new(ErrorCode::CleanFailed, "audit log is closed").with_path(&self.path)
        })?;
        handle
            .write_all(line.as_bytes())
            .and_then(|()| handle.sync_all())
            .map_err(|err| CleanerError::io(err, &self.path))
    }

    fn close(&self) -> Result<()> {
        if let Some(mut handle) = lock(&self.handle).take() {
            handle
                .sync_all()
                .map_err(|err| CleanerError::io(err, &self.path))?;
        }
        Ok(())
    }
}

/// Discards every entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn log(&self, _entry: AuditEntry) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Keeps entries in memory for inspection.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn log(&self, entry: AuditEntry) -> Result<()> {
        lock(&self.entries).push(entry);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
