use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::audit::{AuditEntry, AuditSink, FileAuditLogger, NullAuditSink};
use crate::config::Config;
use crate::error::{CleanerError, ErrorCode, Result};
use crate::file_cleaner::{
    list_manifests, Category, CleanCompletion, CleanProgress, Cleaner, DuplicateDetector,
    DuplicateOptions, DuplicateProgress, DuplicateRemoval, DuplicateScanResult, ProtectedPaths,
    ScanProgress, Scanner, SessionCache, SessionStore,
};
use crate::ops::wait_for_completion;
use crate::platform::{
    AppPaths, Clock, Environment, FileSystem, OsFileSystem, OsRandom, ProcessEnv, RandomSource,
    SystemClock,
};

/// Wires configuration and collaborators into the scan, clean and
/// duplicate flows.
pub struct App {
    config: Config,
    paths: AppPaths,
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    env: Arc<dyn Environment>,
    random: Arc<dyn RandomSource>,
    audit: Arc<dyn AuditSink>,
}

impl App {
    pub fn new(
        config: Config,
        paths: AppPaths,
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        env: Arc<dyn Environment>,
        random: Arc<dyn RandomSource>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        App {
            config,
            paths,
            fs,
            clock,
            env,
            random,
            audit,
        }
    }

    /// Real filesystem, process environment and the on-disk audit log.
    /// `config_path` overrides the XDG location.
    pub fn from_process(config_path: Option<PathBuf>) -> Result<Self> {
        let env: Arc<dyn Environment> = Arc::new(ProcessEnv);
        let fs: Arc<dyn FileSystem> = Arc::new(OsFileSystem);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let mut paths = AppPaths::from_env(env.as_ref())?;
        if let Some(path) = config_path {
            paths.config_file = path;
        }
        let config = Config::load(fs.as_ref(), &paths.config_file)?;

        let audit: Arc<dyn AuditSink> = match FileAuditLogger::open(
            fs.as_ref(),
            Arc::clone(&clock),
            env.as_ref(),
            None,
            &paths.audit_log,
        ) {
            Ok(logger) => Arc::new(logger),
            Err(err) => {
                log::warn!("Audit log unavailable, actions will not be recorded: {}", err);
                Arc::new(NullAuditSink)
            }
        };

        Ok(App::new(
            config,
            paths,
            fs,
            clock,
            env,
            Arc::new(OsRandom),
            audit,
        ))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn session(&self) -> SessionStore {
        SessionStore::new(Arc::clone(&self.fs), self.paths.session_cache.clone())
    }

    pub fn scanner(&self) -> Result<Scanner> {
        Scanner::new(
            Arc::clone(&self.fs),
            Arc::clone(&self.clock),
            Arc::clone(&self.env),
            &self.config.scan,
        )
    }

    pub fn cleaner(&self) -> Cleaner {
        Cleaner::new(
            Arc::clone(&self.fs),
            Arc::clone(&self.clock),
            Arc::clone(&self.random),
            Arc::clone(&self.audit),
            self.config.safety.clone(),
            self.paths.backup_dir.clone(),
        )
    }

    pub fn detector(&self) -> DuplicateDetector {
        DuplicateDetector::new(Arc::clone(&self.fs))
    }

    /// Scan every enabled category the safety policy allows cleaning and
    /// persist the aggregate. Honors `[scan].timeout_secs` by cancelling a
    /// child of `token`.
    pub async fn scan_and_save(&self, token: &CancellationToken) -> Result<SessionCache> {
        let scanner = self.scanner()?;
        let categories = self.config.cleanable_categories();
        let scan_token = token.child_token();

        let cache = match self.config.scan.timeout_secs {
            0 => scanner.scan_all(&scan_token, &categories).await?,
            secs => {
                let limit = Duration::from_secs(secs);
                match tokio::time::timeout(limit, scanner.scan_all(&scan_token, &categories)).await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        scan_token.cancel();
                        return Err(CleanerError::new(
                            ErrorCode::ScanTimeout,
                            format!("scan did not finish within {}s", secs),
                        )
                        .with_context("timeout_secs", secs));
                    }
                }
            }
        };

        self.session().save(&cache)?;
        log::info!(
            "Saved scan of {} files ({} bytes)",
            cache.total_files,
            cache.total_size
        );
        Ok(cache)
    }

    /// Stream progress of a scan of one named category.
    pub async fn scan_category(
        &self,
        token: &CancellationToken,
        name: &str,
        on_progress: impl FnMut(ScanProgress),
    ) -> Result<Category> {
        let category = self.config.category(name)?;
        let mut rx = self.scanner()?.scan_category(token.clone(), category);
        Ok(wait_for_completion(&mut rx, on_progress).await?.category)
    }

    /// Clean what the last `scan_and_save` found. A real clean clears the
    /// session cache afterwards.
    pub async fn clean_cached(
        &self,
        token: &CancellationToken,
        dry_run: bool,
        on_progress: impl FnMut(CleanProgress),
    ) -> Result<CleanCompletion> {
        let session = self.session();
        let cache = session.load()?;
        let mut rx = self
            .cleaner()
            .clean_category(token.clone(), &cache.scan_results, dry_run);
        let completion = wait_for_completion(&mut rx, on_progress).await?;
        if !dry_run {
            session.clear()?;
        }
        Ok(completion)
    }

    pub async fn find_duplicates(
        &self,
        token: &CancellationToken,
        options: DuplicateOptions,
        on_progress: impl FnMut(DuplicateProgress),
    ) -> Result<DuplicateScanResult> {
        let mut rx = self.detector().scan(token.clone(), options);
        wait_for_completion(&mut rx, on_progress).await
    }

    /// Remove the given duplicate copies. Protected paths are refused and
    /// reported like any other per-path failure.
    pub fn remove_duplicates(&self, paths: &[PathBuf]) -> DuplicateRemoval {
        let protected = ProtectedPaths::new(self.fs.as_ref(), &self.config.safety);
        let mut refused = Vec::new();
        let allowed: Vec<PathBuf> = paths
            .iter()
            .filter(|path| match protected.check(self.fs.as_ref(), path) {
                Ok(()) => true,
                Err(err) => {
                    refused.push(err);
                    false
                }
            })
            .cloned()
            .collect();

        let mut removal = self.detector().remove_duplicates(&allowed);
        removal.errors.extend(refused);

        let result = if removal.errors.is_empty() {
            "success"
        } else {
            "partial"
        };
        let mut entry = AuditEntry::new("remove_duplicates", result)
            .with_args([removal.removed.to_string(), removal.bytes_freed.to_string()]);
        if let Some(err) = removal.errors.first() {
            entry = entry.with_error(err.to_string());
        }
        if let Err(err) = self.audit.log(entry) {
            log::warn!("Failed to write audit entry: {}", err);
        }
        removal
    }

    /// Deletion manifests, newest first.
    pub fn manifests(&self) -> Result<Vec<PathBuf>> {
        list_manifests(self.fs.as_ref(), &self.paths.backup_dir)
    }

    pub fn close(&self) -> Result<()> {
        self.audit.close()
    }
}
