use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backup::BackupManifest;
use super::safety::{ProtectedPaths, SafetyPolicy};
use super::shredder;
use super::types::{Category, FileRecord};
use crate::audit::AuditSink;
use crate::error::{CleanerError, ErrorCode, Result};
use crate::ops::{Event, EventEmitter};
use crate::platform::{Clock, FileSystem, RandomSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanProgress {
    pub files_processed: usize,
    pub bytes_freed: u64,
    pub current_file: PathBuf,
    pub total_files: usize,
    pub total_bytes: u64,
}

#[derive(Debug)]
pub struct CleanCompletion {
    pub category: String,
    pub files_deleted: usize,
    pub bytes_freed: u64,
    pub duration: Duration,
    pub backup_created: bool,
    pub backup_path: Option<PathBuf>,
    /// Per-file failures; the files they name were left in place.
    pub errors: Vec<CleanerError>,
}

pub type CleanEvent = Event<CleanProgress, CleanCompletion>;

#[derive(Default)]
struct Tally {
    files_deleted: usize,
    bytes_freed: u64,
    errors: Vec<CleanerError>,
}

/// Deletes the files of a scanned category under a [`SafetyPolicy`].
#[derive(Clone)]
pub struct Cleaner {
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    audit: Arc<dyn AuditSink>,
    policy: SafetyPolicy,
    backup_dir: PathBuf,
}

impl Cleaner {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        random: Arc<dyn RandomSource>,
        audit: Arc<dyn AuditSink>,
        policy: SafetyPolicy,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        Cleaner {
            fs,
            clock,
            random,
            audit,
            policy,
            backup_dir: backup_dir.into(),
        }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// Clean one category on a blocking thread. Safety checks run before
    /// anything is touched, dry run included.
    pub fn clean_category(
        &self,
        token: CancellationToken,
        category: &Category,
        dry_run: bool,
    ) -> mpsc::Receiver<CleanEvent> {
        let (emitter, rx) = EventEmitter::channel(token);
        let cleaner = self.clone();
        let category = category.clone();

        tokio::task::spawn_blocking(move || {
            log::info!(
                "Cleaning category {} ({} files, dry_run={})",
                category.name,
                category.file_count,
                dry_run
            );
            match cleaner.run(&emitter, &category, dry_run) {
                Ok(completion) => {
                    log::info!(
                        "Category {}: {} files, {} bytes freed, {} errors",
                        completion.category,
                        completion.files_deleted,
                        completion.bytes_freed,
                        completion.errors.len()
                    );
                    if let Err(err) = emitter.complete(completion) {
                        emitter.error(err.into());
                    }
                }
                Err(err) => {
                    log::warn!("Cleaning {} stopped: {}", category.name, err);
                    emitter.error(err);
                }
            }
        });
        rx
    }

    fn run(
        &self,
        emitter: &EventEmitter<CleanProgress, CleanCompletion>,
        category: &Category,
        dry_run: bool,
    ) -> Result<CleanCompletion> {
        let started = Instant::now();
        let fs = self.fs.as_ref();
        let protected = ProtectedPaths::new(fs, &self.policy);
        self.policy.preflight(fs, &protected, category, dry_run)?;
        if emitter.is_cancelled() {
            return Err(CleanerError::cancelled());
        }

        let mut backup_path = None;
        if !dry_run && self.policy.backup_enabled {
            let manifest = BackupManifest::for_category(category, self.clock.now());
            match manifest.write(fs, &self.backup_dir) {
                Ok(path) => backup_path = Some(path),
                Err(err) if self.policy.safe_mode => return Err(err),
                Err(err) => log::warn!("Continuing without manifest: {}", err),
            }
        }

        let mut tally = Tally::default();
        let outcome = self.remove_all(emitter, &protected, category, dry_run, &mut tally);

        if !dry_run {
            let error = match &outcome {
                Ok(()) => tally.errors.first().map(ToString::to_string),
                Err(err) if err.is_cancelled() => Some("cancelled".to_string()),
                Err(err) => Some(err.to_string()),
            };
            self.record(category, tally.files_deleted, tally.bytes_freed, error.as_deref());
        }
        outcome?;

        Ok(CleanCompletion {
            category: category.name.clone(),
            files_deleted: tally.files_deleted,
            bytes_freed: tally.bytes_freed,
            duration: started.elapsed(),
            backup_created: backup_path.is_some(),
            backup_path,
            errors: tally.errors,
        })
    }

    /// The per-file loop. Stops at cancellation or when the consumer is
    /// gone; `tally` holds what was done up to that point either way.
    fn remove_all(
        &self,
        emitter: &EventEmitter<CleanProgress, CleanCompletion>,
        protected: &ProtectedPaths,
        category: &Category,
        dry_run: bool,
        tally: &mut Tally,
    ) -> Result<()> {
        for file in &category.files {
            if emitter.is_cancelled() {
                return Err(CleanerError::cancelled());
            }
            emitter.progress(CleanProgress {
                files_processed: tally.files_deleted,
                bytes_freed: tally.bytes_freed,
                current_file: file.path.clone(),
                total_files: category.file_count,
                total_bytes: category.size,
            })?;

            if dry_run {
                tally.files_deleted += 1;
                tally.bytes_freed += file.size;
                continue;
            }

            match self.remove_one(protected, file, category.shred_enabled) {
                Ok(size) => {
                    tally.files_deleted += 1;
                    tally.bytes_freed += size;
                }
                Err(err) => {
                    log::warn!("Failed to delete {}: {}", file.path.display(), err);
                    tally.errors.push(err);
                }
            }
        }
        Ok(())
    }

    /// Unlink one file, overwriting it first when asked. Returns the size
    /// it had at deletion time.
    fn remove_one(&self, protected: &ProtectedPaths, file: &FileRecord, shred: bool) -> Result<u64> {
        let fs = self.fs.as_ref();
        protected.check(fs, &file.path)?;

        let meta = fs
            .symlink_metadata(&file.path)
            .map_err(|err| CleanerError::io(err, &file.path))?;
        if meta.is_dir() {
            return Err(CleanerError::new(
                ErrorCode::InvalidPath,
                format!("{} is now a directory", file.path.display()),
            )
            .with_path(&file.path));
        }

        // Symlinks are unlinked but never written through.
        if shred && meta.is_file() && meta.len > 0 {
            shredder::overwrite(
                fs,
                self.random.as_ref(),
                &file.path,
                meta.len,
                self.policy.passes(),
            )?;
        }

        fs.remove_file(&file.path)
            .map_err(|err| CleanerError::io(err, &file.path))?;
        Ok(meta.len)
    }

    fn record(&self, category: &Category, files: usize, bytes: u64, error: Option<&str>) {
        if let Err(err) = self.audit.log_clean(&category.name, files, bytes, error) {
            log::warn!("Failed to write audit entry for {}: {}", category.name, err);
        }
    }
}
