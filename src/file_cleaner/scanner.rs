use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::session::{SessionCache, TOTAL_CATEGORY};
use super::types::Category;
use super::walker::{self, CategoryAdmission, IgnorePatterns, NameFilters, WalkItem, WalkOptions};
use crate::config::ScanSettings;
use crate::error::{CleanerError, Result};
use crate::ops::{wait_for_completion, Event, EventEmitter};
use crate::platform::{Clock, Environment, FileSystem, WalkEntry};

/// Admissions between two progress events.
const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanProgress {
    pub path: PathBuf,
    pub bytes: u64,
    pub files_scanned: usize,
    pub dirs_scanned: usize,
    pub current_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ScanCompletion {
    pub category: Category,
    pub duration: Duration,
}

pub type ScanEvent = Event<ScanProgress, ScanCompletion>;

/// Walks the roots of a category and accumulates the files it admits.
#[derive(Clone)]
pub struct Scanner {
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    env: Arc<dyn Environment>,
    ignore: Arc<IgnorePatterns>,
    max_depth: usize,
}

impl Scanner {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        clock: Arc<dyn Clock>,
        env: Arc<dyn Environment>,
        settings: &ScanSettings,
    ) -> Result<Self> {
        Ok(Scanner {
            fs,
            clock,
            env,
            ignore: Arc::new(IgnorePatterns::compile(&settings.ignore_patterns)?),
            max_depth: settings.max_depth,
        })
    }

    /// Scan one category on a blocking thread. The stream ends with one
    /// `Complete` or one `Error`.
    pub fn scan_category(
        &self,
        token: CancellationToken,
        category: &Category,
    ) -> mpsc::Receiver<ScanEvent> {
        let (emitter, rx) = EventEmitter::channel(token);
        let scanner = self.clone();
        let category = category.clone();

        tokio::task::spawn_blocking(move || {
            log::info!("Scanning category {}", category.name);
            match scanner.run(&emitter, &category) {
                Ok(completion) => {
                    log::info!(
                        "Category {}: {} files, {} bytes in {:?}",
                        category.name,
                        completion.category.file_count,
                        completion.category.size,
                        completion.duration
                    );
                    if let Err(err) = emitter.complete(completion) {
                        emitter.error(err.into());
                    }
                }
                Err(err) => emitter.error(err),
            }
        });
        rx
    }

    fn run(
        &self,
        emitter: &EventEmitter<ScanProgress, ScanCompletion>,
        category: &Category,
    ) -> Result<ScanCompletion> {
        let started = Instant::now();
        let mut working = category.working_copy();
        let admission = CategoryAdmission {
            filters: NameFilters::compile(&category.filters)?,
            min_age_days: category.min_age_days.unwrap_or(0),
            now: self.clock.now(),
        };
        let admit = |entry: &WalkEntry| admission.admits(entry);
        let options = WalkOptions {
            max_depth: self.max_depth,
            ignore: self.ignore.as_ref(),
            admit: &admit,
        };
        let mut dirs_scanned = 0usize;

        for pattern in &category.paths {
            for root in walker::expand(self.fs.as_ref(), self.env.as_ref(), pattern) {
                let outcome = walker::walk(
                    self.fs.as_ref(),
                    emitter.token(),
                    &root,
                    &options,
                    &mut |item| {
                        match item {
                            WalkItem::Dir => dirs_scanned += 1,
                            WalkItem::File(record) => {
                                let path = record.path.clone();
                                working.admit(record);
                                if working.file_count % PROGRESS_EVERY == 0 {
                                    emitter.progress(ScanProgress {
                                        current_dir: path
                                            .parent()
                                            .map(PathBuf::from)
                                            .unwrap_or_default(),
                                        path,
                                        bytes: working.size,
                                        files_scanned: working.file_count,
                                        dirs_scanned,
                                    })?;
                                }
                            }
                        }
                        Ok(())
                    },
                );
                match outcome {
                    Ok(()) => {}
                    Err(err) if err.is_permission_denied() => {
                        log::warn!(
                            "Skipping inaccessible {} in {}: {}",
                            root.display(),
                            category.name,
                            err
                        );
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        Ok(ScanCompletion {
            category: working,
            duration: started.elapsed(),
        })
    }

    /// Whether any expanded root of `category` exists.
    pub fn has_existing_root(&self, category: &Category) -> bool {
        category.paths.iter().any(|pattern| {
            walker::expand(self.fs.as_ref(), self.env.as_ref(), pattern)
                .iter()
                .any(|root| self.fs.exists(root))
        })
    }

    /// Scan `categories` one after another and fold them into one session.
    ///
    /// Categories without any existing root are skipped, as are categories
    /// whose scan fails with anything but cancellation.
    pub async fn scan_all(
        &self,
        token: &CancellationToken,
        categories: &[Category],
    ) -> Result<SessionCache> {
        let mut total = Category::new(TOTAL_CATEGORY, Vec::new());

        for category in categories {
            if token.is_cancelled() {
                return Err(CleanerError::cancelled());
            }
            if !self.has_existing_root(category) {
                log::debug!("Skipping {}: no existing paths", category.name);
                continue;
            }

            let mut rx = self.scan_category(token.clone(), category);
            match wait_for_completion(&mut rx, |_| {}).await {
                Ok(completion) => merge_into(&mut total, completion.category),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => log::warn!("Skipping category {}: {}", category.name, err),
            }
        }

        Ok(SessionCache::new(total, self.clock.now()))
    }
}

fn merge_into(total: &mut Category, scanned: Category) {
    for path in &scanned.paths {
        if !total.paths.contains(path) {
            total.paths.push(path.clone());
        }
    }
    if scanned.file_count == 0 {
        return;
    }
    total.risk = total.risk.max(scanned.risk);
    total.shred_enabled |= scanned.shred_enabled;
    for record in scanned.files {
        total.admit(record);
    }
}
