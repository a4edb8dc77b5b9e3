use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::FileRecord;
use super::walker::{self, IgnoreRule, WalkItem, WalkOptions};
use crate::error::{CleanerError, ErrorCode, Result};
use crate::ops::{Event, EventEmitter};
use crate::platform::{FileSystem, WalkEntry};

/// Size of the hashing pool.
pub const HASH_WORKERS: usize = 4;
pub const DEFAULT_MIN_SIZE: u64 = 1024;

const HASH_BUFFER_BYTES: usize = 64 * 1024;
const PROGRESS_EVERY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateOptions {
    pub paths: Vec<PathBuf>,
    pub min_size: u64,
    /// Upper size bound; 0 means unbounded.
    pub max_size: u64,
    /// Basename globs; a matching directory is not entered.
    pub ignore_patterns: Vec<String>,
    /// Directories below each root that may be entered; 0 means unlimited.
    pub max_depth: usize,
}

impl Default for DuplicateOptions {
    fn default() -> Self {
        DuplicateOptions {
            paths: Vec::new(),
            min_size: DEFAULT_MIN_SIZE,
            max_size: 0,
            ignore_patterns: Vec::new(),
            max_depth: 0,
        }
    }
}

impl DuplicateOptions {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        DuplicateOptions {
            paths,
            ..Self::default()
        }
    }

    fn admits_size(&self, size: u64) -> bool {
        size >= self.min_size && (self.max_size == 0 || size <= self.max_size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateProgress {
    pub files_scanned: usize,
    pub bytes_scanned: u64,
    pub current_file: PathBuf,
    pub phase: String,
}

/// Files with identical content, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub hash: String,
    pub size: u64,
    pub files: Vec<FileRecord>,
    pub wasted: u64,
}

impl DuplicateGroup {
    pub fn original(&self) -> Option<&FileRecord> {
        self.files.first()
    }

    pub fn redundant(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().skip(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DuplicateScanResult {
    pub groups: Vec<DuplicateGroup>,
    pub files_scanned: usize,
    pub wasted_space: u64,
    pub total_dupes: usize,
    pub duration: Duration,
}

#[derive(Debug, Default)]
pub struct DuplicateRemoval {
    pub removed: usize,
    pub bytes_freed: u64,
    pub errors: Vec<CleanerError>,
}

pub type DuplicateEvent = Event<DuplicateProgress, DuplicateScanResult>;

struct BasenameGlobs(Vec<glob::Pattern>);

impl BasenameGlobs {
    fn compile(patterns: &[String]) -> Result<Self> {
        patterns
            .iter()
            .map(|p| {
                glob::Pattern::new(p).map_err(|err| {
                    CleanerError::new(ErrorCode::InvalidPattern, format!("invalid glob {:?}", p))
                        .with_context("pattern", p)
                        .with_source(err)
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(BasenameGlobs)
    }
}

impl IgnoreRule for BasenameGlobs {
    fn is_ignored(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.0.iter().any(|pattern| pattern.matches(name))
    }
}

type HashMapByDigest = HashMap<String, Vec<FileRecord>>;

/// Finds files with identical content: bucket by size, then hash buckets
/// of two or more.
#[derive(Clone)]
pub struct DuplicateDetector {
    fs: Arc<dyn FileSystem>,
}

impl DuplicateDetector {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        DuplicateDetector { fs }
    }

    pub fn scan(
        &self,
        token: CancellationToken,
        options: DuplicateOptions,
    ) -> mpsc::Receiver<DuplicateEvent> {
        let (emitter, rx) = EventEmitter::channel(token);
        let detector = self.clone();

        tokio::task::spawn_blocking(move || match detector.run(&emitter, &options) {
            Ok(result) => {
                log::info!(
                    "Duplicate scan: {} groups, {} redundant files, {} bytes wasted",
                    result.groups.len(),
                    result.total_dupes,
                    result.wasted_space
                );
                if let Err(err) = emitter.complete(result) {
                    emitter.error(err.into());
                }
            }
            Err(err) => emitter.error(err),
        });
        rx
    }

    fn run(
        &self,
        emitter: &EventEmitter<DuplicateProgress, DuplicateScanResult>,
        options: &DuplicateOptions,
    ) -> Result<DuplicateScanResult> {
        let started = Instant::now();
        let (buckets, files_scanned) = self.collect(emitter, options)?;

        let candidates: Vec<Vec<FileRecord>> = buckets
            .into_values()
            .filter(|bucket| bucket.len() >= 2)
            .collect();
        log::debug!("Hashing {} size groups", candidates.len());

        let by_digest = self.hash_buckets(emitter, candidates)?;
        let groups = group(by_digest);

        Ok(DuplicateScanResult {
            wasted_space: groups.iter().map(|g| g.wasted).sum(),
            total_dupes: groups.iter().map(|g| g.files.len() - 1).sum(),
            groups,
            files_scanned,
            duration: started.elapsed(),
        })
    }

    /// Phase one: every admitted file keyed by its size.
    fn collect(
        &self,
        emitter: &EventEmitter<DuplicateProgress, DuplicateScanResult>,
        options: &DuplicateOptions,
    ) -> Result<(HashMap<u64, Vec<FileRecord>>, usize)> {
        let ignore = BasenameGlobs::compile(&options.ignore_patterns)?;
        let admit = |entry: &WalkEntry| options.admits_size(entry.meta.len);
        let walk_options = WalkOptions {
            max_depth: if options.max_depth == 0 {
                usize::MAX
            } else {
                options.max_depth
            },
            ignore: &ignore,
            admit: &admit,
        };

        let mut buckets: HashMap<u64, Vec<FileRecord>> = HashMap::new();
        let mut files_scanned = 0usize;
        let mut bytes_scanned = 0u64;

        for root in &options.paths {
            let outcome = walker::walk(
                self.fs.as_ref(),
                emitter.token(),
                root,
                &walk_options,
                &mut |item| {
                    if let WalkItem::File(record) = item {
                        files_scanned += 1;
                        bytes_scanned += record.size;
                        if files_scanned % PROGRESS_EVERY == 0 {
                            emitter.progress(DuplicateProgress {
                                files_scanned,
                                bytes_scanned,
                                current_file: record.path.clone(),
                                phase: "Collecting".to_string(),
                            })?;
                        }
                        buckets.entry(record.size).or_default().push(record);
                    }
                    Ok(())
                },
            );
            match outcome {
                Ok(()) => {}
                Err(err) if err.is_permission_denied() => {
                    log::warn!("Skipping inaccessible {}: {}", root.display(), err);
                }
                Err(err) => return Err(err),
            }
        }
        Ok((buckets, files_scanned))
    }

    /// Phase two: hash each size bucket on the worker pool and merge the
    /// per-bucket maps as they arrive.
    #[cfg(feature = "parallel-hash")]
    fn hash_buckets(
        &self,
        emitter: &EventEmitter<DuplicateProgress, DuplicateScanResult>,
        candidates: Vec<Vec<FileRecord>>,
    ) -> Result<HashMapByDigest> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(HASH_WORKERS)
            .thread_name(|i| format!("dup-hash-{}", i))
            .build()
            .map_err(|err| {
                CleanerError::new(ErrorCode::CleanFailed, "failed to start hashing workers")
                    .with_source(err)
            })?;

        let phase = format!("Hashing ({} groups)", candidates.len());
        let (tx, mut rx) = mpsc::channel::<HashMapByDigest>(HASH_WORKERS * 2);
        for bucket in candidates {
            let fs = Arc::clone(&self.fs);
            let token = emitter.token().clone();
            let tx = tx.clone();
            pool.spawn(move || {
                let local = hash_bucket(fs.as_ref(), &token, bucket);
                // The receiver is gone once the scan was abandoned.
                let _ = tx.blocking_send(local);
            });
        }
        drop(tx);

        let mut merged = HashMapByDigest::new();
        let mut files_hashed = 0usize;
        let mut bytes_hashed = 0u64;
        while let Some(local) = rx.blocking_recv() {
            if emitter.is_cancelled() {
                return Err(CleanerError::cancelled());
            }
            let mut last = PathBuf::new();
            for (digest, files) in local {
                for file in &files {
                    files_hashed += 1;
                    bytes_hashed += file.size;
                    last.clone_from(&file.path);
                }
                merged.entry(digest).or_default().extend(files);
            }
            emitter
                .progress(DuplicateProgress {
                    files_scanned: files_hashed,
                    bytes_scanned: bytes_hashed,
                    current_file: last,
                    phase: phase.clone(),
                })?;
        }
        if emitter.is_cancelled() {
            return Err(CleanerError::cancelled());
        }
        Ok(merged)
    }

    #[cfg(not(feature = "parallel-hash"))]
    fn hash_buckets(
        &self,
        emitter: &EventEmitter<DuplicateProgress, DuplicateScanResult>,
        candidates: Vec<Vec<FileRecord>>,
    ) -> Result<HashMapByDigest> {
        let phase = format!("Hashing ({} groups)", candidates.len());
        let mut merged = HashMapByDigest::new();
        let mut files_hashed = 0usize;
        let mut bytes_hashed = 0u64;
        for bucket in candidates {
            let last = bucket.last().map(|f| f.path.clone()).unwrap_or_default();
            files_hashed += bucket.len();
            bytes_hashed += bucket.iter().map(|f| f.size).sum::<u64>();
            for (digest, files) in hash_bucket(self.fs.as_ref(), emitter.token(), bucket) {
                merged.entry(digest).or_default().extend(files);
            }
            if emitter.is_cancelled() {
                return Err(CleanerError::cancelled());
            }
            emitter.progress(DuplicateProgress {
                files_scanned: files_hashed,
                bytes_scanned: bytes_hashed,
                current_file: last,
                phase: phase.clone(),
            })?;
        }
        Ok(merged)
    }

    /// Unlink each path, collecting per-path failures. Which copies to
    /// keep is the caller's decision.
    pub fn remove_duplicates(&self, paths: &[PathBuf]) -> DuplicateRemoval {
        let mut removal = DuplicateRemoval::default();
        for path in paths {
            let outcome = self
                .fs
                .symlink_metadata(path)
                .and_then(|meta| self.fs.remove_file(path).map(|()| meta.len));
            match outcome {
                Ok(size) => {
                    removal.removed += 1;
                    removal.bytes_freed += size;
                }
                Err(err) => {
                    log::warn!("Failed to remove duplicate {}: {}", path.display(), err);
                    removal.errors.push(CleanerError::io(err, path));
                }
            }
        }
        removal
    }
}

fn hash_bucket(
    fs: &dyn FileSystem,
    token: &CancellationToken,
    bucket: Vec<FileRecord>,
) -> HashMapByDigest {
    let mut local = HashMapByDigest::new();
    for record in bucket {
        if token.is_cancelled() {
            break;
        }
        match hash_file(fs, token, &record.path) {
            Ok(Some(digest)) => local.entry(digest).or_default().push(record),
            Ok(None) => break,
            Err(err) => log::debug!("Unable to hash {}: {}", record.path.display(), err),
        }
    }
    local
}

/// Streaming SHA-256 of a file body; `None` when cancelled midway.
fn hash_file(
    fs: &dyn FileSystem,
    token: &CancellationToken,
    path: &Path,
) -> std::io::Result<Option<String>> {
    let mut reader = fs.open_read(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_BYTES];
    loop {
        if token.is_cancelled() {
            return Ok(None);
        }
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        hasher.update(&buffer[..read]);
    }
    Ok(Some(format!("{:x}", hasher.finalize())))
}

/// Phase three: keep digests with two or more files, oldest file first,
/// most wasted space first.
fn group(by_digest: HashMapByDigest) -> Vec<DuplicateGroup> {
    let mut groups: Vec<DuplicateGroup> = by_digest
        .into_iter()
        .filter(|(_, files)| files.len() >= 2)
        .map(|(hash, mut files)| {
            files.sort_by(|a, b| a.mod_time.cmp(&b.mod_time).then_with(|| a.path.cmp(&b.path)));
            let size = files[0].size;
            DuplicateGroup {
                wasted: size.saturating_mul(files.len() as u64 - 1),
                hash,
                size,
                files,
            }
        })
        .collect();
    groups.sort_by(|a, b| b.wasted.cmp(&a.wasted).then_with(|| a.hash.cmp(&b.hash)));
    groups
}
