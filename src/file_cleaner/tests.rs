use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::audit::MemoryAuditSink;
use crate::config::ScanSettings;
use crate::error::ErrorCode;
use crate::ops::Event;
use crate::platform::{
    EntryStream, FileHandle, FileMeta, FileSystem, FixedClock, MemoryFileSystem, OsRandom,
    RandomSource, StaticEnv, WalkEntry, WalkFailure,
};

const HOME: &str = "/home/u";
const BACKUPS: &str = "/home/u/.local/share/linux-cleaner/backups";

async fn drain<P, C>(mut rx: mpsc::Receiver<Event<P, C>>) -> Vec<Event<P, C>> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn scanner(fs: &MemoryFileSystem) -> Scanner {
    Scanner::new(
        Arc::new(fs.clone()),
        Arc::new(FixedClock(Utc::now())),
        Arc::new(StaticEnv::new().with("HOME", HOME)),
        &ScanSettings::default(),
    )
    .unwrap()
}

fn cleaner(fs: &MemoryFileSystem, policy: SafetyPolicy, audit: Arc<MemoryAuditSink>) -> Cleaner {
    cleaner_with_random(fs, policy, audit, Arc::new(OsRandom))
}

fn cleaner_with_random(
    fs: &MemoryFileSystem,
    policy: SafetyPolicy,
    audit: Arc<MemoryAuditSink>,
    random: Arc<dyn RandomSource>,
) -> Cleaner {
    Cleaner::new(
        Arc::new(fs.clone()),
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap())),
        random,
        audit,
        policy,
        BACKUPS,
    )
}

/// Cancels `token` the first time the shredder asks for random bytes,
/// i.e. while the first file of a shredded clean is being removed.
struct CancelOnFirstFill(CancellationToken);

impl RandomSource for CancelOnFirstFill {
    fn fill(&self, buf: &mut [u8]) {
        self.0.cancel();
        buf.fill(0xAA);
    }
}

/// Filesystem whose walks cancel `token` after yielding `after` entries.
struct CancellingWalks {
    inner: MemoryFileSystem,
    token: CancellationToken,
    after: usize,
}

struct CancellingStream<'a> {
    inner: Box<dyn EntryStream + 'a>,
    token: CancellationToken,
    remaining: usize,
}

impl EntryStream for CancellingStream<'_> {
    fn next_entry(&mut self) -> Option<Result<WalkEntry, WalkFailure>> {
        let next = self.inner.next_entry();
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.token.cancel();
        }
        next
    }

    fn skip_current_dir(&mut self) {
        self.inner.skip_current_dir();
    }
}

impl FileSystem for CancellingWalks {
    fn symlink_metadata(&self, path: &Path) -> io::Result<FileMeta> {
        self.inner.symlink_metadata(path)
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        self.inner.canonicalize(path)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, glob::PatternError> {
        self.inner.glob(pattern)
    }

    fn walk<'a>(&'a self, root: &Path, max_depth: usize) -> Box<dyn EntryStream + 'a> {
        Box::new(CancellingStream {
            inner: self.inner.walk(root, max_depth),
            token: self.token.clone(),
            remaining: self.after,
        })
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        self.inner.read_dir(path)
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        self.inner.open_read(path)
    }

    fn open_write(&self, path: &Path) -> io::Result<Box<dyn FileHandle>> {
        self.inner.open_write(path)
    }

    fn open_append(&self, path: &Path, mode: u32) -> io::Result<Box<dyn FileHandle>> {
        self.inner.open_append(path, mode)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        self.inner.read_to_string(path)
    }

    fn write_private(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        self.inner.write_private(path, contents)
    }

    fn create_dir_private(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_private(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.inner.remove_file(path)
    }
}

fn populated(fs: &MemoryFileSystem, dir: &str, files: &[(&str, &str)]) -> Category {
    let mut category = Category::new("Cache", vec![dir.to_string()]);
    for (name, body) in files {
        let path = Path::new(dir).join(name);
        fs.add_file(&path, *body);
        category.admit(FileRecord {
            path,
            size: body.len() as u64,
            mod_time: Utc::now(),
        });
    }
    category
}

fn only_completion<P, C>(events: Vec<Event<P, C>>) -> C {
    let mut completions = Vec::new();
    for event in events {
        match event {
            Event::Progress(_) => {}
            Event::Complete(c) => completions.push(c),
            Event::Error(err) => panic!("unexpected error event: {}", err),
        }
    }
    assert_eq!(completions.len(), 1);
    completions.pop().unwrap()
}

fn only_error<P, C>(events: Vec<Event<P, C>>) -> crate::error::CleanerError {
    assert_eq!(events.len(), 1, "expected a single terminal event");
    match events.into_iter().next() {
        Some(Event::Error(err)) => err,
        _ => panic!("expected an error event"),
    }
}

// Scanner

#[tokio::test]
async fn scan_accumulates_consistently_and_reports_every_hundred_files() {
    let fs = MemoryFileSystem::new();
    for i in 0..250 {
        fs.add_file(format!("/home/u/.cache/pip/f{:03}", i), vec![0u8; i % 7]);
    }
    let category = Category::new("Pip", vec!["~/.cache/pip".into()]);

    let events = drain(scanner(&fs).scan_category(CancellationToken::new(), &category)).await;
    let progress: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            Event::Progress(p) => Some(p.files_scanned),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![100, 200]);
    assert!(matches!(events.last(), Some(Event::Complete(_))));

    let completion = only_completion(events);
    assert_eq!(completion.category.file_count, 250);
    assert!(completion.category.is_consistent());
}

#[tokio::test]
async fn scan_applies_filters_and_ignore_patterns() {
    let fs = MemoryFileSystem::new();
    fs.add_file("/var/log/app.log.1", "x");
    fs.add_file("/var/log/app.log", "x");
    fs.add_file("/var/log/pkg.lock", "x");
    fs.add_file("/var/log/.git/objects/x.1", "x");
    let category = Category::new("Rotated", vec!["/var/log".into()]).with_filters(&[r"\.\d+$"]);

    let completion =
        only_completion(drain(scanner(&fs).scan_category(CancellationToken::new(), &category)).await);
    let paths: Vec<&Path> = completion
        .category
        .files
        .iter()
        .map(|f| f.path.as_path())
        .collect();
    assert_eq!(paths, vec![Path::new("/var/log/app.log.1")]);
}

#[tokio::test]
async fn scan_skips_inaccessible_roots() {
    let fs = MemoryFileSystem::new();
    fs.add_file("/srv/open/a", "12");
    fs.add_file("/srv/locked/b", "34");
    fs.deny("/srv/locked");
    let category = Category::new("Mixed", vec!["/srv/locked".into(), "/srv/open".into()]);

    let completion =
        only_completion(drain(scanner(&fs).scan_category(CancellationToken::new(), &category)).await);
    assert_eq!(completion.category.file_count, 1);
    assert_eq!(completion.category.size, 2);
}

#[tokio::test]
async fn cancelled_scan_emits_only_the_error() {
    let fs = MemoryFileSystem::new();
    fs.add_file("/tmp/scan/a", "1");
    let token = CancellationToken::new();
    token.cancel();

    let category = Category::new("Tmp", vec!["/tmp/scan".into()]);
    let err = only_error(drain(scanner(&fs).scan_category(token, &category)).await);
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn cancel_mid_scan_ends_the_stream_with_one_error() {
    let fs = MemoryFileSystem::new();
    for i in 0..250 {
        fs.add_file(format!("/home/u/.cache/pip/f{:03}", i), "x");
    }
    let token = CancellationToken::new();
    let scanner = Scanner::new(
        Arc::new(CancellingWalks {
            inner: fs,
            token: token.clone(),
            after: 150,
        }),
        Arc::new(FixedClock(Utc::now())),
        Arc::new(StaticEnv::new().with("HOME", HOME)),
        &ScanSettings::default(),
    )
    .unwrap();
    let category = Category::new("Pip", vec!["~/.cache/pip".into()]);

    let events = drain(scanner.scan_category(token, &category)).await;
    assert_eq!(events.len(), 2, "one progress before the cancel, one error after");
    match &events[0] {
        Event::Progress(p) => assert_eq!(p.files_scanned, 100),
        _ => panic!("expected progress first"),
    }
    match &events[1] {
        Event::Error(err) => assert!(err.is_cancelled()),
        _ => panic!("expected the cancellation error last"),
    }
}

#[tokio::test]
async fn invalid_filter_is_reported_as_error_event() {
    let fs = MemoryFileSystem::new();
    fs.add_dir("/tmp/scan");
    let mut category = Category::new("Broken", vec!["/tmp/scan".into()]);
    category.filters = vec!["(".into()];
    let err = only_error(drain(scanner(&fs).scan_category(CancellationToken::new(), &category)).await);
    assert_eq!(err.code(), ErrorCode::InvalidPattern);
}

#[tokio::test]
async fn scan_all_builds_the_total_category() {
    let fs = MemoryFileSystem::new();
    fs.add_file("/home/u/.cache/thumbnails/a.png", "1234");
    fs.add_file("/var/crash/core.1", "123456");
    let categories = vec![
        Category::new("Thumbnails", vec!["~/.cache/thumbnails".into()]),
        Category::new("Crash", vec!["/var/crash".into()])
            .with_risk(RiskLevel::High)
            .shredded(),
        Category::new("Missing", vec!["/nowhere".into()]),
    ];

    let cache = scanner(&fs)
        .scan_all(&CancellationToken::new(), &categories)
        .await
        .unwrap();
    assert_eq!(cache.scan_results.name, TOTAL_CATEGORY);
    assert_eq!(cache.total_files, 2);
    assert_eq!(cache.total_size, 10);
    assert_eq!(cache.scan_results.risk, RiskLevel::High);
    assert!(cache.scan_results.shred_enabled);
    assert!(cache.scan_results.is_consistent());
    assert!(!cache.scan_results.paths.contains(&"/nowhere".to_string()));
}

// Cleaner

#[tokio::test]
async fn dry_run_leaves_the_filesystem_untouched() {
    let fs = MemoryFileSystem::new();
    let category = populated(&fs, "/home/u/.cache/yarn", &[("a", "123"), ("b", "4567")]);
    let before = fs.snapshot();
    let audit = Arc::new(MemoryAuditSink::new());

    let completion = only_completion(
        drain(cleaner(&fs, SafetyPolicy::default(), audit.clone()).clean_category(
            CancellationToken::new(),
            &category,
            true,
        ))
        .await,
    );
    assert_eq!(completion.files_deleted, 2);
    assert_eq!(completion.bytes_freed, 7);
    assert!(!completion.backup_created);
    assert_eq!(fs.snapshot(), before);
    assert!(audit.entries().is_empty());
}

#[tokio::test]
async fn real_clean_writes_manifest_audit_and_shreds() {
    let fs = MemoryFileSystem::new();
    let category = populated(&fs, "/home/u/.cache/go-build", &[("a", "123"), ("b", "4567")]).shredded();
    let audit = Arc::new(MemoryAuditSink::new());

    let events = drain(cleaner(&fs, SafetyPolicy::default(), audit.clone()).clean_category(
        CancellationToken::new(),
        &category,
        false,
    ))
    .await;
    let processed: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            Event::Progress(p) => Some(p.files_processed),
            _ => None,
        })
        .collect();
    assert_eq!(processed, vec![0, 1]);

    let completion = only_completion(events);
    assert_eq!(completion.files_deleted, 2);
    assert_eq!(completion.bytes_freed, 7);
    assert!(completion.errors.is_empty());
    assert!(fs.contents("/home/u/.cache/go-build/a").is_none());
    assert!(fs.sync_count() >= 2);

    let manifest_path = completion.backup_path.unwrap();
    assert!(manifest_path.starts_with(BACKUPS));
    let manifest = BackupManifest::read(&fs, &manifest_path).unwrap();
    assert_eq!(manifest.file_count, 2);

    let entries = audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].operation, "clean");
    assert_eq!(entries[0].args, vec!["Cache", "2", "7"]);
}

#[tokio::test]
async fn per_file_failures_are_collected() {
    let fs = MemoryFileSystem::new();
    let category = populated(&fs, "/home/u/.cache/npm", &[("gone", "1"), ("kept", "22")]);
    fs.remove_file(Path::new("/home/u/.cache/npm/gone")).unwrap();
    let audit = Arc::new(MemoryAuditSink::new());

    let completion = only_completion(
        drain(cleaner(&fs, SafetyPolicy::default(), audit.clone()).clean_category(
            CancellationToken::new(),
            &category,
            false,
        ))
        .await,
    );
    assert_eq!(completion.files_deleted, 1);
    assert_eq!(completion.bytes_freed, 2);
    assert_eq!(completion.errors.len(), 1);
    assert_eq!(completion.errors[0].code(), ErrorCode::FileNotFound);
    assert_eq!(audit.entries()[0].result, "partial");
}

#[tokio::test]
async fn protected_files_are_never_removed_even_outside_safe_mode() {
    let fs = MemoryFileSystem::new();
    let mut category = populated(&fs, "/home/u/.cache/x", &[("a", "1")]);
    fs.add_file("/etc/passwd", "root:x:0:0");
    category.admit(FileRecord {
        path: PathBuf::from("/etc/passwd"),
        size: 10,
        mod_time: Utc::now(),
    });
    let policy = SafetyPolicy {
        safe_mode: false,
        ..SafetyPolicy::default()
    };
    let before = fs.snapshot();

    for dry_run in [true, false] {
        let err = only_error(
            drain(
                cleaner(&fs, policy.clone(), Arc::new(MemoryAuditSink::new())).clean_category(
                    CancellationToken::new(),
                    &category,
                    dry_run,
                ),
            )
            .await,
        );
        assert_eq!(err.code(), ErrorCode::PathProtected);
    }
    assert_eq!(fs.snapshot(), before);
}

#[tokio::test]
async fn manifest_failure_aborts_only_in_safe_mode() {
    let fs = MemoryFileSystem::new();
    let category = populated(&fs, "/home/u/.cache/pip", &[("a", "1")]);
    fs.add_dir("/home/u/.local");
    fs.deny("/home/u/.local");

    let err = only_error(
        drain(
            cleaner(&fs, SafetyPolicy::default(), Arc::new(MemoryAuditSink::new()))
                .clean_category(CancellationToken::new(), &category, false),
        )
        .await,
    );
    assert_eq!(err.code(), ErrorCode::BackupFailed);
    assert!(fs.contents("/home/u/.cache/pip/a").is_some());

    let relaxed = SafetyPolicy {
        safe_mode: false,
        ..SafetyPolicy::default()
    };
    let completion = only_completion(
        drain(
            cleaner(&fs, relaxed, Arc::new(MemoryAuditSink::new())).clean_category(
                CancellationToken::new(),
                &category,
                false,
            ),
        )
        .await,
    );
    assert_eq!(completion.files_deleted, 1);
    assert!(!completion.backup_created);
}

#[tokio::test]
async fn cancelled_clean_touches_nothing_and_writes_no_manifest() {
    let fs = MemoryFileSystem::new();
    let category = populated(&fs, "/home/u/.cache/pip", &[("a", "1"), ("b", "2")]);
    let audit = Arc::new(MemoryAuditSink::new());
    let token = CancellationToken::new();
    token.cancel();

    let err = only_error(
        drain(
            cleaner(&fs, SafetyPolicy::default(), audit.clone())
                .clean_category(token, &category, false),
        )
        .await,
    );
    assert!(err.is_cancelled());
    assert!(fs.contents("/home/u/.cache/pip/a").is_some());
    assert!(fs.contents("/home/u/.cache/pip/b").is_some());
    assert!(list_manifests(&fs, Path::new(BACKUPS)).unwrap().is_empty());
    assert!(audit.entries().is_empty());
}

#[tokio::test]
async fn cancel_mid_clean_stops_before_the_next_file_and_is_audited() {
    let fs = MemoryFileSystem::new();
    let category = populated(
        &fs,
        "/home/u/.cache/go-build",
        &[("a", "11"), ("b", "22"), ("c", "33"), ("d", "44")],
    )
    .shredded();
    let audit = Arc::new(MemoryAuditSink::new());
    let token = CancellationToken::new();

    let cleaner = cleaner_with_random(
        &fs,
        SafetyPolicy::default(),
        audit.clone(),
        Arc::new(CancelOnFirstFill(token.clone())),
    );
    let events = drain(cleaner.clean_category(token, &category, false)).await;

    assert_eq!(events.len(), 2, "one progress before the cancel, one error after");
    assert!(matches!(&events[0], Event::Progress(p) if p.files_processed == 0));
    match &events[1] {
        Event::Error(err) => assert!(err.is_cancelled()),
        _ => panic!("expected the cancellation error last"),
    }

    assert!(fs.contents("/home/u/.cache/go-build/a").is_none());
    for name in ["b", "c", "d"] {
        assert!(fs.contents(format!("/home/u/.cache/go-build/{}", name)).is_some());
    }

    let entries = audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].args, vec!["Cache", "1", "2"]);
    assert_eq!(entries[0].error.as_deref(), Some("cancelled"));
}

#[tokio::test]
async fn abandoned_clean_still_audits_what_it_deleted() {
    let fs = MemoryFileSystem::new();
    let names: Vec<String> = (0..300).map(|i| format!("f{:03}", i)).collect();
    let files: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "x")).collect();
    let category = populated(&fs, "/home/u/.cache/npm", &files);
    let audit = Arc::new(MemoryAuditSink::new());

    let mut rx = cleaner(&fs, SafetyPolicy::default(), audit.clone()).clean_category(
        CancellationToken::new(),
        &category,
        false,
    );
    assert!(matches!(rx.recv().await, Some(Event::Progress(_))));
    drop(rx);

    let mut waited = Duration::ZERO;
    while audit.entries().is_empty() && waited < Duration::from_secs(5) {
        tokio::time::sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }

    let deleted = names
        .iter()
        .filter(|n| fs.contents(format!("/home/u/.cache/npm/{}", n)).is_none())
        .count();
    assert!(deleted < 300);

    let entries = audit.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].args[1], deleted.to_string());
    assert_eq!(entries[0].args[2], deleted.to_string());
    assert_eq!(entries[0].result, "partial");
    assert!(entries[0]
        .error
        .as_deref()
        .map_or(false, |e| e.contains("receiver dropped")));
}

// Duplicates

#[tokio::test]
async fn duplicate_groups_are_sorted_and_oldest_first() {
    let fs = MemoryFileSystem::new();
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let big = vec![7u8; 4096];
    fs.add_file_modified("/data/big/newer", big.clone(), base + ChronoDuration::days(2));
    fs.add_file_modified("/data/big/older", big.clone(), base);
    fs.add_file_modified("/data/small/z", vec![1u8; 1500], base);
    fs.add_file_modified("/data/small/x", vec![1u8; 1500], base);
    fs.add_file_modified("/data/small/y", vec![1u8; 1500], base);
    fs.add_file_modified("/data/small/different", vec![2u8; 1500], base);
    fs.add_file("/data/tiny/a", "dup");
    fs.add_file("/data/tiny/b", "dup");
    fs.add_file("/data/skip.iso/inner", big.clone());

    let detector = DuplicateDetector::new(Arc::new(fs.clone()));
    let options = DuplicateOptions {
        ignore_patterns: vec!["*.iso".into()],
        ..DuplicateOptions::new(vec![PathBuf::from("/data")])
    };
    let result = only_completion(drain(detector.scan(CancellationToken::new(), options)).await);

    assert_eq!(result.groups.len(), 2);
    let first = &result.groups[0];
    assert_eq!(first.wasted, 4096);
    assert_eq!(first.files[0].path, PathBuf::from("/data/big/older"));
    assert_eq!(first.files.len(), 2);

    let second = &result.groups[1];
    assert_eq!(second.wasted, 3000);
    let names: Vec<&Path> = second.files.iter().map(|f| f.path.as_path()).collect();
    assert_eq!(
        names,
        vec![
            Path::new("/data/small/x"),
            Path::new("/data/small/y"),
            Path::new("/data/small/z")
        ]
    );
    assert_eq!(result.wasted_space, 7096);
    assert_eq!(result.total_dupes, 3);
    for group in &result.groups {
        assert!(group.files.len() >= 2);
        assert!(group.files.iter().all(|f| f.size == group.size));
    }
}

#[tokio::test]
async fn max_size_bounds_candidates() {
    let fs = MemoryFileSystem::new();
    fs.add_file("/d/a", vec![1u8; 5000]);
    fs.add_file("/d/b", vec![1u8; 5000]);
    let detector = DuplicateDetector::new(Arc::new(fs.clone()));
    let options = DuplicateOptions {
        max_size: 4096,
        ..DuplicateOptions::new(vec![PathBuf::from("/d")])
    };
    let result = only_completion(drain(detector.scan(CancellationToken::new(), options)).await);
    assert!(result.groups.is_empty());
    assert_eq!(result.files_scanned, 0);
}

#[test]
fn remove_duplicates_reports_each_failure() {
    let fs = MemoryFileSystem::new();
    fs.add_file("/d/copy", vec![0u8; 100]);
    let detector = DuplicateDetector::new(Arc::new(fs.clone()));

    let removal = detector.remove_duplicates(&[PathBuf::from("/d/copy"), PathBuf::from("/d/missing")]);
    assert_eq!(removal.removed, 1);
    assert_eq!(removal.bytes_freed, 100);
    assert_eq!(removal.errors.len(), 1);
    assert_eq!(removal.errors[0].code(), ErrorCode::FileNotFound);
    assert!(fs.contents("/d/copy").is_none());
}
