pub mod audit;
pub mod config;
pub mod error;
pub mod file_cleaner;
pub mod format;
pub mod ops;
pub mod platform;

mod app;

pub use app::App;
pub use audit::{AuditEntry, AuditSink, FileAuditLogger, MemoryAuditSink, NullAuditSink};
pub use config::{Config, ScanSettings};
pub use error::{CleanerError, ErrorCode, Result};
pub use file_cleaner::{
    list_manifests, BackupManifest, Category, CleanCompletion, CleanEvent, CleanProgress, Cleaner,
    DuplicateDetector, DuplicateEvent, DuplicateGroup, DuplicateOptions, DuplicateProgress,
    DuplicateRemoval, DuplicateScanResult, FileRecord, RiskLevel, SafetyPolicy, ScanCompletion,
    ScanEvent, ScanProgress, Scanner, SessionCache, SessionStore, TOTAL_CATEGORY,
};
pub use format::humanize;
pub use ops::{wait_for_completion, Event, EVENT_CHANNEL_CAPACITY};
