mod backup;
pub mod duplicate_detector;
mod engine;
mod safety;
mod scanner;
mod session;
mod shredder;
pub mod types;
mod walker;

#[cfg(test)]
mod tests;

pub use backup::{list_manifests, BackupManifest};
pub use duplicate_detector::{
    DuplicateDetector, DuplicateEvent, DuplicateGroup, DuplicateOptions, DuplicateProgress,
    DuplicateRemoval, DuplicateScanResult,
};
pub use engine::{CleanCompletion, CleanEvent, CleanProgress, Cleaner};
pub(crate) use safety::ProtectedPaths;
pub use safety::{SafetyPolicy, DEFAULT_PROTECTED_PATHS};
pub use scanner::{ScanCompletion, ScanEvent, ScanProgress, Scanner};
pub use session::{SessionCache, SessionStore, TOTAL_CATEGORY};
pub use types::{Category, FileRecord, RiskLevel};
