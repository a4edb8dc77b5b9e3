//! Collaborators the cleaner consumes instead of reaching for ambient state:
//! a clock, the process environment, a filesystem and a random source.

mod clock;
mod env;
mod fs;
mod memory;

pub use clock::{Clock, FixedClock, SystemClock};
pub use env::{AppPaths, Environment, ProcessEnv, StaticEnv, APP_NAME};
pub use fs::{
    EntryKind, EntryStream, FileHandle, FileMeta, FileSystem, OsFileSystem, WalkEntry,
    WalkFailure,
};
pub use memory::MemoryFileSystem;

use rand::RngCore;

/// Source of bytes used to overwrite files before unlinking them.
pub trait RandomSource: Send + Sync {
    fn fill(&self, buf: &mut [u8]);
}

/// Thread-local CSPRNG seeded from the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill(&self, buf: &mut [u8]) {
        rand::rng().fill_bytes(buf);
    }
}
