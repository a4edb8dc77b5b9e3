use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Metadata of an entry as seen without following symlinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub kind: EntryKind,
    pub len: u64,
    pub modified: DateTime<Utc>,
}

impl FileMeta {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }

    fn from_std(md: &fs::Metadata) -> Self {
        let file_type = md.file_type();
        let kind = if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Dir
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        };
        let modified = md
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH));
        FileMeta {
            kind,
            len: md.len(),
            modified,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WalkEntry {
    pub path: PathBuf,
    /// Number of components below the walk root (direct children are 1).
    pub depth: usize,
    pub meta: FileMeta,
}

#[derive(Debug)]
pub struct WalkFailure {
    pub path: PathBuf,
    pub source: io::Error,
}

/// Depth-first entry iterator that can prune the directory it just yielded.
pub trait EntryStream: Send {
    fn next_entry(&mut self) -> Option<Result<WalkEntry, WalkFailure>>;

    /// Do not descend into the most recently yielded directory.
    fn skip_current_dir(&mut self);
}

/// Writable handle that can be flushed to stable storage.
pub trait FileHandle: Write + Seek + Send {
    fn sync_all(&mut self) -> io::Result<()>;
}

impl FileHandle for fs::File {
    fn sync_all(&mut self) -> io::Result<()> {
        fs::File::sync_all(self)
    }
}

/// Filesystem operations used by the scanner, cleaner, caches and audit log.
pub trait FileSystem: Send + Sync {
    fn symlink_metadata(&self, path: &Path) -> io::Result<FileMeta>;

    fn exists(&self, path: &Path) -> bool {
        self.symlink_metadata(path).is_ok()
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;

    /// Expand a glob pattern; unreadable matches are skipped.
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, glob::PatternError>;

    /// Entries below `root` (root excluded), never following symlinks,
    /// at most `max_depth` components deep.
    fn walk<'a>(&'a self, root: &Path, max_depth: usize) -> Box<dyn EntryStream + 'a>;

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// Open an existing file for in-place writing without truncating it.
    fn open_write(&self, path: &Path) -> io::Result<Box<dyn FileHandle>>;

    /// Open (creating with `mode` if needed) a file positioned at its end.
    fn open_append(&self, path: &Path, mode: u32) -> io::Result<Box<dyn FileHandle>>;

    fn read_to_string(&self, path: &Path) -> io::Result<String>;

    /// Replace `path` with `contents` (mode 0600) via a temporary sibling and rename.
    fn write_private(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Create `path` and missing parents with mode 0700.
    fn create_dir_private(&self, path: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

struct OsEntryStream {
    inner: walkdir::IntoIter,
}

impl EntryStream for OsEntryStream {
    fn next_entry(&mut self) -> Option<Result<WalkEntry, WalkFailure>> {
        let next = self.inner.next()?;
        Some(match next {
            Ok(entry) => match entry.metadata() {
                Ok(md) => Ok(WalkEntry {
                    path: entry.path().to_path_buf(),
                    depth: entry.depth(),
                    meta: FileMeta::from_std(&md),
                }),
                Err(err) => Err(walk_failure(err, entry.path())),
            },
            Err(err) => {
                let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                Err(walk_failure(err, &path))
            }
        })
    }

    fn skip_current_dir(&mut self) {
        self.inner.skip_current_dir();
    }
}

fn walk_failure(err: walkdir::Error, path: &Path) -> WalkFailure {
    WalkFailure {
        path: path.to_path_buf(),
        source: io::Error::from(err),
    }
}

impl FileSystem for OsFileSystem {
    fn symlink_metadata(&self, path: &Path) -> io::Result<FileMeta> {
        fs::symlink_metadata(path).map(|md| FileMeta::from_std(&md))
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        fs::canonicalize(path)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, glob::PatternError> {
        let mut matches = Vec::new();
        for entry in glob::glob(pattern)? {
            match entry {
                Ok(path) => matches.push(path),
                Err(err) => log::debug!("Skipping unreadable glob match: {}", err),
            }
        }
        Ok(matches)
    }

    fn walk<'a>(&'a self, root: &Path, max_depth: usize) -> Box<dyn EntryStream + 'a> {
        let inner = WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .max_depth(max_depth)
            .sort_by_file_name()
            .into_iter();
        Box::new(OsEntryStream { inner })
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            entries.push(entry?.path());
        }
        entries.sort();
        Ok(entries)
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn open_write(&self, path: &Path) -> io::Result<Box<dyn FileHandle>> {
        let file = OpenOptions::new().write(true).open(path)?;
        Ok(Box::new(file))
    }

    fn open_append(&self, path: &Path, mode: u32) -> io::Result<Box<dyn FileHandle>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(mode)
            .open(path)?;
        Ok(Box::new(file))
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn write_private(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let file_name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)?;
        // A stale temp file keeps its old mode; force it.
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        Ok(())
    }

    fn create_dir_private(&self, path: &Path) -> io::Result<()> {
        DirBuilder::new().recursive(true).mode(0o700).create(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }
}
