use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use glob::{MatchOptions, Pattern};

use super::fs::{EntryKind, EntryStream, FileHandle, FileMeta, FileSystem, WalkEntry, WalkFailure};

#[derive(Debug, Clone)]
enum NodeKind {
    File(Vec<u8>),
    Dir,
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    modified: DateTime<Utc>,
    mode: u32,
    denied: bool,
}

#[derive(Debug, Default)]
struct Tree {
    nodes: BTreeMap<PathBuf, Node>,
    syncs: usize,
}

/// In-memory filesystem with absolute paths and no symlinks.
///
/// Clones share the same tree, so a test can hand one clone to the code
/// under test and inspect the other.
#[derive(Debug, Clone, Default)]
pub struct MemoryFileSystem {
    tree: Arc<Mutex<Tree>>,
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} not found", path.display()),
    )
}

fn denied(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::PermissionDenied,
        format!("{} is not accessible", path.display()),
    )
}

impl Tree {
    fn dir_node(modified: DateTime<Utc>) -> Node {
        Node {
            kind: NodeKind::Dir,
            modified,
            mode: 0o755,
            denied: false,
        }
    }

    fn ensure_parents(&mut self, path: &Path, modified: DateTime<Utc>, mode: u32) {
        let mut ancestors: Vec<&Path> = path.ancestors().skip(1).collect();
        ancestors.reverse();
        for ancestor in ancestors {
            if ancestor == Path::new("/") {
                continue;
            }
            self.nodes.entry(ancestor.to_path_buf()).or_insert_with(|| {
                let mut node = Tree::dir_node(modified);
                node.mode = mode;
                node
            });
        }
    }

    /// Permission check on every ancestor, as a kernel path lookup would do.
    fn check_access(&self, path: &Path) -> io::Result<()> {
        for ancestor in path.ancestors().skip(1) {
            if self.nodes.get(ancestor).map_or(false, |n| n.denied) {
                return Err(denied(path));
            }
        }
        Ok(())
    }

    fn node(&self, path: &Path) -> io::Result<&Node> {
        self.check_access(path)?;
        if path == Path::new("/") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "root has no node",
            ));
        }
        self.nodes.get(path).ok_or_else(|| not_found(path))
    }

    fn children(&self, dir: &Path) -> Vec<PathBuf> {
        self.nodes
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect()
    }

    fn write_at(&mut self, path: &Path, pos: u64, buf: &[u8]) -> io::Result<()> {
        let node = self.nodes.get_mut(path).ok_or_else(|| not_found(path))?;
        match &mut node.kind {
            NodeKind::File(data) => {
                let start = pos as usize;
                let end = start + buf.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[start..end].copy_from_slice(buf);
                Ok(())
            }
            NodeKind::Dir => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot write to a directory",
            )),
        }
    }
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tree> {
        // A panicking test thread must not hide the tree from the assertions.
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_dir(&self, path: impl AsRef<Path>) {
        let path = normalize(path.as_ref());
        let now = Utc::now();
        let mut tree = self.lock();
        tree.ensure_parents(&path, now, 0o755);
        tree.nodes.entry(path).or_insert_with(|| Tree::dir_node(now));
    }

    pub fn add_file(&self, path: impl AsRef<Path>, contents: impl Into<Vec<u8>>) {
        self.add_file_modified(path, contents, Utc::now());
    }

    pub fn add_file_modified(
        &self,
        path: impl AsRef<Path>,
        contents: impl Into<Vec<u8>>,
        modified: DateTime<Utc>,
    ) {
        let path = normalize(path.as_ref());
        let mut tree = self.lock();
        tree.ensure_parents(&path, modified, 0o755);
        tree.nodes.insert(
            path,
            Node {
                kind: NodeKind::File(contents.into()),
                modified,
                mode: 0o644,
                denied: false,
            },
        );
    }

    /// Make everything below `path` fail with PermissionDenied.
    pub fn deny(&self, path: impl AsRef<Path>) {
        let path = normalize(path.as_ref());
        if let Some(node) = self.lock().nodes.get_mut(&path) {
            node.denied = true;
        }
    }

    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        match &self.lock().nodes.get(&normalize(path.as_ref()))?.kind {
            NodeKind::File(data) => Some(data.clone()),
            NodeKind::Dir => None,
        }
    }

    pub fn mode(&self, path: impl AsRef<Path>) -> Option<u32> {
        self.lock()
            .nodes
            .get(&normalize(path.as_ref()))
            .map(|node| node.mode)
    }

    /// Every file and its bytes, for before/after comparisons.
    pub fn snapshot(&self) -> BTreeMap<PathBuf, Vec<u8>> {
        self.lock()
            .nodes
            .iter()
            .filter_map(|(path, node)| match &node.kind {
                NodeKind::File(data) => Some((path.clone(), data.clone())),
                NodeKind::Dir => None,
            })
            .collect()
    }

    /// Number of `sync_all` calls made on handles from this filesystem.
    pub fn sync_count(&self) -> usize {
        self.lock().syncs
    }
}

struct MemoryEntryStream {
    entries: Vec<Option<Result<WalkEntry, WalkFailure>>>,
    next: usize,
    current_dir: Option<PathBuf>,
    skip_under: Option<PathBuf>,
}

impl MemoryEntryStream {
    fn collect(
        tree: &Tree,
        dir: &Path,
        depth: usize,
        max_depth: usize,
        out: &mut Vec<Option<Result<WalkEntry, WalkFailure>>>,
    ) {
        if depth > max_depth {
            return;
        }
        for child in tree.children(dir) {
            let Some(node) = tree.nodes.get(&child) else {
                continue;
            };
            let meta = node_meta(node);
            let is_dir = meta.is_dir();
            out.push(Some(Ok(WalkEntry {
                path: child.clone(),
                depth,
                meta,
            })));
            if is_dir && depth < max_depth {
                if node.denied {
                    out.push(Some(Err(WalkFailure {
                        source: denied(&child),
                        path: child,
                    })));
                } else {
                    Self::collect(tree, &child, depth + 1, max_depth, out);
                }
            }
        }
    }
}

impl EntryStream for MemoryEntryStream {
    fn next_entry(&mut self) -> Option<Result<WalkEntry, WalkFailure>> {
        while self.next < self.entries.len() {
            let item = self.entries[self.next].take();
            self.next += 1;
            let Some(item) = item else {
                continue;
            };
            let path = match &item {
                Ok(entry) => &entry.path,
                Err(failure) => &failure.path,
            };
            if let Some(skipped) = &self.skip_under {
                if path != skipped && path.starts_with(skipped) {
                    continue;
                }
                self.skip_under = None;
            }
            self.current_dir = match &item {
                Ok(entry) if entry.meta.is_dir() => Some(entry.path.clone()),
                _ => None,
            };
            return Some(item);
        }
        None
    }

    fn skip_current_dir(&mut self) {
        if let Some(dir) = self.current_dir.take() {
            self.skip_under = Some(dir);
        }
    }
}

fn node_meta(node: &Node) -> FileMeta {
    match &node.kind {
        NodeKind::File(data) => FileMeta {
            kind: EntryKind::File,
            len: data.len() as u64,
            modified: node.modified,
        },
        NodeKind::Dir => FileMeta {
            kind: EntryKind::Dir,
            len: 4096,
            modified: node.modified,
        },
    }
}

struct MemoryHandle {
    tree: Arc<Mutex<Tree>>,
    path: PathBuf,
    pos: u64,
}

impl MemoryHandle {
    fn lock(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn len(&self) -> io::Result<u64> {
        match &self.lock().node(&self.path)?.kind {
            NodeKind::File(data) => Ok(data.len() as u64),
            NodeKind::Dir => Ok(0),
        }
    }
}

impl Write for MemoryHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let pos = self.pos;
        self.lock().write_at(&self.path, pos, buf)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryHandle {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let next = match target {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
            SeekFrom::End(delta) => self.len()? as i128 + delta as i128,
        };
        if next < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.pos = next as u64;
        Ok(self.pos)
    }
}

impl FileHandle for MemoryHandle {
    fn sync_all(&mut self) -> io::Result<()> {
        self.lock().syncs += 1;
        Ok(())
    }
}

impl FileSystem for MemoryFileSystem {
    fn symlink_metadata(&self, path: &Path) -> io::Result<FileMeta> {
        let path = normalize(path);
        self.lock().node(&path).map(node_meta)
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        let path = normalize(path);
        if path == Path::new("/") {
            return Ok(path);
        }
        self.lock().node(&path)?;
        Ok(path)
    }

    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>, glob::PatternError> {
        let compiled = Pattern::new(pattern)?;
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        Ok(self
            .lock()
            .nodes
            .keys()
            .filter(|path| compiled.matches_path_with(path, options))
            .cloned()
            .collect())
    }

    fn walk<'a>(&'a self, root: &Path, max_depth: usize) -> Box<dyn EntryStream + 'a> {
        let root = normalize(root);
        let tree = self.lock();
        let mut entries = Vec::new();
        let root_denied = tree.check_access(&root).is_err()
            || tree.nodes.get(&root).map_or(false, |node| node.denied);
        if root_denied {
            entries.push(Some(Err(WalkFailure {
                source: denied(&root),
                path: root,
            })));
        } else {
            MemoryEntryStream::collect(&tree, &root, 1, max_depth, &mut entries);
        }
        Box::new(MemoryEntryStream {
            entries,
            next: 0,
            current_dir: None,
            skip_under: None,
        })
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let path = normalize(path);
        let tree = self.lock();
        if path != Path::new("/") {
            let node = tree.node(&path)?;
            if node.denied {
                return Err(denied(&path));
            }
            if !matches!(node.kind, NodeKind::Dir) {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a directory"));
            }
        }
        Ok(tree.children(&path))
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        let path = normalize(path);
        match &self.lock().node(&path)?.kind {
            NodeKind::File(data) => Ok(Box::new(Cursor::new(data.clone()))),
            NodeKind::Dir => Err(io::Error::new(io::ErrorKind::InvalidInput, "is a directory")),
        }
    }

    fn open_write(&self, path: &Path) -> io::Result<Box<dyn FileHandle>> {
        let path = normalize(path);
        self.lock().node(&path)?;
        Ok(Box::new(MemoryHandle {
            tree: Arc::clone(&self.tree),
            path,
            pos: 0,
        }))
    }

    fn open_append(&self, path: &Path, mode: u32) -> io::Result<Box<dyn FileHandle>> {
        let path = normalize(path);
        let len = {
            let mut tree = self.lock();
            tree.check_access(&path)?;
            let parent_exists = path
                .parent()
                .map_or(true, |p| p == Path::new("/") || tree.nodes.contains_key(p));
            if !parent_exists {
                return Err(not_found(&path));
            }
            let node = tree.nodes.entry(path.clone()).or_insert_with(|| Node {
                kind: NodeKind::File(Vec::new()),
                modified: Utc::now(),
                mode,
                denied: false,
            });
            match &node.kind {
                NodeKind::File(data) => data.len() as u64,
                NodeKind::Dir => {
                    return Err(io::Error::new(io::ErrorKind::InvalidInput, "is a directory"))
                }
            }
        };
        Ok(Box::new(MemoryHandle {
            tree: Arc::clone(&self.tree),
            path,
            pos: len,
        }))
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let mut text = String::new();
        self.open_read(path)?.read_to_string(&mut text)?;
        Ok(text)
    }

    fn write_private(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let path = normalize(path);
        let mut tree = self.lock();
        tree.check_access(&path)?;
        let parent_exists = path
            .parent()
            .map_or(true, |p| p == Path::new("/") || tree.nodes.contains_key(p));
        if !parent_exists {
            return Err(not_found(&path));
        }
        tree.nodes.insert(
            path,
            Node {
                kind: NodeKind::File(contents.to_vec()),
                modified: Utc::now(),
                mode: 0o600,
                denied: false,
            },
        );
        Ok(())
    }

    fn create_dir_private(&self, path: &Path) -> io::Result<()> {
        let path = normalize(path);
        let mut tree = self.lock();
        tree.check_access(&path)?;
        let now = Utc::now();
        tree.ensure_parents(&path, now, 0o700);
        tree.nodes.entry(path).or_insert_with(|| {
            let mut node = Tree::dir_node(now);
            node.mode = 0o700;
            node
        });
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let path = normalize(path);
        let mut tree = self.lock();
        if matches!(tree.node(&path)?.kind, NodeKind::Dir) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "is a directory"));
        }
        tree.nodes.remove(&path);
        Ok(())
    }
}
