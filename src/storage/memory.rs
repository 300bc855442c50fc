//! In-memory [`Storage`] with crash simulation and failure injection.
//!
//! Every file tracks two byte buffers: the bytes visible to readers and the
//! bytes that have been synced. [`MemoryStorage::crash`] produces the
//! filesystem a restarted process would see: each file rolled back to its
//! synced bytes. Directory entry changes (create, rename, remove) are
//! treated as durable as soon as they return.
//!
//! Writers address files by identity, not by path, so renaming or removing
//! a path while a writer is open behaves like an open descriptor on a real
//! filesystem.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Storage, SyncWrite};

/// A storage primitive that can be made to fail with [`MemoryStorage::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Open,
    Rename,
    Remove,
    CreateDirAll,
    Write,
    Flush,
    Sync,
    SyncDir,
}

/// A directory-entry change recorded by [`MemoryStorage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Create(PathBuf),
    Rename { from: PathBuf, to: PathBuf },
    Remove(PathBuf),
    CreateDirAll(PathBuf),
}

#[derive(Debug, Clone)]
struct FileEntry {
    id: u64,
    data: Vec<u8>,
    synced: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<PathBuf, FileEntry>,
    dirs: BTreeSet<PathBuf>,
    failures: HashSet<Op>,
    mutations: Vec<Mutation>,
    next_id: u64,
}

impl State {
    fn take_failure(&mut self, op: Op) -> io::Result<()> {
        if self.failures.remove(&op) {
            return Err(io::Error::other(format!("injected {op:?} failure")));
        }
        Ok(())
    }

    fn dir_exists(&self, dir: &Path) -> bool {
        dir.as_os_str().is_empty() || dir.parent().is_none() || self.dirs.contains(dir)
    }

    fn parent_exists(&self, path: &Path) -> bool {
        path.parent().is_none_or(|parent| self.dir_exists(parent))
    }

    fn add_dirs(&mut self, dir: &Path) {
        for ancestor in dir.ancestors() {
            if ancestor.as_os_str().is_empty() || ancestor.parent().is_none() {
                continue;
            }
            self.dirs.insert(ancestor.to_path_buf());
        }
    }

    fn entry_mut(&mut self, id: u64) -> Option<&mut FileEntry> {
        self.files.values_mut().find(|entry| entry.id == id)
    }

    fn fresh_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such file: {}", path.display()),
    )
}

/// Shared handle to a simulated filesystem. Clones see the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    state: Arc<Mutex<State>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a file whose content is already durable. Parent directories are
    /// created as needed. Not recorded as a mutation.
    pub fn insert(&self, path: impl AsRef<Path>, bytes: impl Into<Vec<u8>>) {
        let path = path.as_ref();
        let bytes = bytes.into();
        let mut state = self.lock();
        if let Some(parent) = path.parent() {
            state.add_dirs(parent);
        }
        let id = state.fresh_id();
        state.files.insert(
            path.to_path_buf(),
            FileEntry {
                id,
                synced: bytes.clone(),
                data: bytes,
            },
        );
    }

    /// Bytes currently visible at `path`.
    pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.lock()
            .files
            .get(path.as_ref())
            .map(|entry| entry.data.clone())
    }

    /// Bytes at `path` that would survive a crash.
    pub fn synced_contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.lock()
            .files
            .get(path.as_ref())
            .map(|entry| entry.synced.clone())
    }

    /// All file paths, sorted.
    pub fn files(&self) -> Vec<PathBuf> {
        self.lock().files.keys().cloned().collect()
    }

    /// Make the next call of `op` fail. One-shot.
    pub fn fail_next(&self, op: Op) {
        self.lock().failures.insert(op);
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.lock().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.lock().mutations.clear();
    }

    /// The filesystem as a restarted process would find it.
    ///
    /// Unsynced bytes are lost; pending failures and the mutation log are
    /// not carried over. Writers still open on `self` do not affect the
    /// returned storage.
    pub fn crash(&self) -> Self {
        let state = self.lock();
        let files = state
            .files
            .iter()
            .map(|(path, entry)| {
                let survived = FileEntry {
                    id: entry.id,
                    data: entry.synced.clone(),
                    synced: entry.synced.clone(),
                };
                (path.clone(), survived)
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(State {
                files,
                dirs: state.dirs.clone(),
                failures: HashSet::new(),
                mutations: Vec::new(),
                next_id: state.next_id,
            })),
        }
    }
}

/// Writer returned by [`MemoryStorage`]. Bytes become visible on flush and
/// durable on sync; dropping it flushes, like a buffered file.
#[derive(Debug)]
pub struct MemoryWriter {
    state: Arc<Mutex<State>>,
    id: u64,
    buf: Vec<u8>,
}

impl MemoryWriter {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain_into(state: &mut State, id: u64, buf: &mut Vec<u8>) {
        // Writes to an unlinked file are silently discarded.
        if let Some(entry) = state.entry_mut(id) {
            entry.data.append(buf);
        } else {
            buf.clear();
        }
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lock().take_failure(Op::Write)?;
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let state = Arc::clone(&self.state);
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.take_failure(Op::Flush)?;
        Self::drain_into(&mut state, self.id, &mut self.buf);
        Ok(())
    }
}

impl SyncWrite for MemoryWriter {
    fn sync(&mut self) -> io::Result<()> {
        let state = Arc::clone(&self.state);
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.take_failure(Op::Sync)?;
        Self::drain_into(&mut state, self.id, &mut self.buf);
        if let Some(entry) = state.entry_mut(self.id) {
            entry.synced = entry.data.clone();
        }
        Ok(())
    }
}

impl Drop for MemoryWriter {
    fn drop(&mut self) {
        let state = Arc::clone(&self.state);
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        Self::drain_into(&mut state, self.id, &mut self.buf);
    }
}

impl Storage for MemoryStorage {
    type Writer = MemoryWriter;
    type Reader = Cursor<Vec<u8>>;

    fn exists(&self, path: &Path) -> bool {
        let state = self.lock();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        state.take_failure(Op::Remove)?;
        if state.files.remove(path).is_none() {
            return Err(not_found(path));
        }
        state.mutations.push(Mutation::Remove(path.to_path_buf()));
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut state = self.lock();
        state.take_failure(Op::Rename)?;
        if !state.parent_exists(to) {
            return Err(not_found(to));
        }
        let entry = state.files.remove(from).ok_or_else(|| not_found(from))?;
        state.files.insert(to.to_path_buf(), entry);
        state.mutations.push(Mutation::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        });
        Ok(())
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut state = self.lock();
        state.take_failure(Op::CreateDirAll)?;
        state.add_dirs(path);
        state.mutations.push(Mutation::CreateDirAll(path.to_path_buf()));
        Ok(())
    }

    fn create(&self, path: &Path) -> io::Result<Self::Writer> {
        let mut state = self.lock();
        // A missing parent wins over an injected failure so the injection
        // can target the retry after directory creation.
        if !state.parent_exists(path) {
            return Err(not_found(path));
        }
        state.take_failure(Op::Create)?;
        if state.dirs.contains(path) {
            return Err(io::Error::other(format!(
                "is a directory: {}",
                path.display()
            )));
        }
        let id = state.fresh_id();
        state.files.insert(
            path.to_path_buf(),
            FileEntry {
                id,
                data: Vec::new(),
                synced: Vec::new(),
            },
        );
        state.mutations.push(Mutation::Create(path.to_path_buf()));
        Ok(MemoryWriter {
            state: Arc::clone(&self.state),
            id,
            buf: Vec::new(),
        })
    }

    fn open(&self, path: &Path) -> io::Result<Self::Reader> {
        let mut state = self.lock();
        state.take_failure(Op::Open)?;
        let entry = state.files.get(path).ok_or_else(|| not_found(path))?;
        Ok(Cursor::new(entry.data.clone()))
    }

    fn sync_dir(&self, _dir: &Path) -> io::Result<()> {
        self.lock().take_failure(Op::SyncDir)
    }
}
