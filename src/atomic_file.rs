//! Crash-safe file replacement via backup rename.
//!
//! A write first renames the current file to `<path>.bak`, writes the new
//! generation at `<path>`, syncs it, and only then removes the backup. The
//! backup's presence therefore means "the primary cannot be trusted yet":
//! any read that finds a backup discards the primary and renames the backup
//! back into place before opening it.
//!
//! ```text
//!   start_write          write + finish_write          (commit)
//! [a]  ──rename──▶  [a.bak]  +  [a: partial]  ──sync──▶  remove a.bak  ──▶  [a]
//!                        ▲                    │
//!                        └──── open_read ◀────┘  (crash before commit)
//! ```
//!
//! The store does no locking. Callers must ensure only one operation is in
//! flight per path.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{AtomicFileError, AtomicFileResult};
use crate::storage::{FsStorage, Storage, SyncWrite};

/// Suffix appended to the file name to form the backup path.
pub const BACKUP_SUFFIX: &str = ".bak";

/// A single file that is replaced atomically with respect to crashes.
#[derive(Debug, Clone)]
pub struct AtomicFile<S: Storage = FsStorage> {
    base: PathBuf,
    backup: PathBuf,
    storage: S,
}

impl AtomicFile<FsStorage> {
    /// Atomic file at `path` on the local filesystem.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_storage(path, FsStorage::default())
    }
}

impl<S: Storage> AtomicFile<S> {
    pub fn with_storage(path: impl Into<PathBuf>, storage: S) -> Self {
        let base = path.into();
        let backup = backup_path_for(&base);
        Self {
            base,
            backup,
            storage,
        }
    }

    /// The caller-visible path.
    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    pub const fn storage(&self) -> &S {
        &self.storage
    }

    /// Whether the file or its backup exists.
    pub fn exists(&self) -> bool {
        self.storage.exists(&self.base) || self.storage.exists(&self.backup)
    }

    /// Remove the file and its backup. Each removal is independent and a
    /// missing file is not an error.
    pub fn delete(&self) {
        self.remove_quietly(&self.base);
        self.remove_quietly(&self.backup);
    }

    /// Begin writing a new generation.
    ///
    /// The current content is preserved as the backup before anything is
    /// truncated. Write the new bytes into the returned writer and pass it
    /// to [`finish_write`](Self::finish_write). Dropping the writer instead
    /// leaves the backup in place, and the next read restores it.
    pub fn start_write(&self) -> AtomicFileResult<AtomicWriter<S::Writer>> {
        if self.storage.exists(&self.base) {
            if self.storage.exists(&self.backup) {
                // The backup is already the last good generation.
                debug!(path = %self.base.display(), "discarding primary left by an unfinished write");
                if let Err(e) = self.storage.remove(&self.base) {
                    warn!(path = %self.base.display(), error = %e, "failed to remove stale primary");
                }
            } else {
                self.storage
                    .rename(&self.base, &self.backup)
                    .map_err(|source| AtomicFileError::RenameFailed {
                        from: self.base.clone(),
                        to: self.backup.clone(),
                        source,
                    })?;
                debug!(path = %self.base.display(), "moved current generation to backup");
                self.sync_parent();
            }
        }

        let writer = self.create_base()?;
        Ok(AtomicWriter {
            inner: writer,
            path: self.base.clone(),
        })
    }

    /// Commit a write started with [`start_write`](Self::start_write).
    ///
    /// Flushes and syncs the new content, closes the writer, then removes
    /// the backup. Once this returns `Ok` the new content is what every
    /// later read sees, crash or not. On error the writer is closed and the
    /// previous generation is still what the next read returns.
    pub fn finish_write(&self, mut writer: AtomicWriter<S::Writer>) -> AtomicFileResult<()> {
        writer.inner.flush().map_err(|source| AtomicFileError::Io {
            path: self.base.clone(),
            source,
        })?;
        writer.inner.sync().map_err(|source| AtomicFileError::SyncFailed {
            path: self.base.clone(),
            source,
        })?;
        drop(writer);

        // Removing the backup is the commit point. While it exists a read
        // would roll back to it.
        match self.storage.remove(&self.backup) {
            Ok(()) => self.sync_parent(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(AtomicFileError::Io {
                    path: self.backup.clone(),
                    source,
                });
            }
        }
        debug!(path = %self.base.display(), "write committed");
        Ok(())
    }

    /// Abandon a write started with [`start_write`](Self::start_write) and
    /// put the previous generation back.
    ///
    /// Failures are logged, not returned: whatever is left behind is
    /// recovered by the next [`open_read`](Self::open_read) or
    /// [`start_write`](Self::start_write).
    pub fn fail_write(&self, writer: AtomicWriter<S::Writer>) {
        drop(writer);
        if self.storage.exists(&self.backup) {
            self.remove_quietly(&self.base);
            if let Err(e) = self.storage.rename(&self.backup, &self.base) {
                warn!(path = %self.base.display(), error = %e, "failed to restore backup after abandoned write");
                return;
            }
            self.sync_parent();
        } else {
            // No previous generation: the partial file must not be taken as one.
            self.remove_quietly(&self.base);
        }
        debug!(path = %self.base.display(), "write abandoned");
    }

    /// Open the file for reading, first restoring the backup if a write
    /// never committed.
    pub fn open_read(&self) -> AtomicFileResult<S::Reader> {
        self.restore_backup()?;
        self.storage.open(&self.base).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                AtomicFileError::NotFound {
                    path: self.base.clone(),
                }
            } else {
                AtomicFileError::Io {
                    path: self.base.clone(),
                    source,
                }
            }
        })
    }

    /// Read the whole file. See [`open_read`](Self::open_read).
    pub fn read_fully(&self) -> AtomicFileResult<Vec<u8>> {
        let mut reader = self.open_read()?;
        let mut bytes = Vec::new();
        reader
            .read_to_end(&mut bytes)
            .map_err(|source| AtomicFileError::Io {
                path: self.base.clone(),
                source,
            })?;
        Ok(bytes)
    }

    /// Replace the file's content with `bytes` in one call.
    ///
    /// If writing the bytes fails the write is abandoned with
    /// [`fail_write`](Self::fail_write) before the error is returned.
    pub fn write_fully(&self, bytes: &[u8]) -> AtomicFileResult<()> {
        let mut writer = self.start_write()?;
        if let Err(source) = writer.write_all(bytes) {
            self.fail_write(writer);
            return Err(AtomicFileError::Io {
                path: self.base.clone(),
                source,
            });
        }
        self.finish_write(writer)
    }

    fn restore_backup(&self) -> AtomicFileResult<()> {
        if !self.storage.exists(&self.backup) {
            return Ok(());
        }
        warn!(path = %self.base.display(), "found backup from an unfinished write, restoring it");
        match self.storage.remove(&self.base) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                // rename replaces the destination anyway
                debug!(path = %self.base.display(), error = %e, "could not remove partial primary");
            }
        }
        self.storage
            .rename(&self.backup, &self.base)
            .map_err(|source| AtomicFileError::RenameFailed {
                from: self.backup.clone(),
                to: self.base.clone(),
                source,
            })?;
        self.sync_parent();
        Ok(())
    }

    fn create_base(&self) -> AtomicFileResult<S::Writer> {
        let create_failed = |source| AtomicFileError::CreateFailed {
            path: self.base.clone(),
            source,
        };
        match self.storage.create(&self.base) {
            Ok(writer) => Ok(writer),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let Some(parent) = self.base.parent().filter(|p| !p.as_os_str().is_empty()) else {
                    return Err(create_failed(e));
                };
                debug!(dir = %parent.display(), "creating missing parent directory");
                self.storage.create_dir_all(parent).map_err(create_failed)?;
                self.storage.create(&self.base).map_err(create_failed)
            }
            Err(e) => Err(create_failed(e)),
        }
    }

    fn remove_quietly(&self, path: &Path) {
        match self.storage.remove(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
        }
    }

    fn sync_parent(&self) {
        let Some(parent) = self.base.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return;
        };
        if let Err(e) = self.storage.sync_dir(parent) {
            warn!(dir = %parent.display(), error = %e, "failed to sync directory");
        }
    }
}

fn backup_path_for(base: &Path) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Writer for one in-progress generation, returned by
/// [`AtomicFile::start_write`].
///
/// Dropping it closes the underlying file without syncing and without
/// touching the backup.
#[derive(Debug)]
pub struct AtomicWriter<W> {
    inner: W,
    path: PathBuf,
}

impl<W> AtomicWriter<W> {
    /// The primary path being written.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl<W: Write> Write for AtomicWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, Mutation, Op};

    const PATH: &str = "/data/state.bin";
    const BACKUP: &str = "/data/state.bin.bak";

    fn store(storage: &MemoryStorage) -> AtomicFile<MemoryStorage> {
        AtomicFile::with_storage(PATH, storage.clone())
    }

    #[test]
    fn test_backup_path_appends_suffix() {
        let file = AtomicFile::new("/tmp/settings.json");
        assert_eq!(file.base_path(), Path::new("/tmp/settings.json"));
        assert_eq!(file.backup_path(), Path::new("/tmp/settings.json.bak"));
    }

    #[test]
    fn test_fresh_file() {
        let storage = MemoryStorage::new();
        let file = store(&storage);
        assert!(!file.exists());

        file.write_fully(b"first").expect("write");

        assert!(file.exists());
        assert_eq!(file.read_fully().expect("read"), b"first");
        assert_eq!(storage.files(), vec![PathBuf::from(PATH)]);
    }

    #[test]
    fn test_start_write_moves_primary_to_backup() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "old");
        let file = store(&storage);

        let writer = file.start_write().expect("start write");

        assert_eq!(storage.contents(BACKUP).expect("file present"), b"old");
        assert_eq!(storage.contents(PATH).expect("file present"), b"");
        assert_eq!(writer.path(), Path::new(PATH));
    }

    #[test]
    fn test_start_write_discards_primary_when_backup_exists() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "partial");
        storage.insert(BACKUP, "good");
        let file = store(&storage);

        let mut writer = file.start_write().expect("start write");
        writer.write_all(b"new").expect("write bytes");

        // Backup is untouched; it is still the fallback.
        assert_eq!(storage.contents(BACKUP).expect("file present"), b"good");
        drop(writer);
        assert_eq!(file.read_fully().expect("read"), b"good");
    }

    #[test]
    fn test_start_write_keeps_lone_backup() {
        let storage = MemoryStorage::new();
        storage.insert(BACKUP, "good");
        let file = store(&storage);

        let mut writer = file.start_write().expect("start write");
        writer.write_all(b"new").expect("write bytes");
        file.finish_write(writer).expect("finish write");

        assert!(storage.contents(BACKUP).is_none());
        assert_eq!(file.read_fully().expect("read"), b"new");
    }

    #[test]
    fn test_rename_failure_aborts_without_damage() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "old");
        storage.fail_next(Op::Rename);
        let file = store(&storage);

        let err = file.start_write().expect_err("start should fail");

        assert!(matches!(err, AtomicFileError::RenameFailed { .. }));
        assert_eq!(storage.contents(PATH).expect("file present"), b"old");
        assert!(storage.contents(BACKUP).is_none());
    }

    #[test]
    fn test_missing_directory_created_and_retried_once() {
        let storage = MemoryStorage::new();
        let file = store(&storage);

        file.write_fully(b"x").expect("write");

        assert_eq!(
            storage.mutations(),
            vec![
                Mutation::CreateDirAll(PathBuf::from("/data")),
                Mutation::Create(PathBuf::from(PATH)),
            ]
        );
    }

    #[test]
    fn test_second_create_failure_is_fatal() {
        let storage = MemoryStorage::new();
        storage.fail_next(Op::Create);
        let file = store(&storage);

        let err = file.start_write().expect_err("start should fail");

        assert!(matches!(err, AtomicFileError::CreateFailed { .. }));
        assert_eq!(
            storage.mutations(),
            vec![Mutation::CreateDirAll(PathBuf::from("/data"))]
        );
    }

    #[test]
    fn test_create_failure_is_fatal() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "old");
        storage.fail_next(Op::Create);
        let file = store(&storage);

        let err = file.start_write().expect_err("start should fail");

        assert!(matches!(err, AtomicFileError::CreateFailed { .. }));
        // Old content sits in the backup and is restored on read.
        assert_eq!(file.read_fully().expect("read"), b"old");
    }

    #[test]
    fn test_directory_creation_failure_is_create_failed() {
        let storage = MemoryStorage::new();
        storage.fail_next(Op::CreateDirAll);
        let file = store(&storage);

        let err = file.start_write().expect_err("start should fail");
        assert!(matches!(err, AtomicFileError::CreateFailed { .. }));
        assert!(!file.exists());
    }

    #[test]
    fn test_sync_failure_keeps_backup() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "old");
        let file = store(&storage);

        let mut writer = file.start_write().expect("start write");
        writer.write_all(b"new").expect("write bytes");
        storage.fail_next(Op::Sync);
        let err = file.finish_write(writer).expect_err("finish should fail");

        assert!(matches!(err, AtomicFileError::SyncFailed { .. }));
        assert_eq!(storage.contents(BACKUP).expect("file present"), b"old");
        assert_eq!(file.read_fully().expect("read"), b"old");
    }

    #[test]
    fn test_flush_failure_is_io_and_keeps_backup() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "old");
        let file = store(&storage);

        let mut writer = file.start_write().expect("start write");
        writer.write_all(b"new").expect("write bytes");
        storage.fail_next(Op::Flush);
        let err = file.finish_write(writer).expect_err("finish should fail");

        assert!(matches!(err, AtomicFileError::Io { .. }));
        assert!(storage.contents(BACKUP).is_some());
    }

    #[test]
    fn test_crash_before_commit_restores_old() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "A");
        let file = store(&storage);

        let mut writer = file.start_write().expect("start write");
        writer.write_all(b"BBBB").expect("write bytes");
        writer.flush().expect("flush");

        let restarted = storage.crash();
        drop(writer);
        let file = store(&restarted);
        assert_eq!(file.read_fully().expect("read"), b"A");
        assert!(restarted.contents(BACKUP).is_none());
    }

    #[test]
    fn test_crash_after_commit_keeps_new() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "A");
        store(&storage).write_fully(b"B").expect("write");

        let restarted = storage.crash();
        assert_eq!(store(&restarted).read_fully().expect("read"), b"B");
    }

    #[test]
    fn test_backup_removal_failure_is_not_a_commit() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "A");
        let file = store(&storage);

        let mut writer = file.start_write().expect("start write");
        writer.write_all(b"B").expect("write bytes");
        storage.fail_next(Op::Remove);
        let err = file.finish_write(writer).expect_err("finish should fail");
        assert!(matches!(err, AtomicFileError::Io { .. }));

        // Synced B sits at the primary, but the backup still exists so the
        // write never committed and recovery rolls back to A.
        let restarted = storage.crash();
        assert_eq!(restarted.synced_contents(PATH).expect("file present"), b"B");
        assert_eq!(store(&restarted).read_fully().expect("read"), b"A");
    }

    #[test]
    fn test_abandoned_writer_is_recovered_by_next_write() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "A");
        let file = store(&storage);

        let mut writer = file.start_write().expect("start write");
        writer.write_all(b"half").expect("write bytes");
        drop(writer);

        file.write_fully(b"C").expect("write");
        assert_eq!(file.read_fully().expect("read"), b"C");
        assert!(storage.contents(BACKUP).is_none());
    }

    #[test]
    fn test_fail_write_restores_previous_generation() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "A");
        let file = store(&storage);

        let mut writer = file.start_write().expect("start write");
        writer.write_all(b"junk").expect("write bytes");
        file.fail_write(writer);

        assert_eq!(storage.files(), vec![PathBuf::from(PATH)]);
        assert_eq!(storage.contents(PATH).expect("file present"), b"A");
    }

    #[test]
    fn test_fail_write_on_fresh_file_leaves_nothing() {
        let storage = MemoryStorage::new();
        let file = store(&storage);

        let writer = file.start_write().expect("start write");
        file.fail_write(writer);

        assert!(!file.exists());
        assert!(file.open_read().expect_err("open should fail").is_not_found());
    }

    #[test]
    fn test_write_fully_abandons_on_write_error() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "A");
        let file = store(&storage);

        storage.fail_next(Op::Write);
        let err = file.write_fully(b"B").expect_err("write should fail");

        assert!(matches!(err, AtomicFileError::Io { .. }));
        assert_eq!(storage.files(), vec![PathBuf::from(PATH)]);
        assert_eq!(file.read_fully().expect("read"), b"A");
    }

    #[test]
    fn test_open_read_is_idempotent() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "partial");
        storage.insert(BACKUP, "good");
        let file = store(&storage);

        assert_eq!(file.read_fully().expect("read"), b"good");
        storage.clear_mutations();
        assert_eq!(file.read_fully().expect("read"), b"good");
        assert!(storage.mutations().is_empty());
    }

    #[test]
    fn test_recovery_rename_failure_surfaces() {
        let storage = MemoryStorage::new();
        storage.insert(BACKUP, "good");
        storage.fail_next(Op::Rename);
        let file = store(&storage);

        let err = file.open_read().expect_err("open should fail");
        assert!(matches!(err, AtomicFileError::RenameFailed { .. }));
        assert_eq!(file.read_fully().expect("read"), b"good");
    }

    #[test]
    fn test_open_failure_is_io_not_not_found() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "A");
        storage.fail_next(Op::Open);

        let err = store(&storage).open_read().expect_err("open should fail");
        assert!(matches!(err, AtomicFileError::Io { .. }));
    }

    #[test]
    fn test_delete_clears_all_state() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "partial");
        storage.insert(BACKUP, "good");
        let file = store(&storage);

        file.delete();

        assert!(!file.exists());
        assert!(file.open_read().expect_err("open should fail").is_not_found());
        // Nothing left to delete is not an error.
        file.delete();
    }

    #[test]
    fn test_dir_sync_failure_is_tolerated() {
        let storage = MemoryStorage::new();
        storage.insert(PATH, "A");
        storage.fail_next(Op::SyncDir);

        store(&storage).write_fully(b"B").expect("write");
        assert_eq!(store(&storage).read_fully().expect("read"), b"B");
    }
}
