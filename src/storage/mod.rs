//! Durable storage primitives consumed by [`AtomicFile`](crate::AtomicFile).
//!
//! The protocol only needs a handful of operations: existence checks,
//! remove, rename, directory creation, create-for-write, open-for-read and a
//! hardware sync on written files. [`Storage`] names exactly those, so the
//! protocol can run against the real filesystem ([`FsStorage`]) or against
//! [`MemoryStorage`], which can simulate crashes and inject failures.
//!
//! # Contract
//!
//! - `remove` and `open` report an absent path with [`io::ErrorKind::NotFound`].
//! - `create` truncates an existing file and reports a missing parent
//!   directory with [`io::ErrorKind::NotFound`].
//! - `rename` is atomic and replaces the destination if it exists.
//! - [`SyncWrite::sync`] returns only once every byte written so far would
//!   survive power loss.

pub mod memory;

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

pub use memory::{MemoryStorage, Mutation, Op};

/// A byte sink that can force its contents to durable storage.
pub trait SyncWrite: Write {
    /// Flush buffered bytes and block until they are durable.
    fn sync(&mut self) -> io::Result<()>;
}

/// Minimal durable-file interface.
pub trait Storage {
    /// Sink returned by [`Storage::create`].
    type Writer: SyncWrite;
    /// Source returned by [`Storage::open`].
    type Reader: Read;

    fn exists(&self, path: &Path) -> bool;

    fn remove(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn create(&self, path: &Path) -> io::Result<Self::Writer>;

    fn open(&self, path: &Path) -> io::Result<Self::Reader>;

    /// Make directory entry changes (renames, removals) under `dir` durable.
    fn sync_dir(&self, dir: &Path) -> io::Result<()>;
}

macro_rules! forward_storage {
    ($($ty:ty),+) => {$(
        impl<S: Storage + ?Sized> Storage for $ty {
            type Writer = S::Writer;
            type Reader = S::Reader;

            fn exists(&self, path: &Path) -> bool {
                (**self).exists(path)
            }

            fn remove(&self, path: &Path) -> io::Result<()> {
                (**self).remove(path)
            }

            fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
                (**self).rename(from, to)
            }

            fn create_dir_all(&self, path: &Path) -> io::Result<()> {
                (**self).create_dir_all(path)
            }

            fn create(&self, path: &Path) -> io::Result<Self::Writer> {
                (**self).create(path)
            }

            fn open(&self, path: &Path) -> io::Result<Self::Reader> {
                (**self).open(path)
            }

            fn sync_dir(&self, dir: &Path) -> io::Result<()> {
                (**self).sync_dir(dir)
            }
        }
    )+};
}

forward_storage!(&S, Arc<S>);

/// [`Storage`] over the local filesystem.
#[derive(Debug, Clone, Copy)]
pub struct FsStorage {
    sync_dirs: bool,
}

impl FsStorage {
    /// Filesystem storage that also syncs parent directories after renames
    /// and removals.
    pub const fn new() -> Self {
        Self { sync_dirs: true }
    }

    /// Filesystem storage whose [`Storage::sync_dir`] is a no-op.
    ///
    /// File contents are still synced; only directory entries are left to
    /// the filesystem's own ordering.
    pub const fn without_dir_sync() -> Self {
        Self { sync_dirs: false }
    }

    pub const fn syncs_dirs(&self) -> bool {
        self.sync_dirs
    }
}

impl Default for FsStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Buffered file writer whose [`SyncWrite::sync`] calls `fsync`.
#[derive(Debug)]
pub struct FsWriter {
    inner: BufWriter<File>,
}

impl Write for FsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl SyncWrite for FsWriter {
    fn sync(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.inner.get_ref().sync_all()
    }
}

impl Storage for FsStorage {
    type Writer = FsWriter;
    type Reader = File;

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn create(&self, path: &Path) -> io::Result<Self::Writer> {
        let file = File::create(path)?;
        Ok(FsWriter {
            inner: BufWriter::new(file),
        })
    }

    fn open(&self, path: &Path) -> io::Result<Self::Reader> {
        File::open(path)
    }

    fn sync_dir(&self, dir: &Path) -> io::Result<()> {
        if !self.sync_dirs {
            return Ok(());
        }
        // Directories can only be opened and fsynced this way on unix.
        #[cfg(unix)]
        {
            File::open(dir)?.sync_all()
        }
        #[cfg(not(unix))]
        {
            let _ = dir;
            Ok(())
        }
    }
}
