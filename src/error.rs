//! Error types for the atomic-file-store crate.

use std::path::PathBuf;

/// Errors surfaced by [`AtomicFile`](crate::AtomicFile) operations.
#[derive(Debug, thiserror::Error)]
pub enum AtomicFileError {
    /// Renaming one generation over another failed.
    ///
    /// Raised while preserving the current file as the backup in
    /// `start_write`, and while restoring the backup in `open_read`.
    #[error("failed to rename {} to {}: {source}", from.display(), to.display())]
    RenameFailed {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The primary file could not be created, even after creating its
    /// parent directories.
    #[error("failed to create {}: {source}", path.display())]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Forcing written bytes to durable storage failed. The backup is kept.
    #[error("failed to sync {}: {source}", path.display())]
    SyncFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Neither the file nor its backup exists.
    #[error("file not found: {}", path.display())]
    NotFound { path: PathBuf },

    /// Read, write, flush or open failure on the underlying storage.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AtomicFileError {
    /// True for [`AtomicFileError::NotFound`].
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// The path the failing operation was acting on.
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::RenameFailed { from, .. } => from,
            Self::CreateFailed { path, .. }
            | Self::SyncFailed { path, .. }
            | Self::NotFound { path }
            | Self::Io { path, .. } => path,
        }
    }
}

impl From<AtomicFileError> for std::io::Error {
    fn from(err: AtomicFileError) -> Self {
        let kind = if err.is_not_found() {
            std::io::ErrorKind::NotFound
        } else {
            std::io::ErrorKind::Other
        };
        Self::new(kind, err)
    }
}

/// Convenience result type for atomic-file-store operations.
pub type AtomicFileResult<T> = Result<T, AtomicFileError>;
