//! `atomic-file-store` — crash-safe, single-writer file replacement.
//!
//! Replaces the contents of a file so that a crash or power loss at any
//! point leaves either the previous complete content or the new complete
//! content, never a partial file that reads as valid.
//!
//! # Protocol
//!
//! 1. `start_write` renames `<path>` to `<path>.bak` and creates `<path>` fresh.
//! 2. The caller writes the new bytes.
//! 3. `finish_write` flushes, syncs and closes `<path>`, then removes the backup.
//! 4. `open_read` restores `<path>.bak` over `<path>` if it finds one.
//!
//! # Example
//!
//! ```no_run
//! use std::io::Write as _;
//!
//! use atomic_file_store::AtomicFile;
//!
//! # fn main() -> Result<(), atomic_file_store::AtomicFileError> {
//! let file = AtomicFile::new("/var/lib/app/state.bin");
//! let mut writer = file.start_write()?;
//! writer
//!     .write_all(b"new state")
//!     .map_err(|source| atomic_file_store::AtomicFileError::Io {
//!         path: file.base_path().to_path_buf(),
//!         source,
//!     })?;
//! file.finish_write(writer)?;
//!
//! assert_eq!(file.read_fully()?, b"new state");
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! caller → AtomicFile ──▶ Storage ──▶ FsStorage     (std::fs + fsync)
//!                                └──▶ MemoryStorage (crash simulation)
//! ```

pub mod atomic_file;
pub mod error;
pub mod storage;

pub use atomic_file::{AtomicFile, AtomicWriter, BACKUP_SUFFIX};
pub use error::{AtomicFileError, AtomicFileResult};
pub use storage::{FsStorage, MemoryStorage, Storage, SyncWrite};
