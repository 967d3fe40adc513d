//! # Database Lifecycle
//!
//! Opening and closing a [`Database`](super::Database), plus the advisory
//! lock file that keeps two processes from opening the same file.
//!
//! ## Lock File
//!
//! With `lock_file` set, `<path>.lock` is created with `create_new` at open
//! and removed at close. A second open of the same path fails with
//! *invalid-operation* while the lock exists. A process that dies without
//! closing leaves the lock behind; deleting it by hand is the recovery.
//!
//! ## Close
//!
//! ```text
//! close()
//!   1. stop the background GC worker (waits for a running cycle)
//!   2. storage write lock
//!   3. commit pending changes, clear the dirty flag, flush
//!   4. drop the engine (later calls fail with NotOpened)
//!   5. remove the lock file
//! ```
//!
//! Dropping a `Database` closes it; errors at that point are logged.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use eyre::{bail, Result, WrapErr};
use tracing::{info, warn};

use super::Database;
use crate::error::StorageError;

#[derive(Debug)]
pub(crate) struct LockFile {
    path: PathBuf,
    _file: File,
}

impl LockFile {
    pub fn lock_path(database: &Path) -> PathBuf {
        let mut name = database.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Creates the lock file for `database`, failing if it already exists.
    pub fn acquire(database: &Path) -> Result<Self> {
        let path = Self::lock_path(database);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                bail!(StorageError::InvalidOperation(
                    "database is locked by another process"
                ))
            }
            Err(err) => {
                return Err(err)
                    .wrap_err_with(|| format!("failed to create lock file {}", path.display()))
            }
        };
        // pid helps whoever has to clean up a stale lock
        let _ = writeln!(file, "{}", std::process::id());
        Ok(Self { path, _file: file })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to remove lock file");
        }
    }
}

impl Database {
    /// Commits pending work and closes the file. Later calls fail with
    /// *not-opened*; closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let worker = self.shared.gc_worker.lock().take();
        if let Some(worker) = worker {
            worker.shutdown()?;
        }

        let _storage = self.shared.storage.write();
        let Some(mut engine) = self.shared.engine.lock().take() else {
            return Ok(());
        };
        let result = engine.close();
        drop(engine);
        self.shared.lock_file.lock().take();

        self.shared.monitor.wake_all();
        if result.is_ok() {
            info!("database closed");
        }
        result
    }

    pub fn is_open(&self) -> bool {
        self.shared.engine.lock().is_some()
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close database");
        }
    }
}
