//! # Database Module
//!
//! The public face of the store: a thread-safe [`Database`] that owns one
//! [`Engine`] and hands out [`Transaction`] handles.
//!
//! ## Architecture
//!
//! ```text
//!        Database (Send + Sync, one per file)
//!            │
//!            ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │ Shared                                                    │
//! │                                                           │
//! │  1. monitor      Mutex<MonitorState> + Condvar            │
//! │                  admits exclusive / cooperative /         │
//! │                  serializable transactions                │
//! │  2. storage      RwLock<()>                               │
//! │                  write: open, close, commit, rollback,    │
//! │                         serializable apply                │
//! │                  read:  single operations, backup, GC     │
//! │  3. engine       Mutex<Option<Engine>>  (None = closed)   │
//! │  4. gc_worker    Mutex<Option<GcWorker>>                  │
//! │                  worker handle and completion channel     │
//! │                                                           │
//! │  gc_requests     lock-free sender of collection requests  │
//! │  object_locks    per-object locks of serializable writers │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! Locks are always taken in the numbered order above. No code path takes a
//! lower-numbered lock while holding a higher-numbered one.
//!
//! ## Garbage Collection
//!
//! After every operation the engine is asked whether an allocation crossed
//! the GC threshold. If it did, the cycle runs right away on the calling
//! thread, or is handed to the background worker when `background_gc` is
//! set. [`Database::gc`] runs a cycle explicitly.
//!
//! ## Usage Example
//!
//! ```ignore
//! use shadowstore::{Database, TransactionMode};
//!
//! let db = Database::builder().path("./objects.db").gc_threshold(Some(1 << 20)).open()?;
//!
//! let mut txn = db.begin(TransactionMode::Exclusive)?;
//! let oid = txn.insert(1, b"hello")?;
//! txn.set_root(oid)?;
//! txn.end()?;
//!
//! assert_eq!(&*db.load(oid)?.body, b"hello");
//! db.close()?;
//! ```

mod builder;
mod config;
mod gc_worker;
mod lifecycle;
mod object_locks;
mod transaction;

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use eyre::{bail, Result};
use parking_lot::{Mutex, RwLock};

pub use builder::DatabaseBuilder;
pub use config::StorageConfig;
pub use transaction::{Transaction, TransactionMode, TxnId};

use crate::engine::{Engine, Record};
use crate::error::StorageError;
use crate::Oid;
use gc_worker::{GcRequests, GcWorker};
use lifecycle::LockFile;
use object_locks::ObjectLocks;
use transaction::Monitor;

pub(crate) struct Shared {
    config: StorageConfig,
    monitor: Monitor,
    storage: RwLock<()>,
    engine: Mutex<Option<Engine>>,
    gc_worker: Mutex<Option<GcWorker>>,
    gc_requests: OnceLock<GcRequests>,
    object_locks: ObjectLocks,
    lock_file: Mutex<Option<LockFile>>,
    next_txn_id: AtomicU64,
}

impl Shared {
    fn check_open(&self) -> Result<()> {
        if self.engine.lock().is_none() {
            bail!(StorageError::NotOpened);
        }
        Ok(())
    }

    fn next_transaction_id(&self) -> TxnId {
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Runs `op` under the storage read lock and the engine lock, then starts
    /// a collection if `op` crossed the GC threshold.
    fn with_engine<T>(&self, op: impl FnOnce(&mut Engine) -> Result<T>) -> Result<T> {
        let _storage = self.storage.read();
        let mut guard = self.engine.lock();
        let Some(engine) = guard.as_mut() else {
            bail!(StorageError::NotOpened);
        };
        let value = op(engine)?;
        self.collect_if_requested(engine)?;
        Ok(value)
    }

    /// Like [`Shared::with_engine`], under the storage write lock.
    fn with_engine_exclusive<T>(&self, op: impl FnOnce(&mut Engine) -> Result<T>) -> Result<T> {
        let _storage = self.storage.write();
        let mut guard = self.engine.lock();
        let Some(engine) = guard.as_mut() else {
            bail!(StorageError::NotOpened);
        };
        let value = op(engine)?;
        self.collect_if_requested(engine)?;
        Ok(value)
    }

    fn collect_if_requested(&self, engine: &mut Engine) -> Result<()> {
        if !engine.take_gc_request() {
            return Ok(());
        }
        if let Some(requests) = self.gc_requests.get() {
            return requests.request();
        }
        engine.collect()?;
        Ok(())
    }

    /// One collection cycle, as run by the background worker.
    fn collect_now(&self) -> Result<usize> {
        let _storage = self.storage.read();
        let mut guard = self.engine.lock();
        let Some(engine) = guard.as_mut() else {
            bail!(StorageError::NotOpened);
        };
        engine.collect()
    }

    fn commit_now(&self) -> Result<bool> {
        self.with_engine_exclusive(|engine| engine.commit())
    }

    fn rollback_now(&self) -> Result<bool> {
        self.with_engine_exclusive(|engine| engine.rollback())
    }
}

/// An open object store. Cheap to share across threads by reference.
pub struct Database {
    shared: Arc<Shared>,
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    /// Opens or creates the database file at `path` with default settings.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        DatabaseBuilder::new().path(path).open()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    /// Reads `oid` outside of any transaction. Uncommitted cooperative or
    /// exclusive changes are visible; serializable buffers are not.
    pub fn load(&self, oid: Oid) -> Result<Record> {
        self.shared.with_engine(|engine| engine.load(oid))
    }

    pub fn root(&self) -> Result<Oid> {
        self.shared.with_engine(|engine| Ok(engine.root()))
    }

    pub fn schema_root(&self) -> Result<Oid> {
        self.shared.with_engine(|engine| Ok(engine.schema_root()))
    }

    /// Commits the working state. Returns false when nothing was modified.
    pub fn commit(&self) -> Result<bool> {
        let committed = self.shared.commit_now()?;
        self.shared.monitor.commit_completed();
        Ok(committed)
    }

    /// Discards the working state. Returns false when nothing was modified.
    pub fn rollback(&self) -> Result<bool> {
        self.shared.rollback_now()
    }

    /// Runs one collection cycle on the calling thread and returns the number
    /// of reclaimed objects. Space is released by the next commit.
    pub fn gc(&self) -> Result<usize> {
        self.shared.with_engine(|engine| engine.collect())
    }

    /// Waits for queued background cycles. Returns what they reclaimed.
    pub fn await_background_gc(&self) -> Result<usize> {
        let mut worker = self.shared.gc_worker.lock();
        match worker.as_mut() {
            Some(worker) => worker.wait(),
            None => Ok(0),
        }
    }

    /// Streams a consistent image of the last committed state to `out` and
    /// returns the number of bytes written.
    pub fn backup(&self, out: &mut dyn Write) -> Result<u64> {
        self.shared.with_engine(|engine| engine.backup(out))
    }

    pub fn transaction_id(&self) -> Result<u64> {
        self.shared.with_engine(|engine| Ok(engine.transaction_id()))
    }

    /// Bytes currently allocated, uncommitted allocations included.
    pub fn used_size(&self) -> Result<u64> {
        self.shared.with_engine(|engine| Ok(engine.used_size()))
    }

    /// Size of the committed file image.
    pub fn database_size(&self) -> Result<u64> {
        self.shared.with_engine(|engine| Ok(engine.database_size()))
    }

    pub fn is_modified(&self) -> Result<bool> {
        self.shared.with_engine(|engine| Ok(engine.is_modified()))
    }
}
