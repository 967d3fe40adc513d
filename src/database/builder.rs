//! # Database Builder
//!
//! `DatabaseBuilder` configures and opens a [`Database`]. Settings can be
//! chained as typed setters or applied from string pairs with
//! [`DatabaseBuilder::property`]; both end up in one [`StorageConfig`].
//!
//! ## Storage Backend Selection
//!
//! - **File** (`path`): memory-mapped database file. The default for real
//!   use. Honors `lock_file`.
//! - **Memory** (`in_memory`): a [`MemoryFile`] image. Clones of the image
//!   share content, which lets tests reopen "the same file" or inspect it
//!   after a simulated crash.
//! - **Custom** (`storage`): any [`StorageFile`] implementation.
//!
//! ## Usage Examples
//!
//! ```ignore
//! let db = Database::builder()
//!     .path("./objects.db")
//!     .gc_threshold(Some(16 * 1024 * 1024))
//!     .background_gc(true)
//!     .open()?;
//! ```
//!
//! ```ignore
//! let db = Database::builder()
//!     .in_memory(MemoryFile::new())
//!     .property("page_pool.size", "64")?
//!     .property("oid.reuse", "off")?
//!     .open()?;
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, OnceLock};

use eyre::{eyre, Result};
use parking_lot::{Mutex, RwLock};
use tracing::info;

use super::gc_worker::GcWorker;
use super::lifecycle::LockFile;
use super::transaction::Monitor;
use super::{Database, Shared, StorageConfig};
use crate::engine::Engine;
use crate::layout::{ObjectLayout, ShapeLayout};
use crate::listener::StorageListener;
use crate::storage::{MemoryFile, MmapFile, StorageFile};

enum Target {
    Path(PathBuf),
    Memory(MemoryFile),
    Custom(Box<dyn StorageFile>),
}

pub struct DatabaseBuilder {
    target: Option<Target>,
    config: StorageConfig,
    layout: Option<Arc<dyn ObjectLayout>>,
    listener: Option<Arc<dyn StorageListener>>,
}

impl Default for DatabaseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self {
            target: None,
            config: StorageConfig::default(),
            layout: None,
            listener: None,
        }
    }

    /// Stores the database in the file at `path`, created when missing.
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.target = Some(Target::Path(path.as_ref().to_path_buf()));
        self
    }

    pub fn in_memory(mut self, file: MemoryFile) -> Self {
        self.target = Some(Target::Memory(file));
        self
    }

    pub fn storage(mut self, file: Box<dyn StorageFile>) -> Self {
        self.target = Some(Target::Custom(file));
        self
    }

    /// Replaces every setting at once.
    pub fn config(mut self, config: StorageConfig) -> Self {
        self.config = config;
        self
    }

    /// Applies a `key = value` setting; see [`StorageConfig::property`].
    pub fn property(mut self, key: &str, value: &str) -> Result<Self> {
        self.config.property(key, value)?;
        Ok(self)
    }

    pub fn initial_index_size(mut self, slots: u32) -> Self {
        self.config.initial_index_size = slots;
        self
    }

    pub fn object_cache_size(mut self, objects: usize) -> Self {
        self.config.object_cache_size = objects;
        self
    }

    pub fn page_pool_size(mut self, pages: usize) -> Self {
        self.config.page_pool_size = pages;
        self
    }

    pub fn extension_quantum(mut self, bytes: u64) -> Self {
        self.config.extension_quantum = bytes;
        self
    }

    /// Allocation volume after which a collection runs; `None` disables
    /// automatic collection.
    pub fn gc_threshold(mut self, bytes: Option<u64>) -> Self {
        self.config.gc_threshold = bytes;
        self
    }

    pub fn background_gc(mut self, enabled: bool) -> Self {
        self.config.background_gc = enabled;
        self
    }

    pub fn read_only(mut self, enabled: bool) -> Self {
        self.config.read_only = enabled;
        self
    }

    pub fn truncate(mut self, enabled: bool) -> Self {
        self.config.truncate = enabled;
        self
    }

    pub fn lock_file(mut self, enabled: bool) -> Self {
        self.config.lock_file = enabled;
        self
    }

    pub fn multiclient(mut self, enabled: bool) -> Self {
        self.config.multiclient = enabled;
        self
    }

    pub fn reuse_oid(mut self, enabled: bool) -> Self {
        self.config.reuse_oid = enabled;
        self
    }

    pub fn max_object_oid(mut self, oid: u32) -> Self {
        self.config.max_object_oid = oid;
        self
    }

    /// Reflector used by the GC to find references. Defaults to
    /// `ShapeLayout::default()`, under which no record refers to anything.
    pub fn layout(mut self, layout: Arc<dyn ObjectLayout>) -> Self {
        self.layout = Some(layout);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StorageListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn open(self) -> Result<Database> {
        let Self {
            target,
            config,
            layout,
            listener,
        } = self;
        config.validate()?;

        let target = target.ok_or_else(|| eyre!("no storage configured: call path() or in_memory()"))?;
        let mut lock_file = None;
        let file: Box<dyn StorageFile> = match target {
            Target::Path(path) => {
                if config.lock_file {
                    lock_file = Some(LockFile::acquire(&path)?);
                }
                Box::new(MmapFile::open(&path, config.read_only)?)
            }
            Target::Memory(file) => Box::new(file),
            Target::Custom(file) => file,
        };

        let layout = layout.unwrap_or_else(|| Arc::new(ShapeLayout::default()));
        let engine = Engine::open(file, &config, layout, listener)?;

        let background_gc = config.background_gc;
        let db = Database {
            shared: Arc::new(Shared {
                config,
                monitor: Monitor::default(),
                storage: RwLock::new(()),
                engine: Mutex::new(Some(engine)),
                gc_worker: Mutex::new(None),
                gc_requests: OnceLock::new(),
                object_locks: Default::default(),
                lock_file: Mutex::new(lock_file),
                next_txn_id: AtomicU64::new(1),
            }),
        };

        if background_gc {
            let shared = Arc::downgrade(&db.shared);
            let worker = GcWorker::spawn(move || shared.upgrade().map(|s| s.collect_now()))?;
            let _ = db.shared.gc_requests.set(worker.requests());
            *db.shared.gc_worker.lock() = Some(worker);
        }

        info!(
            read_only = db.shared.config.read_only,
            background_gc, "database opened"
        );
        Ok(db)
    }
}
