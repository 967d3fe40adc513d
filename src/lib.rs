//! # shadowstore - Embedded Object Store
//!
//! shadowstore keeps a graph of serialized objects in a single file. Objects
//! are addressed by integer object ids (oids), updates are transactional, and
//! space held by unreachable objects is reclaimed by a mark-sweep collector.
//!
//! - **Shadow paging**: a transaction never overwrites committed data. The
//!   file always holds one consistent committed state; commit is a single
//!   header write.
//! - **Bitmap allocation**: one bit per 32-byte quantum, with per-page hints
//!   that skip pages known to be too full.
//! - **Crash recovery**: a dirty header at open means the last session did
//!   not close cleanly, and the working state is rebuilt from the committed
//!   root.
//!
//! ## Quick Start
//!
//! ```ignore
//! use shadowstore::{Database, TransactionMode};
//!
//! let db = Database::builder().path("./objects.db").open()?;
//!
//! let mut txn = db.begin(TransactionMode::Exclusive)?;
//! let oid = txn.insert(1, b"hello")?;
//! txn.set_root(oid)?;
//! txn.end()?;
//!
//! let record = db.load(oid)?;
//! assert_eq!(&*record.body, b"hello");
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │   database: Database, Transaction, GC worker     │
//! ├──────────────────────────────────────────────────┤
//! │   engine::objects   store / load / page objects  │
//! ├────────────────┬───────────────┬─────────────────┤
//! │ engine::commit │ engine::gc    │ engine::index   │
//! │ shadow paging  │ mark / sweep  │ oid -> position │
//! ├────────────────┴───────────────┴─────────────────┤
//! │   engine::alloc + engine::holes  bitmap allocator│
//! ├──────────────────────────────────────────────────┤
//! │   storage: PagePool, headers, records            │
//! ├──────────────────────────────────────────────────┤
//! │   StorageFile: MmapFile │ MemoryFile             │
//! └──────────────────────────────────────────────────┘
//!          layout (ObjectLayout)    listener (hooks)
//! ```
//!
//! ## Module Overview
//!
//! - [`config`]: layout constants
//! - [`error`]: `StorageError` kinds carried through `eyre`
//! - [`storage`]: page pool, file backends, on-disk headers
//! - [`layout`]: the reflector the GC uses to find references
//! - [`engine`]: allocator, object index, commit/rollback, GC
//! - [`database`]: thread-safe API, transactions, configuration
//! - [`listener`]: observability hooks

pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod layout;
pub mod listener;
pub mod storage;

/// Object id. Ids below [`config::FIRST_USER_ID`] are reserved.
pub type Oid = u32;

pub use database::{Database, DatabaseBuilder, StorageConfig, Transaction, TransactionMode};
pub use engine::Record;
pub use error::StorageError;
pub use layout::{ObjectLayout, ShapeLayout, TypeShape};
pub use listener::StorageListener;
pub use storage::{MemoryFile, MmapFile, StorageFile};
