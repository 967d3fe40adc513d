//! # Storage Error Kinds
//!
//! Every fallible operation in this crate returns `eyre::Result`. Failures that
//! callers are expected to branch on are raised as a [`StorageError`] value via
//! `bail!`, and can be recovered from the report:
//!
//! ```ignore
//! match db.load(oid) {
//!     Err(report) => match report.downcast_ref::<StorageError>() {
//!         Some(StorageError::DeletedObject(_)) => { /* gone */ }
//!         _ => return Err(report),
//!     },
//!     Ok(record) => { /* ... */ }
//! }
//! ```
//!
//! Context attached with `wrap_err` does not hide the kind; `downcast_ref`
//! looks through it.

use crate::Oid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The database was closed or never opened.
    NotOpened,
    /// Id is zero, outside the index, or names a slot of the wrong kind.
    InvalidObjectId(Oid),
    /// Slot is on the free-id list.
    DeletedObject(Oid),
    /// The bitmap or the object index cannot grow any further.
    NotEnoughSpace,
    /// Header or index structures failed validation.
    DatabaseCorrupted(String),
    /// Operation not permitted in the current mode or configuration.
    InvalidOperation(&'static str),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::NotOpened => write!(f, "database is not opened"),
            StorageError::InvalidObjectId(oid) => write!(f, "invalid object id {}", oid),
            StorageError::DeletedObject(oid) => {
                write!(f, "object {} was deleted", oid)
            }
            StorageError::NotEnoughSpace => {
                write!(f, "not enough space: storage address range exhausted")
            }
            StorageError::DatabaseCorrupted(reason) => {
                write!(f, "database file is corrupted: {}", reason)
            }
            StorageError::InvalidOperation(what) => write!(f, "invalid operation: {}", what),
        }
    }
}

impl std::error::Error for StorageError {}

/// Returns the storage error kind carried by a report, if any.
pub fn error_kind(report: &eyre::Report) -> Option<&StorageError> {
    report.downcast_ref::<StorageError>()
}
