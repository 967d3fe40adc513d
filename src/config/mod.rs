//! # Configuration Module
//!
//! Numeric layout constants shared by the storage, engine and database layers.
//! They are kept in one place because most of them are derived from each
//! other; see [`constants`] for the dependency graph.
//!
//! Runtime settings (cache sizes, GC threshold, file flags) live in
//! [`crate::database::StorageConfig`].

pub mod constants;
pub use constants::*;
