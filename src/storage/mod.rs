//! # Storage Module
//!
//! The page store: everything below the engine that deals with bytes rather
//! than objects.
//!
//! ## Architecture Overview
//!
//! ```text
//! engine
//!   │  page(pos) / page_mut(pos) / read / write / copy / flush
//!   ▼
//! PagePool (SIEVE frames, write-back on evict and flush)
//!   │  read_page / write_page / sync
//!   ▼
//! StorageFile ── MmapFile   (memmap2, on-disk database file)
//!             └─ MemoryFile (shared in-memory image, crash simulation)
//! ```
//!
//! The page pool hands out borrowed slices, so the borrow checker guarantees
//! that no page reference survives a call that could evict or remap.
//!
//! ## File Format
//!
//! ```text
//! Offset 0:      page 0   DatabaseHeader (123 bytes) + unused
//! Offset 4096:   object index copy A
//! ...            object index copy B
//! ...            bitmap pages, records, page objects (allocator managed)
//! ```
//!
//! Only page 0 is ever updated in place. Everything else is placed by the
//! bitmap allocator and reached through the object index.
//!
//! ## Module Organization
//!
//! - `file`: `StorageFile` trait
//! - `mmap`: memory-mapped on-disk file
//! - `memory`: in-memory image with write limits for crash tests
//! - `cache`: `PagePool`, the SIEVE page cache
//! - `headers`: `DatabaseHeader` / `RootPage` (zerocopy)
//! - `record`: `RecordHeader` prefix of every stored object

mod cache;
mod file;
mod headers;
mod memory;
mod mmap;
mod record;

pub use cache::PagePool;
pub use file::StorageFile;
pub use headers::{DatabaseHeader, RootPage, HEADER_SIZE, ROOT_PAGE_SIZE};
pub use memory::MemoryFile;
pub use mmap::MmapFile;
pub use record::{RecordHeader, RECORD_HEADER_SIZE};
