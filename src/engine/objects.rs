//! # Object Operations
//!
//! Records and page objects as seen by applications. Every operation resolves
//! the object id through the working index and follows the copy-on-write
//! rules of the transaction:
//!
//! ```text
//!                    slot not MODIFIED           slot MODIFIED
//! store             allocate new copy,           rewrite in place, grow by
//!                   protect old range            reallocation, shrink by
//!                                                freeing the tail
//! deallocate        protect old range,           free at once
//!                   commit frees it
//! write_page        put_page: relocate once      write in place
//! ```
//!
//! Decoded records are kept in a small SIEVE cache keyed by object id. It is
//! cleared on rollback, since the records it holds may belong to the working
//! state.

use std::sync::Arc;

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use zerocopy::IntoBytes;

use super::{align_up, Engine};
use crate::config::{
    ALLOCATION_QUANTUM, FIRST_USER_ID, FLAGS_MASK, FREE_HANDLE_FLAG, MODIFIED_FLAG,
    PAGE_OBJECT_FLAG, PAGE_SIZE,
};
use crate::error::StorageError;
use crate::storage::{RecordHeader, RECORD_HEADER_SIZE};
use crate::Oid;

/// A loaded record: its type tag and body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub type_id: u32,
    pub body: Arc<[u8]>,
}

struct CacheEntry {
    oid: Oid,
    visited: bool,
    record: Record,
}

pub(crate) struct ObjectCache {
    entries: Vec<CacheEntry>,
    index: HashMap<Oid, usize>,
    hand: usize,
    capacity: usize,
}

impl ObjectCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            index: HashMap::with_capacity(capacity),
            hand: 0,
            capacity,
        }
    }

    pub fn get(&mut self, oid: Oid) -> Option<Record> {
        let idx = *self.index.get(&oid)?;
        let entry = &mut self.entries[idx];
        entry.visited = true;
        Some(entry.record.clone())
    }

    pub fn insert(&mut self, oid: Oid, record: Record) {
        if self.capacity == 0 {
            return;
        }
        if let Some(&idx) = self.index.get(&oid) {
            self.entries[idx].record = record;
            self.entries[idx].visited = true;
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict();
        }
        self.index.insert(oid, self.entries.len());
        self.entries.push(CacheEntry {
            oid,
            visited: false,
            record,
        });
    }

    pub fn remove(&mut self, oid: Oid) {
        if let Some(idx) = self.index.remove(&oid) {
            self.remove_at(idx);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.hand = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn evict(&mut self) {
        loop {
            let idx = self.hand % self.entries.len();
            let entry = &mut self.entries[idx];
            if entry.visited {
                entry.visited = false;
                self.hand = idx + 1;
                continue;
            }
            let oid = entry.oid;
            self.index.remove(&oid);
            self.remove_at(idx);
            return;
        }
    }

    fn remove_at(&mut self, idx: usize) {
        self.entries.swap_remove(idx);
        if let Some(moved) = self.entries.get(idx) {
            self.index.insert(moved.oid, idx);
        }
        if self.hand >= self.entries.len() {
            self.hand = 0;
        }
    }
}

impl Engine {
    fn check_user_oid(oid: Oid) -> Result<()> {
        if oid < FIRST_USER_ID {
            bail!(StorageError::InvalidObjectId(oid));
        }
        Ok(())
    }

    /// Reads the whole record stored at `pos`.
    pub(crate) fn read_record(&mut self, pos: u64) -> Result<Vec<u8>> {
        let size = self.record_size(pos)?;
        let mut record = vec![0u8; size as usize];
        self.pool.read(pos, &mut record)?;
        Ok(record)
    }

    fn record_size(&mut self, pos: u64) -> Result<u64> {
        let mut prefix = [0u8; RECORD_HEADER_SIZE];
        self.pool.read(pos, &mut prefix)?;
        let size = self.layout.size_of(&prefix)?;
        ensure!(
            size >= RECORD_HEADER_SIZE as u64 && pos + size <= self.header.shadow().size(),
            StorageError::DatabaseCorrupted(format!("record at {} has size {}", pos, size))
        );
        Ok(size)
    }

    /// Writes a new version of record `oid`.
    pub fn store(&mut self, oid: Oid, type_id: u32, body: &[u8]) -> Result<()> {
        Self::check_user_oid(oid)?;
        let size = (RECORD_HEADER_SIZE + body.len()) as u64;
        ensure!(size <= u32::MAX as u64, "record of {} bytes is too large", size);

        self.set_dirty()?;
        let entry = self.get_pos(oid)?;
        if entry & FREE_HANDLE_FLAG != 0 {
            bail!(StorageError::DeletedObject(oid));
        }
        if entry & PAGE_OBJECT_FLAG != 0 {
            bail!(StorageError::InvalidObjectId(oid));
        }

        let old = entry & !FLAGS_MASK;
        let quantum = ALLOCATION_QUANTUM as u64;
        let pos = if entry & MODIFIED_FLAG != 0 {
            let old_size = align_up(self.record_size(old)?, quantum);
            let new_size = align_up(size, quantum);
            if new_size > old_size {
                let pos = self.allocate(size, 0)?;
                self.free(old, old_size)?;
                pos
            } else {
                if new_size < old_size {
                    self.free(old + new_size, old_size - new_size)?;
                }
                old
            }
        } else {
            let pos = self.allocate(size, 0)?;
            if self.get_pos(oid)? & FREE_HANDLE_FLAG != 0 {
                self.free(pos, size)?;
                bail!(StorageError::DeletedObject(oid));
            }
            if old != 0 {
                let old_size = self.record_size(old)?;
                self.clone_bitmap(old, old_size)?;
            }
            pos
        };

        self.set_pos(oid, pos | MODIFIED_FLAG)?;
        let header = RecordHeader::new(size as u32, type_id);
        self.pool.write(pos, header.as_bytes())?;
        self.pool.write(pos + RECORD_HEADER_SIZE as u64, body)?;

        self.objects.insert(
            oid,
            Record {
                type_id,
                body: Arc::from(body),
            },
        );
        Ok(())
    }

    pub fn load(&mut self, oid: Oid) -> Result<Record> {
        Self::check_user_oid(oid)?;
        if let Some(record) = self.objects.get(oid) {
            return Ok(record);
        }

        let entry = self.get_pos(oid)?;
        if entry & FREE_HANDLE_FLAG != 0 {
            bail!(StorageError::DeletedObject(oid));
        }
        let pos = entry & !FLAGS_MASK;
        if entry & PAGE_OBJECT_FLAG != 0 || pos == 0 {
            bail!(StorageError::InvalidObjectId(oid));
        }

        let bytes = self.read_record(pos)?;
        let header = RecordHeader::from_bytes(&bytes)?;
        let record = Record {
            type_id: header.type_id(),
            body: Arc::from(&bytes[RECORD_HEADER_SIZE..]),
        };
        self.objects.insert(oid, record.clone());
        Ok(record)
    }

    /// Deletes record `oid` and releases its id.
    pub fn deallocate(&mut self, oid: Oid) -> Result<()> {
        Self::check_user_oid(oid)?;
        self.set_dirty()?;
        let entry = self.get_pos(oid)?;
        if entry & FREE_HANDLE_FLAG != 0 {
            bail!(StorageError::DeletedObject(oid));
        }
        if entry & PAGE_OBJECT_FLAG != 0 {
            bail!(StorageError::InvalidObjectId(oid));
        }

        let pos = entry & !FLAGS_MASK;
        if pos != 0 {
            let size = self.record_size(pos)?;
            if entry & MODIFIED_FLAG != 0 {
                self.free(pos, size)?;
            } else {
                self.clone_bitmap(pos, size)?;
            }
        }
        self.free_id(oid)?;
        self.objects.remove(oid);
        Ok(())
    }

    /// Allocates a zeroed page object.
    pub fn allocate_page(&mut self) -> Result<Oid> {
        let oid = self.allocate_id()?;
        let pos = self.allocate(PAGE_SIZE as u64, 0)?;
        self.pool.zero(pos, PAGE_SIZE as u64)?;
        self.set_pos(oid, pos | PAGE_OBJECT_FLAG | MODIFIED_FLAG)?;
        Ok(oid)
    }

    fn page_entry(&mut self, oid: Oid) -> Result<u64> {
        Self::check_user_oid(oid)?;
        let entry = self.get_pos(oid)?;
        if entry & FREE_HANDLE_FLAG != 0 {
            bail!(StorageError::DeletedObject(oid));
        }
        if entry & PAGE_OBJECT_FLAG == 0 {
            bail!(StorageError::InvalidObjectId(oid));
        }
        Ok(entry)
    }

    pub fn read_page(&mut self, oid: Oid) -> Result<Vec<u8>> {
        let entry = self.page_entry(oid)?;
        Ok(self.pool.page(entry & !FLAGS_MASK)?.to_vec())
    }

    /// Overwrites the start of page object `oid` with `data`.
    pub fn write_page(&mut self, oid: Oid, data: &[u8]) -> Result<()> {
        ensure!(
            data.len() <= PAGE_SIZE,
            "page data of {} bytes exceeds the page size",
            data.len()
        );
        self.page_entry(oid)?;
        let pos = self.put_page(oid)?;
        self.pool.page_mut(pos)?[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn free_page(&mut self, oid: Oid) -> Result<()> {
        let entry = self.page_entry(oid)?;
        self.set_dirty()?;
        let pos = entry & !FLAGS_MASK;
        if entry & MODIFIED_FLAG != 0 {
            self.free(pos, PAGE_SIZE as u64)?;
        } else {
            self.clone_bitmap(pos, PAGE_SIZE as u64)?;
        }
        self.free_id(oid)
    }

    pub fn root(&self) -> Oid {
        self.header.shadow().root_object()
    }

    pub fn set_root(&mut self, oid: Oid) -> Result<()> {
        self.set_dirty()?;
        self.header.shadow_mut().set_root_object(oid);
        Ok(())
    }

    /// Head of the schema (class descriptor) list.
    pub fn schema_root(&self) -> Oid {
        self.header.shadow().class_desc_list()
    }

    pub fn set_schema_root(&mut self, oid: Oid) -> Result<()> {
        self.set_dirty()?;
        self.header.shadow_mut().set_class_desc_list(oid);
        Ok(())
    }

    /// Working version of record `oid`, `None` while the id was allocated
    /// but never written.
    pub(crate) fn prior_version(&mut self, oid: Oid) -> Result<Option<Record>> {
        Self::check_user_oid(oid)?;
        let entry = self.get_pos(oid)?;
        if entry & FREE_HANDLE_FLAG != 0 {
            bail!(StorageError::DeletedObject(oid));
        }
        if entry & PAGE_OBJECT_FLAG != 0 {
            bail!(StorageError::InvalidObjectId(oid));
        }
        if entry & !FLAGS_MASK == 0 {
            return Ok(None);
        }
        self.load(oid).map(Some)
    }

    /// Returns `oid` to the allocated-but-unwritten state. Only a copy made
    /// in this transaction can be dropped this way.
    pub(crate) fn clear_record(&mut self, oid: Oid) -> Result<()> {
        Self::check_user_oid(oid)?;
        let entry = self.get_pos(oid)?;
        ensure!(
            entry & (FREE_HANDLE_FLAG | PAGE_OBJECT_FLAG) == 0 && entry & MODIFIED_FLAG != 0,
            StorageError::InvalidOperation("only records written in this transaction can be cleared")
        );

        let pos = entry & !FLAGS_MASK;
        let size = self.record_size(pos)?;
        self.free(pos, size)?;
        self.set_pos(oid, 0)?;
        self.objects.remove(oid);
        Ok(())
    }
}
