//! # Object Index
//!
//! Both index copies are flat arrays of 8-byte little-endian slots in file
//! space, reached through the page pool:
//!
//! ```text
//! slot address = root.index + oid * INDEX_ENTRY_SIZE
//! index page   = oid >> HANDLES_PER_PAGE_BITS
//! ```
//!
//! Reads and writes in a transaction go to the shadow copy. Each written slot
//! marks its index page in `dirty_index_pages`, which commit and rollback use
//! to move only the pages that changed between the two copies.
//!
//! ## Free-Id List
//!
//! Released ids form a singly linked list threaded through the slots
//! themselves, headed by the shadow root's `free_list`:
//!
//! ```text
//! free_list ─> slot[a] = b << FLAGS_BITS | FREE ─> slot[b] = 0 << FLAGS_BITS | FREE
//! ```
//!
//! ## Growth
//!
//! When every slot is handed out, the shadow index moves to fresh storage of
//! twice the size. The old working storage is released at once; commit
//! releases the old committed storage.

use eyre::{bail, Result};

use super::{align_up, Engine};
use crate::config::{
    BITMAP_ID, BITMAP_PAGES, FLAGS_BITS, FLAGS_MASK, FREE_HANDLE_FLAG, HANDLES_PER_PAGE,
    HANDLES_PER_PAGE_BITS, INDEX_ENTRY_SIZE, INVALID_ID,
};
use crate::error::StorageError;
use crate::Oid;

fn le_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; INDEX_ENTRY_SIZE];
    raw.copy_from_slice(&bytes[..INDEX_ENTRY_SIZE]);
    u64::from_le_bytes(raw)
}

pub(crate) fn slot_offset(index: u64, oid: Oid) -> u64 {
    index + oid as u64 * INDEX_ENTRY_SIZE as u64
}

impl Engine {
    fn read_slot(&mut self, index: u64, oid: Oid) -> Result<u64> {
        let mut raw = [0u8; INDEX_ENTRY_SIZE];
        self.pool.read(slot_offset(index, oid), &mut raw)?;
        Ok(le_u64(&raw))
    }

    /// Working entry of `oid`: position and flags.
    pub(crate) fn get_pos(&mut self, oid: Oid) -> Result<u64> {
        if oid == INVALID_ID || oid >= self.current_index_size {
            bail!(StorageError::InvalidObjectId(oid));
        }
        let index = self.header.shadow().index();
        self.read_slot(index, oid)
    }

    pub(crate) fn set_pos(&mut self, oid: Oid, value: u64) -> Result<()> {
        self.dirty_index_pages.insert(oid >> HANDLES_PER_PAGE_BITS);
        let index = self.header.shadow().index();
        self.pool
            .write(slot_offset(index, oid), &value.to_le_bytes())
    }

    /// Entry of `oid` in the committed index.
    pub(crate) fn committed_pos(&mut self, oid: Oid) -> Result<u64> {
        if oid == INVALID_ID || oid >= self.committed_index_size {
            bail!(StorageError::InvalidObjectId(oid));
        }
        let index = self.header.committed().index();
        self.read_slot(index, oid)
    }

    /// Hands out an object id whose working slot is zero.
    pub fn allocate_id(&mut self) -> Result<Oid> {
        self.set_dirty()?;

        if self.reuse_oid {
            let head = self.header.shadow().free_list();
            if head != 0 {
                let entry = self.get_pos(head)?;
                let next = (entry >> FLAGS_BITS) as Oid;
                self.header.shadow_mut().set_free_list(next);
                self.set_pos(head, 0)?;
                return Ok(head);
            }
        }

        if self.current_index_size >= self.max_object_oid {
            bail!(StorageError::NotEnoughSpace);
        }
        if self.current_index_size >= self.header.shadow().index_size() {
            self.grow_index()?;
        }

        let oid = self.current_index_size;
        self.current_index_size += 1;
        self.header.shadow_mut().set_index_used(self.current_index_size);
        self.set_pos(oid, 0)?;
        Ok(oid)
    }

    /// Pushes `oid` onto the free-id list.
    pub(crate) fn free_id(&mut self, oid: Oid) -> Result<()> {
        let head = self.header.shadow().free_list();
        self.set_pos(oid, ((head as u64) << FLAGS_BITS) | FREE_HANDLE_FLAG)?;
        self.header.shadow_mut().set_free_list(oid);
        Ok(())
    }

    /// Takes a released `oid` back off the free-id list and zeroes its slot.
    /// Ids released after it may sit in front of it.
    pub(crate) fn reclaim_id(&mut self, oid: Oid) -> Result<()> {
        let mut prev = 0;
        let mut cur = self.header.shadow().free_list();
        while cur != 0 {
            let entry = self.get_pos(cur)?;
            if entry & FREE_HANDLE_FLAG == 0 {
                bail!(StorageError::DatabaseCorrupted(format!(
                    "free-id list reaches live object {}",
                    cur
                )));
            }
            let next = (entry >> FLAGS_BITS) as Oid;
            if cur == oid {
                if prev == 0 {
                    self.header.shadow_mut().set_free_list(next);
                } else {
                    self.set_pos(prev, ((next as u64) << FLAGS_BITS) | FREE_HANDLE_FLAG)?;
                }
                return self.set_pos(oid, 0);
            }
            prev = cur;
            cur = next;
        }
        bail!(StorageError::InvalidObjectId(oid))
    }

    fn grow_index(&mut self) -> Result<()> {
        let old_size = self.header.shadow().index_size();
        let cap = self.max_object_oid.next_multiple_of(HANDLES_PER_PAGE);
        let new_size = old_size.saturating_mul(2).min(cap);
        if new_size <= self.current_index_size {
            bail!(StorageError::NotEnoughSpace);
        }

        let new_bytes = new_size as u64 * INDEX_ENTRY_SIZE as u64;
        let new_index = self.allocate(new_bytes, 0)?;

        // allocating may have relocated the index already (bitmap extension)
        if self.current_index_size < self.header.shadow().index_size() {
            return self.free(new_index, new_bytes);
        }

        let old_index = self.header.shadow().index();
        let used = self.current_index_size as u64 * INDEX_ENTRY_SIZE as u64;
        self.pool.copy(new_index, old_index, used)?;

        let shadow = self.header.shadow_mut();
        shadow.set_index(new_index);
        shadow.set_index_size(new_size);

        self.free(old_index, old_size as u64 * INDEX_ENTRY_SIZE as u64)?;
        tracing::debug!(old_size, new_size, "object index grown");
        Ok(())
    }

    /// Index slot of bitmap page `page`.
    pub(crate) fn bitmap_page_id(&self, page: u32) -> Oid {
        if page < BITMAP_PAGES {
            BITMAP_ID + page
        } else {
            self.header.shadow().bitmap_extent() + page - BITMAP_PAGES
        }
    }

    pub(crate) fn bitmap_page_count(&self) -> u32 {
        self.header.shadow().bitmap_end() - BITMAP_ID
    }

    /// Working position of bitmap page `page`.
    pub(crate) fn bitmap_page_pos(&mut self, page: u32) -> Result<u64> {
        let oid = self.bitmap_page_id(page);
        Ok(self.get_pos(oid)? & !FLAGS_MASK)
    }

    /// Bytes spanned by the first `slots` index slots, rounded to whole pages.
    pub(crate) fn index_span(slots: u32) -> u64 {
        align_up(
            slots as u64 * INDEX_ENTRY_SIZE as u64,
            crate::config::PAGE_SIZE as u64,
        )
    }
}
