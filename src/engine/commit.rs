//! # Commit, Rollback and Recovery
//!
//! ## Commit Sequence
//!
//! ```text
//! 1. merge_grown_index   give a grown shadow index its own twin storage
//! 2. free_superseded     release old copies of every changed slot
//!                        (and the old committed index, if it was replaced)
//! 3. clear MODIFIED      on every slot of every dirty index page
//! 4. publish_header      write + flush, flip curr, write + flush
//! 5. converge_shadow     new shadow root/index := new committed root/index
//! ```
//!
//! Steps 1-3 only touch storage that the committed root does not reference
//! (private bitmap copies, the shadow index), so a crash before the second
//! flush of step 4 leaves the previous commit intact. The flip is a single
//! write of page 0.
//!
//! ## Recovery
//!
//! A dirty header at open means the last session ended without `close()`.
//! The committed root is authoritative; the shadow root and shadow index are
//! rebuilt from it exactly as step 5 would.

use eyre::{Result, WrapErr};
use tracing::info;

use super::Engine;
use crate::config::{
    FLAGS_MASK, FREE_HANDLE_FLAG, HANDLES_PER_PAGE, INDEX_ENTRY_SIZE, MODIFIED_FLAG,
    PAGE_OBJECT_FLAG, PAGE_SIZE,
};
use crate::storage::RECORD_HEADER_SIZE;

fn slots_of(page: &[u8]) -> impl Iterator<Item = u64> + '_ {
    page.chunks_exact(INDEX_ENTRY_SIZE).map(|raw| {
        let mut bytes = [0u8; INDEX_ENTRY_SIZE];
        bytes.copy_from_slice(raw);
        u64::from_le_bytes(bytes)
    })
}

impl Engine {
    /// Makes the working state durable. Returns `false` when there was
    /// nothing to commit.
    pub fn commit(&mut self) -> Result<bool> {
        if !self.modified {
            return Ok(false);
        }

        let replaced = self
            .merge_grown_index()
            .wrap_err("failed to reallocate object index")?;
        self.free_superseded()?;
        if let Some((index, bytes)) = replaced {
            self.free(index, bytes)?;
        }
        self.clear_modified_flags()?;
        self.publish_header().wrap_err("failed to publish header")?;
        self.converge_shadow()?;

        self.allocated_delta = 0;
        self.gc_done = false;
        self.modified = false;

        let transaction_id = self.header.transaction_id();
        if let Some(listener) = &self.listener {
            listener.on_transaction_commit(transaction_id);
        }
        info!(
            transaction_id,
            objects = self.current_index_size,
            used = self.used_size,
            "transaction committed"
        );
        Ok(true)
    }

    /// Allocates twin storage for a grown shadow index. Returns the extent
    /// of the committed index, which the new commit no longer needs.
    fn merge_grown_index(&mut self) -> Result<Option<(u64, u64)>> {
        let committed = *self.header.committed();
        if self.header.shadow().index_size() <= committed.index_size() {
            return Ok(None);
        }

        let old_bytes = committed.index_size() as u64 * INDEX_ENTRY_SIZE as u64;
        self.clone_bitmap(committed.index(), old_bytes)?;

        loop {
            let slots = self.header.shadow().index_size();
            let bytes = slots as u64 * INDEX_ENTRY_SIZE as u64;
            let pos = self.allocate(bytes, 0)?;
            if self.header.shadow().index_size() == slots {
                let shadow = self.header.shadow_mut();
                shadow.set_shadow_index(pos);
                shadow.set_shadow_index_size(slots);
                break;
            }
            self.free(pos, bytes)?;
        }

        Ok(Some((committed.index(), old_bytes)))
    }

    fn free_superseded(&mut self) -> Result<()> {
        let committed = *self.header.committed();
        let shadow_size = self.header.shadow().size();
        let dirty = self.dirty_index_pages.clone();
        let mut old_page = [0u8; PAGE_SIZE];
        let mut new_page = [0u8; PAGE_SIZE];

        for page in dirty.iter() {
            let first = page * HANDLES_PER_PAGE;
            if first >= self.committed_index_size {
                break;
            }
            let slots = (self.committed_index_size - first).min(HANDLES_PER_PAGE) as usize;
            let offset = page as u64 * PAGE_SIZE as u64;
            let len = slots * INDEX_ENTRY_SIZE;
            self.pool.read(committed.index() + offset, &mut old_page[..len])?;
            let shadow_index = self.header.shadow().index();
            self.pool.read(shadow_index + offset, &mut new_page[..len])?;

            let changes: Vec<u64> = slots_of(&old_page[..len])
                .zip(slots_of(&new_page[..len]))
                .filter(|&(old, new)| {
                    old & FREE_HANDLE_FLAG == 0
                        && old & !FLAGS_MASK != 0
                        && new & !MODIFIED_FLAG != old
                        && old & !FLAGS_MASK < shadow_size
                })
                .map(|(old, _)| old)
                .collect();

            for old in changes {
                let pos = old & !FLAGS_MASK;
                let size = if old & PAGE_OBJECT_FLAG != 0 {
                    PAGE_SIZE as u64
                } else {
                    let mut prefix = [0u8; RECORD_HEADER_SIZE];
                    self.pool.read(pos, &mut prefix)?;
                    self.layout.size_of(&prefix)?
                };
                self.free(pos, size)?;
            }
        }
        Ok(())
    }

    fn clear_modified_flags(&mut self) -> Result<()> {
        let index = self.header.shadow().index();
        let mut page_buf = [0u8; PAGE_SIZE];

        for page in self.dirty_index_pages.iter() {
            let first = page * HANDLES_PER_PAGE;
            if first >= self.current_index_size {
                break;
            }
            let slots = (self.current_index_size - first).min(HANDLES_PER_PAGE) as usize;
            let len = slots * INDEX_ENTRY_SIZE;
            let at = index + page as u64 * PAGE_SIZE as u64;

            self.pool.read(at, &mut page_buf[..len])?;
            for raw in page_buf[..len].chunks_exact_mut(INDEX_ENTRY_SIZE) {
                raw[0] &= !(MODIFIED_FLAG as u8);
            }
            self.pool.write(at, &page_buf[..len])?;
        }
        Ok(())
    }

    fn publish_header(&mut self) -> Result<()> {
        self.write_header()?;
        self.pool.flush()?;

        self.header.flip();
        self.header.set_dirty(true);
        self.header.bump_transaction_id();
        self.write_header()?;
        self.pool.flush()
    }

    /// Brings the new shadow root and shadow index in line with the root that
    /// was just committed.
    fn converge_shadow(&mut self) -> Result<()> {
        let (committed, shadow) = self.header.roots_mut();
        let committed = *committed;
        let reallocated = shadow.index_size() != committed.index_size();
        shadow.mirror_scalars(&committed);

        if reallocated {
            shadow.cross_index(&committed);
            let bytes = self.current_index_size as u64 * INDEX_ENTRY_SIZE as u64;
            self.pool
                .copy(committed.shadow_index(), committed.index(), bytes)?;
        } else {
            self.copy_dirty_index_pages(committed.shadow_index(), committed.index())?;
        }

        self.dirty_index_pages.clear();
        self.committed_index_size = self.current_index_size;
        Ok(())
    }

    fn copy_dirty_index_pages(&mut self, dst: u64, src: u64) -> Result<()> {
        let total = self.current_index_size as u64 * INDEX_ENTRY_SIZE as u64;
        for page in self.dirty_index_pages.iter() {
            let offset = page as u64 * PAGE_SIZE as u64;
            if offset >= total {
                break;
            }
            let len = (total - offset).min(PAGE_SIZE as u64);
            self.pool.copy(dst + offset, src + offset, len)?;
        }
        Ok(())
    }

    /// Discards the working state. Returns `false` when there was nothing to
    /// roll back.
    pub fn rollback(&mut self) -> Result<bool> {
        if !self.modified {
            return Ok(false);
        }

        let committed = *self.header.committed();
        self.current_index_size = self.committed_index_size;
        if self.header.shadow().index() != committed.shadow_index() {
            let bytes = Self::index_span(committed.index_used());
            self.pool
                .copy(committed.shadow_index(), committed.index(), bytes)?;
        } else {
            self.copy_dirty_index_pages(committed.shadow_index(), committed.index())?;
        }

        let shadow = self.header.shadow_mut();
        shadow.cross_index(&committed);
        shadow.mirror_scalars(&committed);

        self.dirty_index_pages.clear();
        self.reset_allocator();
        self.recount_used_size()?;
        self.objects.clear();
        self.allocated_delta = 0;
        self.gc_done = false;
        self.gc_requested = false;
        self.modified = false;

        if let Some(listener) = &self.listener {
            listener.on_transaction_rollback();
        }
        info!(
            transaction_id = self.header.transaction_id(),
            "transaction rolled back"
        );
        Ok(true)
    }

    /// Rebuilds the shadow root and shadow index from the committed root.
    pub(super) fn recover(&mut self) -> Result<()> {
        let (committed, shadow) = self.header.roots_mut();
        let committed = *committed;
        shadow.mirror_scalars(&committed);
        shadow.cross_index(&committed);

        let bytes = Self::index_span(committed.index_used());
        self.pool
            .copy(committed.shadow_index(), committed.index(), bytes)
            .wrap_err("failed to rebuild shadow index")?;
        self.write_header()?;
        self.pool.flush()?;

        if let Some(listener) = &self.listener {
            listener.recovery_completed();
        }
        info!(
            transaction_id = self.header.transaction_id(),
            "recovered from unclean shutdown"
        );
        Ok(())
    }
}
