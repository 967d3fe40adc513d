//! # Bitmap Allocator
//!
//! File space is handed out in quanta of `ALLOCATION_QUANTUM` bytes. One bit
//! per quantum lives in the bitmap pages, which are ordinary page objects
//! reached through the reserved index slots `BITMAP_ID..`:
//!
//! ```text
//! bitmap page k  ─ covers file bytes [k << 20, (k + 1) << 20)
//! bit b of page  ─ quantum (k << 15) + b
//! ```
//!
//! ## Search
//!
//! ```text
//!   cursor                                  bitmap_end
//!     │ pass 1: cursor .. end                   │
//!     ▼─────────────────────────────────────────▶
//! ◀───┘ pass 2: 0 .. cursor page
//!     │
//!     └─ both fail: GC once (if configured), else extend the file
//! ```
//!
//! Page-multiple sizes keep their own cursor and only accept page-aligned
//! holes. Each bitmap page carries a space hint, an upper bound on its
//! largest hole; pages whose hint is too small are skipped unread.
//!
//! ## Re-entrancy
//!
//! Setting bits in a bitmap page that was not yet modified in this
//! transaction relocates that page, which itself allocates. The range being
//! claimed is kept on the reservation chain until its bits are set, so nested
//! searches step over it. Clearing a range that the committed state still
//! uses never happens in place: `clone_bitmap` first gives every covering
//! bitmap page a private copy, queueing the old copies instead of recursing.

use eyre::{bail, ensure, Result};
use tracing::debug;

use super::holes::{scan_aligned, scan_unaligned, update_bits, HoleQuery, HoleScan};
use super::{align_up, Engine};
use crate::config::{
    ALLOCATION_QUANTUM, ALLOCATION_QUANTUM_BITS, ALLOC_RECURSION_LIMIT, BITMAP_ID, BITMAP_PAGES,
    BITMAP_SEGMENT_BITS, BITMAP_SEGMENT_SIZE, BITS_PER_BITMAP_PAGE, FLAGS_MASK, FREE_HANDLE_FLAG,
    HANDLES_PER_PAGE, INDEX_ENTRY_SIZE, LARGE_BITMAP_PAGES, MODIFIED_FLAG,
    PAGE_ALIGNED_BITMAP_STEP, PAGE_OBJECT_FLAG, PAGE_SIZE,
};
use crate::error::StorageError;
use crate::Oid;

const QUANTA_PER_PAGE: u64 = (PAGE_SIZE >> ALLOCATION_QUANTUM_BITS) as u64;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cursor {
    pub page: u32,
    pub offset: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Cursors {
    pub aligned: Cursor,
    pub unaligned: Cursor,
}

enum Search {
    Found { pos: u64, cursor: Cursor },
    Failed { hole_bits: u64 },
}

impl Engine {
    /// Claims `size` bytes of file space. With `oid != 0` the object's current
    /// content is moved to the new location and its slot updated.
    pub(crate) fn allocate(&mut self, size: u64, oid: Oid) -> Result<u64> {
        self.set_dirty()?;
        ensure!(size > 0, "zero-sized allocation");
        let size = align_up(size, ALLOCATION_QUANTUM as u64);

        if let Some(threshold) = self.gc_threshold {
            if self.allocated_delta > threshold && !self.gc_active {
                self.gc_requested = true;
            }
        }

        let pos = self.find_space(size, oid)?;
        self.used_size += size;
        self.allocated_delta += size;
        Ok(pos)
    }

    /// Searches the bitmap for `size` aligned bytes, running GC once or
    /// extending the file when nothing fits. Leaves the counters to the caller.
    fn find_space(&mut self, size: u64, oid: Oid) -> Result<u64> {
        let obj_bits = size >> ALLOCATION_QUANTUM_BITS;
        let aligned = size % PAGE_SIZE as u64 == 0;
        let cursor = if aligned {
            self.cursors.aligned
        } else {
            self.cursors.unaligned
        };

        let page_count = self.bitmap_page_count();
        let deep = self.reserved.len() > ALLOC_RECURSION_LIMIT;
        let (mut first_page, mut offset) = if deep {
            (page_count - 1, 0)
        } else if cursor.page >= page_count {
            (0, 0)
        } else if aligned {
            (
                cursor.page,
                cursor.offset.next_multiple_of(PAGE_ALIGNED_BITMAP_STEP),
            )
        } else {
            (cursor.page, cursor.offset)
        };
        let mut last_page = page_count;
        let mut tail_hole = 0;

        loop {
            match self.search(first_page, last_page, offset, aligned, obj_bits, size)? {
                Search::Found { pos, cursor } => {
                    if aligned {
                        self.cursors.aligned = cursor;
                    } else {
                        self.cursors.unaligned = cursor;
                    }
                    self.claim(pos, size, oid)?;
                    return Ok(pos);
                }
                Search::Failed { hole_bits } => {
                    if last_page == page_count {
                        tail_hole = hole_bits;
                    }
                }
            }

            if first_page == 0 || deep {
                break;
            }
            last_page = first_page + 1;
            first_page = 0;
            offset = 0;
        }

        if self.gc_threshold.is_some()
            && !self.gc_done
            && !self.gc_active
            && self.reserved.is_empty()
            && !self.inside_clone
        {
            self.collect()?;
            self.cursors = Cursors::default();
            return self.find_space(size, oid);
        }

        self.allocate_past_end(page_count, tail_hole, size, oid)
    }

    fn search(
        &mut self,
        first_page: u32,
        last_page: u32,
        mut offset: usize,
        aligned: bool,
        obj_bits: u64,
        size: u64,
    ) -> Result<Search> {
        let mut hole_bits = 0;

        for page in first_page..last_page {
            let needed = if obj_bits - hole_bits < BITS_PER_BITMAP_PAGE {
                obj_bits - hole_bits
            } else {
                0
            };
            let hint = self.bitmap_space.get(page as usize).copied().unwrap_or(u32::MAX);
            if (hint as u64) <= needed {
                hole_bits = 0;
                offset = 0;
                continue;
            }

            let start = offset;
            let at = self.bitmap_page_pos(page)?;
            let query = HoleQuery {
                page,
                obj_bits,
                size,
                hole_bits,
            };
            let data = self.pool.page(at)?;
            let scan = if aligned {
                scan_aligned(data, offset, query, &self.reserved)
            } else {
                scan_unaligned(data, offset, query, &self.reserved)
            };

            match scan {
                HoleScan::Found { pos, offset } => {
                    return Ok(Search::Found {
                        pos,
                        cursor: Cursor { page, offset },
                    });
                }
                HoleScan::Exhausted { hole_bits: trailing } => {
                    if start == 0 && trailing == 0 && needed < hint as u64 {
                        if let Some(slot) = self.bitmap_space.get_mut(page as usize) {
                            *slot = needed as u32;
                        }
                    }
                    hole_bits = trailing;
                }
            }
            offset = 0;
        }

        Ok(Search::Failed { hole_bits })
    }

    /// Marks `[pos, pos + size)` allocated, moving `oid` there if non-zero.
    fn claim(&mut self, pos: u64, size: u64, oid: Oid) -> Result<()> {
        self.reserved.push(pos, size);
        let result = self.extend_to(pos + size);
        let result = result.and_then(|_| {
            if oid != 0 {
                self.relocate(oid, pos, size)?;
            }
            self.update_bitmap(pos, size, true)
        });
        self.reserved.pop();
        result
    }

    fn extend_to(&mut self, end: u64) -> Result<()> {
        let shadow = self.header.shadow_mut();
        if end > shadow.size() {
            shadow.set_size(end);
        }
        Ok(())
    }

    fn relocate(&mut self, oid: Oid, pos: u64, size: u64) -> Result<()> {
        let entry = self.get_pos(oid)?;
        if entry & FREE_HANDLE_FLAG != 0 {
            bail!(StorageError::DeletedObject(oid));
        }
        let old = entry & !FLAGS_MASK;
        if old != 0 {
            self.pool.copy(pos, old, size)?;
        }
        self.set_pos(oid, pos | (entry & FLAGS_MASK) | MODIFIED_FLAG)
    }

    /// Sets or clears the bits of `[pos, pos + size)` in the working bitmap.
    fn update_bitmap(&mut self, pos: u64, size: u64, set: bool) -> Result<()> {
        let mut quantum = pos >> ALLOCATION_QUANTUM_BITS;
        let mut remaining = size >> ALLOCATION_QUANTUM_BITS;

        while remaining > 0 {
            let page = (quantum / BITS_PER_BITMAP_PAGE) as u32;
            let first = (quantum % BITS_PER_BITMAP_PAGE) as usize;
            let count = remaining.min(BITS_PER_BITMAP_PAGE - first as u64);

            let at = self.put_bitmap_page(page)?;
            update_bits(self.pool.page_mut(at)?, first, count as usize, set);

            if let Some(hint) = self.bitmap_space.get_mut(page as usize) {
                if !set {
                    *hint = u32::MAX;
                } else if count == BITS_PER_BITMAP_PAGE {
                    *hint = 0;
                }
            }
            quantum += count;
            remaining -= count;
        }
        Ok(())
    }

    /// Returns `[pos, pos + size)` to the working bitmap.
    pub(crate) fn free(&mut self, pos: u64, size: u64) -> Result<()> {
        ensure!(
            pos != 0 && pos % ALLOCATION_QUANTUM as u64 == 0,
            "free of invalid position {}",
            pos
        );
        let size = align_up(size, ALLOCATION_QUANTUM as u64);
        self.used_size = self.used_size.saturating_sub(size);
        self.allocated_delta = self.allocated_delta.saturating_sub(size);

        let page = (pos >> BITMAP_SEGMENT_BITS) as u32;
        let offset = ((pos & ((1 << BITMAP_SEGMENT_BITS) - 1)) >> (ALLOCATION_QUANTUM_BITS + 3))
            as usize;
        let aligned = &mut self.cursors.aligned;
        if pos % PAGE_SIZE as u64 == 0
            && size >= PAGE_SIZE as u64
            && page == aligned.page
            && offset < aligned.offset
        {
            aligned.offset = offset;
        }
        let unaligned = &mut self.cursors.unaligned;
        if page == unaligned.page && offset < unaligned.offset {
            unaligned.offset = offset;
        }

        self.update_bitmap(pos, size, false)
    }

    fn put_bitmap_page(&mut self, page: u32) -> Result<u64> {
        let oid = self.bitmap_page_id(page);
        self.put_page(oid)
    }

    /// Position of a private, writable copy of page object `oid`.
    pub(crate) fn put_page(&mut self, oid: Oid) -> Result<u64> {
        let mut entry = self.get_pos(oid)?;
        if entry & FREE_HANDLE_FLAG != 0 {
            bail!(StorageError::DeletedObject(oid));
        }
        if entry & PAGE_OBJECT_FLAG == 0 {
            bail!(StorageError::InvalidObjectId(oid));
        }
        if entry & MODIFIED_FLAG == 0 {
            self.set_dirty()?;
            let old = entry & !FLAGS_MASK;
            self.allocate(PAGE_SIZE as u64, oid)?;
            self.clone_bitmap(old, PAGE_SIZE as u64)?;
            entry = self.get_pos(oid)?;
        }
        Ok(entry & !FLAGS_MASK)
    }

    /// Gives every bitmap page covering `[pos, pos + size)` a private copy so
    /// that freeing the range later never touches committed bitmap pages.
    pub(crate) fn clone_bitmap(&mut self, pos: u64, size: u64) -> Result<()> {
        if self.inside_clone {
            self.clone_queue.push(pos);
            return Ok(());
        }

        self.inside_clone = true;
        let mut result = self.protect_bitmap_pages(pos, size);
        while result.is_ok() {
            let Some(next) = self.clone_queue.pop() else {
                break;
            };
            result = self.protect_bitmap_pages(next, PAGE_SIZE as u64);
        }
        self.inside_clone = false;
        self.clone_queue.clear();
        result
    }

    fn protect_bitmap_pages(&mut self, pos: u64, size: u64) -> Result<()> {
        let first = (pos >> BITMAP_SEGMENT_BITS) as u32;
        let last = ((pos + size.max(1) - 1) >> BITMAP_SEGMENT_BITS) as u32;
        for page in first..=last {
            let oid = self.bitmap_page_id(page);
            if self.get_pos(oid)? & MODIFIED_FLAG == 0 {
                self.put_page(oid)?;
            }
        }
        Ok(())
    }

    /// Grows the file by whole bitmap segments starting at segment `page`.
    /// `hole_bits` free quanta at the end of the last segment become the
    /// head of the object.
    fn allocate_past_end(&mut self, page: u32, hole_bits: u64, size: u64, oid: Oid) -> Result<u64> {
        let obj_bits = size >> ALLOCATION_QUANTUM_BITS;
        let tail_bits = obj_bits - hole_bits;
        let skip = align_up(tail_bits, QUANTA_PER_PAGE);
        let segment = (page as u64) << BITMAP_SEGMENT_BITS;
        let bitmap_pos = segment + (skip << ALLOCATION_QUANTUM_BITS);
        let net_coverage = BITMAP_SEGMENT_SIZE - PAGE_SIZE as u64;

        let mut extension = size.max(self.extension_quantum);
        let mut more_pages = extension.div_ceil(net_coverage) as u32;
        let needs_extent = self.header.shadow().bitmap_extent() == 0
            && page <= BITMAP_PAGES
            && page + more_pages > BITMAP_PAGES;
        let extent_slots = LARGE_BITMAP_PAGES - BITMAP_PAGES;
        let new_index_size = if needs_extent {
            (self.current_index_size + extent_slots).next_multiple_of(HANDLES_PER_PAGE)
        } else {
            0
        };
        let index_bytes = new_index_size as u64 * INDEX_ENTRY_SIZE as u64;
        if needs_extent {
            extension = (skip << ALLOCATION_QUANTUM_BITS) + index_bytes;
            more_pages = extension.div_ceil(net_coverage) as u32;
        }
        if page + more_pages > LARGE_BITMAP_PAGES {
            bail!(StorageError::NotEnoughSpace);
        }

        let bitmap_bytes = more_pages as u64 * PAGE_SIZE as u64;
        let index_pos = bitmap_pos + bitmap_bytes;
        debug!(page, more_pages, size, needs_extent, "extending database file");

        // Aborted transactions may have left bytes here.
        self.pool.zero(bitmap_pos, bitmap_bytes)?;

        let replaced_index = if needs_extent {
            Some(self.add_bitmap_extent(index_pos, new_index_size)?)
        } else {
            None
        };

        for k in 0..more_pages {
            let id = self.bitmap_page_id(page + k);
            let at = bitmap_pos + k as u64 * PAGE_SIZE as u64;
            self.set_pos(id, at | PAGE_OBJECT_FLAG | MODIFIED_FLAG)?;
        }
        self.header.shadow_mut().set_bitmap_end(page + more_pages + BITMAP_ID);

        let full_pages = (tail_bits / BITS_PER_BITMAP_PAGE) as u32;
        for k in 0..more_pages {
            if let Some(hint) = self.bitmap_space.get_mut((page + k) as usize) {
                *hint = if k < full_pages { 0 } else { u32::MAX };
            }
        }

        self.update_bitmap(segment, tail_bits << ALLOCATION_QUANTUM_BITS, true)?;
        self.update_bitmap(bitmap_pos, bitmap_bytes, true)?;
        if needs_extent {
            self.update_bitmap(index_pos, index_bytes, true)?;
        }
        self.used_size += bitmap_bytes + index_bytes;
        self.extend_to(index_pos + index_bytes)?;

        let cursor = Cursor {
            page: page + full_pages,
            offset: 0,
        };
        if size % PAGE_SIZE as u64 == 0 {
            self.cursors.aligned = cursor;
        } else {
            self.cursors.unaligned = cursor;
        }

        let pos = segment - (hole_bits << ALLOCATION_QUANTUM_BITS);
        self.reserved.push(pos, size);
        let result = (|| -> Result<()> {
            self.extend_to(pos + size)?;
            if oid != 0 {
                self.relocate(oid, pos, size)?;
            }
            if hole_bits > 0 {
                self.update_bitmap(pos, hole_bits << ALLOCATION_QUANTUM_BITS, true)?;
            }
            Ok(())
        })();
        self.reserved.pop();
        result?;

        if let Some((old_index, old_bytes)) = replaced_index {
            self.free(old_index, old_bytes)?;
        }
        Ok(pos)
    }

    /// Moves the working index to `index_pos` with room for the bitmap
    /// extension slots. Returns the old index extent for release.
    fn add_bitmap_extent(&mut self, index_pos: u64, new_index_size: u32) -> Result<(u64, u64)> {
        let old_index = self.header.shadow().index();
        let old_bytes = self.header.shadow().index_size() as u64 * INDEX_ENTRY_SIZE as u64;
        let used = self.current_index_size as u64 * INDEX_ENTRY_SIZE as u64;
        self.pool.copy(index_pos, old_index, used)?;

        let extent = self.current_index_size;
        let slots = LARGE_BITMAP_PAGES - BITMAP_PAGES;
        let free = FREE_HANDLE_FLAG.to_le_bytes();
        let mut chunk = Vec::with_capacity(PAGE_SIZE);
        for _ in 0..PAGE_SIZE / INDEX_ENTRY_SIZE {
            chunk.extend_from_slice(&free);
        }
        let mut done = 0u64;
        let total = slots as u64 * INDEX_ENTRY_SIZE as u64;
        while done < total {
            let n = (total - done).min(PAGE_SIZE as u64) as usize;
            self.pool.write(index_pos + used + done, &chunk[..n])?;
            done += n as u64;
        }

        self.current_index_size += slots;
        let shadow = self.header.shadow_mut();
        shadow.set_index(index_pos);
        shadow.set_index_size(new_index_size);
        shadow.set_bitmap_extent(extent);
        shadow.set_index_used(self.current_index_size);
        self.bitmap_space.resize(LARGE_BITMAP_PAGES as usize, u32::MAX);

        debug!(extent, new_index_size, "bitmap extension slots reserved");
        Ok((old_index, old_bytes))
    }

    /// Forgets cursors and space hints. Used after rollback.
    pub(crate) fn reset_allocator(&mut self) {
        self.cursors = Cursors::default();
        self.size_space_hints();
    }
}
