//! # Mark-Sweep Garbage Collector
//!
//! Reachability is computed over the committed image, one mark bit per
//! allocation quantum:
//!
//! ```text
//! roots                         grey                 black
//! committed root_object ─┐
//! committed schema list ─┤  ┌─> set bit at  ──> scanned: its record is read
//! working root / schema ─┼──┤   committed pos      and every reference greyed
//! refs of MODIFIED       │  └──────────────────────────────┘
//! working records ───────┘
//! ```
//!
//! Records written in the running transaction are not in the committed image,
//! so their outgoing references are greyed directly. This keeps objects that
//! are only reachable from uncommitted state alive.
//!
//! ## Sweep
//!
//! An object is reclaimed when its committed slot names a plain record whose
//! quantum stayed white and the working slot still equals the committed one.
//! Its id is released and its range clone-protected; commit frees the bytes.

use eyre::Result;
use smallvec::SmallVec;
use tracing::info;

use super::Engine;
use crate::config::{
    ALLOCATION_QUANTUM_BITS, FIRST_USER_ID, FLAGS_MASK, FREE_HANDLE_FLAG, HANDLES_PER_PAGE,
    INDEX_ENTRY_SIZE, MODIFIED_FLAG, PAGE_OBJECT_FLAG, PAGE_SIZE,
};
use crate::Oid;

/// One bit per quantum of the committed file.
struct MarkBitmap {
    words: Vec<u64>,
}

impl MarkBitmap {
    fn new(quanta: u64) -> Self {
        Self {
            words: vec![0; (quanta as usize).div_ceil(64) + 1],
        }
    }

    fn get(&self, quantum: u64) -> bool {
        let q = quantum as usize;
        self.words
            .get(q / 64)
            .is_some_and(|word| word & (1 << (q % 64)) != 0)
    }

    fn set(&mut self, quantum: u64) {
        let q = quantum as usize;
        if let Some(word) = self.words.get_mut(q / 64) {
            *word |= 1 << (q % 64);
        }
    }

    /// Removes and returns the lowest set bit at or after word `from`.
    fn pop_from(&mut self, from: usize) -> Option<(usize, u64)> {
        for w in from..self.words.len() {
            let word = self.words[w];
            if word != 0 {
                let bit = word.trailing_zeros() as u64;
                self.words[w] = word & (word - 1);
                return Some((w, w as u64 * 64 + bit));
            }
        }
        None
    }
}

struct Marks {
    grey: MarkBitmap,
    black: MarkBitmap,
}

impl Engine {
    /// Runs one collection cycle. Returns the number of reclaimed objects, or
    /// 0 if a cycle is running or already completed since the last commit.
    pub fn collect(&mut self) -> Result<usize> {
        if self.gc_active || self.gc_done {
            return Ok(0);
        }

        self.gc_active = true;
        let result = self.mark_and_sweep();
        self.gc_active = false;
        result
    }

    /// Whether an allocation crossed the GC threshold since the last check.
    pub fn take_gc_request(&mut self) -> bool {
        std::mem::take(&mut self.gc_requested)
    }

    fn mark_and_sweep(&mut self) -> Result<usize> {
        if let Some(listener) = &self.listener {
            listener.gc_started();
        }

        let committed = *self.header.committed();
        let shadow = *self.header.shadow();
        let quanta = committed.size() >> ALLOCATION_QUANTUM_BITS;
        let mut marks = Marks {
            grey: MarkBitmap::new(quanta),
            black: MarkBitmap::new(quanta),
        };

        for oid in [
            committed.root_object(),
            committed.class_desc_list(),
            shadow.root_object(),
            shadow.class_desc_list(),
        ] {
            self.grey_object(oid, &mut marks)?;
        }
        self.grey_working_referents(&mut marks)?;

        let mut from = 0;
        while let Some((word, quantum)) = marks.grey.pop_from(from) {
            marks.black.set(quantum);
            let refs = self.references_at(quantum << ALLOCATION_QUANTUM_BITS)?;
            let mut lowest = word;
            for oid in refs {
                if let Some(greyed) = self.grey_object(oid, &mut marks)? {
                    lowest = lowest.min((greyed / 64) as usize);
                }
            }
            from = lowest;
        }

        let reclaimed = self.sweep(&marks.black)?;

        self.gc_done = true;
        self.allocated_delta = 0;
        self.gc_requested = false;
        if let Some(listener) = &self.listener {
            listener.gc_completed(reclaimed);
        }
        info!(reclaimed, used = self.used_size, "garbage collection finished");
        Ok(reclaimed)
    }

    /// Greys the committed record of `oid`. Returns the greyed quantum.
    fn grey_object(&mut self, oid: Oid, marks: &mut Marks) -> Result<Option<u64>> {
        if oid < FIRST_USER_ID || oid >= self.committed_index_size {
            return Ok(None);
        }
        let entry = self.committed_pos(oid)?;
        let pos = entry & !FLAGS_MASK;
        if entry & (FREE_HANDLE_FLAG | PAGE_OBJECT_FLAG) != 0 || pos == 0 {
            return Ok(None);
        }

        let quantum = pos >> ALLOCATION_QUANTUM_BITS;
        if marks.black.get(quantum) || marks.grey.get(quantum) {
            return Ok(None);
        }
        marks.grey.set(quantum);
        Ok(Some(quantum))
    }

    fn grey_working_referents(&mut self, marks: &mut Marks) -> Result<()> {
        let index = self.header.shadow().index();
        let dirty: Vec<u32> = self.dirty_index_pages.iter().collect();
        let mut page_buf = [0u8; PAGE_SIZE];

        for page in dirty {
            let first = page * HANDLES_PER_PAGE;
            if first >= self.current_index_size {
                break;
            }
            let slots = (self.current_index_size - first).min(HANDLES_PER_PAGE) as usize;
            let len = slots * INDEX_ENTRY_SIZE;
            self.pool
                .read(index + page as u64 * PAGE_SIZE as u64, &mut page_buf[..len])?;

            let modified: SmallVec<[u64; 16]> = page_buf[..len]
                .chunks_exact(INDEX_ENTRY_SIZE)
                .map(|raw| {
                    let mut bytes = [0u8; INDEX_ENTRY_SIZE];
                    bytes.copy_from_slice(raw);
                    u64::from_le_bytes(bytes)
                })
                .filter(|&entry| {
                    entry & MODIFIED_FLAG != 0
                        && entry & (FREE_HANDLE_FLAG | PAGE_OBJECT_FLAG) == 0
                        && entry & !FLAGS_MASK != 0
                })
                .map(|entry| entry & !FLAGS_MASK)
                .collect();

            for pos in modified {
                for oid in self.references_at(pos)? {
                    self.grey_object(oid, marks)?;
                }
            }
        }
        Ok(())
    }

    fn references_at(&mut self, pos: u64) -> Result<SmallVec<[Oid; 16]>> {
        let record = self.read_record(pos)?;
        let mut refs = SmallVec::new();
        self.layout.for_each_reference(&record, &mut |oid| refs.push(oid));
        Ok(refs)
    }

    fn sweep(&mut self, black: &MarkBitmap) -> Result<usize> {
        let mut reclaimed = 0;

        for oid in FIRST_USER_ID..self.committed_index_size {
            let entry = self.committed_pos(oid)?;
            let pos = entry & !FLAGS_MASK;
            if entry & (FREE_HANDLE_FLAG | PAGE_OBJECT_FLAG) != 0
                || pos == 0
                || black.get(pos >> ALLOCATION_QUANTUM_BITS)
                || self.get_pos(oid)? != entry
            {
                continue;
            }

            self.set_dirty()?;
            let record = self.read_record(pos)?;
            let mut pages: SmallVec<[Oid; 8]> = SmallVec::new();
            self.layout
                .for_each_owned_page(&record, &mut |page| pages.push(page));
            for page in pages {
                self.release_owned_page(page)?;
            }

            self.free_id(oid)?;
            self.objects.remove(oid);
            self.clone_bitmap(pos, record.len() as u64)?;
            reclaimed += 1;
        }
        Ok(reclaimed)
    }

    fn release_owned_page(&mut self, oid: Oid) -> Result<()> {
        let Ok(entry) = self.get_pos(oid) else {
            return Ok(());
        };
        if oid < FIRST_USER_ID
            || entry & FREE_HANDLE_FLAG != 0
            || entry & PAGE_OBJECT_FLAG == 0
        {
            return Ok(());
        }

        let pos = entry & !FLAGS_MASK;
        if entry & MODIFIED_FLAG != 0 {
            self.free(pos, PAGE_SIZE as u64)?;
        } else {
            self.clone_bitmap(pos, PAGE_SIZE as u64)?;
        }
        self.free_id(oid)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::database::StorageConfig;
    use crate::error::StorageError;
    use crate::layout::{ShapeLayout, TypeShape};
    use crate::storage::MemoryFile;
    use std::sync::Arc;

    fn link(refs: &[u32]) -> Vec<u8> {
        ShapeLayout::encode_references(refs, b"payload")
    }

    #[test]
    fn unreachable_objects_are_reclaimed() {
        let mut engine = open(&MemoryFile::new());
        let root = engine.allocate_id().unwrap();
        let child = engine.allocate_id().unwrap();
        let grandchild = engine.allocate_id().unwrap();
        let orphan = engine.allocate_id().unwrap();
        engine.store(grandchild, 1, &link(&[])).unwrap();
        engine.store(child, 1, &link(&[grandchild])).unwrap();
        engine.store(root, 1, &link(&[child])).unwrap();
        engine.store(orphan, 1, &link(&[child])).unwrap();
        engine.set_root(root).unwrap();
        engine.commit().unwrap();

        assert_eq!(engine.collect().unwrap(), 1);
        engine.commit().unwrap();

        for oid in [root, child, grandchild] {
            assert!(engine.load(oid).is_ok());
        }
        let err = engine.load(orphan).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StorageError>(),
            Some(&StorageError::DeletedObject(orphan))
        );
    }

    #[test]
    fn cycle_runs_once_per_commit() {
        let mut engine = open(&MemoryFile::new());
        let orphan = engine.allocate_id().unwrap();
        engine.store(orphan, 1, &link(&[])).unwrap();
        engine.commit().unwrap();

        assert_eq!(engine.collect().unwrap(), 1);
        assert_eq!(engine.collect().unwrap(), 0);
    }

    #[test]
    fn sweep_frees_space_at_commit() {
        let mut engine = open(&MemoryFile::new());
        let orphan = engine.allocate_id().unwrap();
        engine.store(orphan, 1, &vec![0u8; 2000]).unwrap();
        engine.commit().unwrap();
        let used = engine.used_size();

        engine.collect().unwrap();
        engine.commit().unwrap();

        assert!(engine.used_size() < used);
    }

    #[test]
    fn objects_referenced_from_uncommitted_records_survive() {
        let mut engine = open(&MemoryFile::new());
        let root = engine.allocate_id().unwrap();
        let detached = engine.allocate_id().unwrap();
        engine.store(root, 1, &link(&[])).unwrap();
        engine.store(detached, 1, &link(&[])).unwrap();
        engine.set_root(root).unwrap();
        engine.commit().unwrap();

        let fresh = engine.allocate_id().unwrap();
        engine.store(fresh, 1, &link(&[detached])).unwrap();

        assert_eq!(engine.collect().unwrap(), 0);
        assert!(engine.load(detached).is_ok());
    }

    #[test]
    fn owned_pages_are_released_with_their_owner() {
        let file = MemoryFile::new();
        let layout = ShapeLayout::default().with_shape(7, TypeShape::IndexNode);
        let mut engine = super::super::Engine::open(
            Box::new(file),
            &StorageConfig::default(),
            Arc::new(layout),
            None,
        )
        .unwrap();
        let page = engine.allocate_page().unwrap();
        let node = engine.allocate_id().unwrap();
        engine
            .store(node, 7, &ShapeLayout::encode_index_node(&[], &[page], b"keys"))
            .unwrap();
        engine.commit().unwrap();

        assert_eq!(engine.collect().unwrap(), 1);

        let err = engine.read_page(page).unwrap_err();
        assert_eq!(
            err.downcast_ref::<StorageError>(),
            Some(&StorageError::DeletedObject(page))
        );
    }

    #[test]
    fn threshold_requests_a_cycle() {
        let config = StorageConfig {
            gc_threshold: Some(1000),
            ..StorageConfig::default()
        };
        let mut engine = open_with(&MemoryFile::new(), &config);
        assert!(!engine.take_gc_request());

        for _ in 0..4 {
            let oid = engine.allocate_id().unwrap();
            engine.store(oid, 1, &vec![0u8; 500]).unwrap();
        }

        assert!(engine.take_gc_request());
        assert!(!engine.take_gc_request());
    }
}
