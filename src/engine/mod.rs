//! # Storage Engine
//!
//! `Engine` owns the page pool and every piece of process-local state that the
//! allocator, transaction manager and garbage collector share. It is not
//! thread safe by itself; `Database` keeps it behind the index lock.
//!
//! ## Shadow Paging
//!
//! The header holds two root pages. One is committed and immutable until the
//! next commit; the other (the shadow root) describes the state the running
//! transaction is building:
//!
//! ```text
//!                 header (page 0)
//!        ┌──────────────┴──────────────┐
//!  root[curr]                     root[curr ^ 1]
//!  committed                      shadow (working)
//!     │ index ─────> index copy A     │ index ─────> index copy B
//!     │                               │
//!     └─> oid -> position             └─> oid -> position | MODIFIED
//!            (never rewritten)               (copy-on-write)
//! ```
//!
//! Any object, page object or bitmap page touched by the transaction is
//! written to a fresh location and its slot in the shadow index is flagged
//! `MODIFIED`. Old locations stay allocated in the committed bitmap until the
//! commit that supersedes them, so a crash at any point leaves the committed
//! root intact.
//!
//! ## Module Organization
//!
//! - `holes`: lookup tables and pure bitmap scans
//! - `index`: object index access, id allocation, dirty-page tracking
//! - `alloc`: bitmap allocator, copy-on-write of bitmap pages, file extension
//! - `commit`: commit, rollback and crash recovery
//! - `gc`: mark-sweep garbage collector
//! - `objects`: record and page-object operations, object cache

mod alloc;
mod commit;
mod gc;
mod holes;
mod index;
mod objects;

use std::io::Write;
use std::sync::Arc;

use eyre::{bail, Result, WrapErr};
use roaring::RoaringBitmap;
use tracing::{debug, info, warn};

pub use objects::Record;

use crate::config::{
    ALLOCATION_QUANTUM, BITMAP_ID, BITMAP_PAGES, BITMAP_SEGMENT_SIZE, FIRST_USER_ID,
    FREE_HANDLE_FLAG, HANDLES_PER_PAGE, INDEX_ENTRY_SIZE, LARGE_BITMAP_PAGES, PAGE_OBJECT_FLAG,
    PAGE_SIZE,
};
use crate::database::StorageConfig;
use crate::error::StorageError;
use crate::layout::ObjectLayout;
use crate::listener::StorageListener;
use crate::storage::{DatabaseHeader, PagePool, StorageFile, HEADER_SIZE};
use crate::Oid;

use alloc::Cursors;
use holes::{count_set_bits, update_bits, Reservations};
use objects::ObjectCache;

pub(crate) fn align_up(value: u64, to: u64) -> u64 {
    value.div_ceil(to) * to
}

pub struct Engine {
    pool: PagePool,
    header: DatabaseHeader,
    layout: Arc<dyn ObjectLayout>,
    listener: Option<Arc<dyn StorageListener>>,
    objects: ObjectCache,

    committed_index_size: u32,
    current_index_size: u32,
    dirty_index_pages: RoaringBitmap,

    bitmap_space: Vec<u32>,
    cursors: Cursors,
    reserved: Reservations,
    clone_queue: Vec<u64>,
    inside_clone: bool,
    used_size: u64,
    allocated_delta: u64,

    gc_threshold: Option<u64>,
    gc_active: bool,
    gc_done: bool,
    gc_requested: bool,

    extension_quantum: u64,
    reuse_oid: bool,
    max_object_oid: u32,
    read_only: bool,
    multiclient: bool,
    modified: bool,
}

impl Engine {
    /// Opens the database stored in `file`, initializing it when empty and
    /// running recovery when the previous session did not close cleanly.
    pub fn open(
        file: Box<dyn StorageFile>,
        config: &StorageConfig,
        layout: Arc<dyn ObjectLayout>,
        listener: Option<Arc<dyn StorageListener>>,
    ) -> Result<Self> {
        let mut pool = PagePool::new(file, config.page_pool_size)?;
        if config.truncate && !config.read_only {
            pool.truncate_file()?;
        }
        let file_len = pool.file_len();

        let mut engine = Self {
            pool,
            header: DatabaseHeader::new(),
            layout,
            listener,
            objects: ObjectCache::new(config.object_cache_size),
            committed_index_size: 0,
            current_index_size: 0,
            dirty_index_pages: RoaringBitmap::new(),
            bitmap_space: vec![u32::MAX; BITMAP_PAGES as usize],
            cursors: Cursors::default(),
            reserved: Reservations::default(),
            clone_queue: Vec::new(),
            inside_clone: false,
            used_size: 0,
            allocated_delta: 0,
            gc_threshold: config.gc_threshold,
            gc_active: false,
            gc_done: false,
            gc_requested: false,
            extension_quantum: config.extension_quantum,
            reuse_oid: config.reuse_oid,
            max_object_oid: config.max_object_oid,
            read_only: config.read_only,
            multiclient: config.multiclient,
            modified: false,
        };

        if file_len == 0 {
            if engine.read_only {
                bail!(StorageError::InvalidOperation(
                    "cannot initialize an empty database read-only"
                ));
            }
            engine.initialize(config.initial_index_size)?;
        } else {
            if file_len < HEADER_SIZE as u64 {
                bail!(StorageError::DatabaseCorrupted(format!(
                    "file is {} bytes, shorter than the header",
                    file_len
                )));
            }
            engine.header = DatabaseHeader::from_bytes(engine.pool.page(0)?)?;
            engine.load_existing()?;
        }

        Ok(engine)
    }

    fn initialize(&mut self, initial_index_size: u32) -> Result<()> {
        let index_size = initial_index_size
            .max(FIRST_USER_ID)
            .next_multiple_of(HANDLES_PER_PAGE);
        let index_bytes = index_size as u64 * INDEX_ENTRY_SIZE as u64;

        let first_index = PAGE_SIZE as u64;
        let second_index = first_index + index_bytes;
        let laid_out = second_index + index_bytes;
        let net_coverage = BITMAP_SEGMENT_SIZE - PAGE_SIZE as u64;
        let bitmap_pages = laid_out.div_ceil(net_coverage) as u32;
        let bitmap_pos = laid_out;
        let used = bitmap_pos + bitmap_pages as u64 * PAGE_SIZE as u64;

        for (slot, (index, shadow)) in [(first_index, second_index), (second_index, first_index)]
            .into_iter()
            .enumerate()
        {
            // slot 0 starts committed, slot 1 is the shadow
            let root = if slot == 0 {
                self.header.committed_mut()
            } else {
                self.header.shadow_mut()
            };
            root.set_size(used);
            root.set_index(index);
            root.set_shadow_index(shadow);
            root.set_index_size(index_size);
            root.set_shadow_index_size(index_size);
            root.set_index_used(FIRST_USER_ID);
            root.set_free_list(0);
            root.set_bitmap_end(BITMAP_ID + bitmap_pages);
            root.set_root_object(0);
            root.set_class_desc_list(0);
            root.set_bitmap_extent(0);
        }

        let used_quanta = (used / ALLOCATION_QUANTUM as u64) as usize;
        let bits_per_page = PAGE_SIZE * 8;
        for page in 0..bitmap_pages as usize {
            let first = page * bits_per_page;
            let count = used_quanta.saturating_sub(first).min(bits_per_page);
            let pos = bitmap_pos + (page * PAGE_SIZE) as u64;
            self.pool.zero(pos, PAGE_SIZE as u64)?;
            update_bits(self.pool.page_mut(pos)?, 0, count, true);
        }

        let mut image = vec![0u8; index_bytes as usize];
        let mut put = |oid: u32, value: u64| {
            let at = oid as usize * INDEX_ENTRY_SIZE;
            image[at..at + INDEX_ENTRY_SIZE].copy_from_slice(&value.to_le_bytes());
        };
        put(0, FREE_HANDLE_FLAG);
        for i in 0..BITMAP_PAGES {
            let value = if i < bitmap_pages {
                (bitmap_pos + i as u64 * PAGE_SIZE as u64) | PAGE_OBJECT_FLAG
            } else {
                FREE_HANDLE_FLAG
            };
            put(BITMAP_ID + i, value);
        }
        self.pool.write(first_index, &image)?;
        self.pool.write(second_index, &image)?;

        self.committed_index_size = FIRST_USER_ID;
        self.current_index_size = FIRST_USER_ID;
        self.used_size = used;

        self.header.set_dirty(true);
        self.write_header()?;
        self.pool.flush().wrap_err("failed to flush new database")?;

        info!(index_size, bitmap_pages, used, "initialized new database");
        Ok(())
    }

    fn load_existing(&mut self) -> Result<()> {
        if self.header.is_dirty() && self.read_only && self.multiclient {
            // a writer in another process has the file open
            self.view_committed();
        } else if self.header.is_dirty() {
            warn!(
                transaction_id = self.header.transaction_id(),
                "database was not closed cleanly"
            );
            if let Some(listener) = &self.listener {
                listener.database_corrupted();
            }
            if self.read_only {
                bail!(StorageError::DatabaseCorrupted(
                    "unclean shutdown and file opened read-only".into()
                ));
            }
            self.recover()?;
        }

        self.committed_index_size = self.header.committed().index_used();
        self.current_index_size = self.committed_index_size;
        self.size_space_hints();
        self.recount_used_size()?;

        info!(
            transaction_id = self.header.transaction_id(),
            objects = self.current_index_size - FIRST_USER_ID,
            used = self.used_size,
            "opened database"
        );
        Ok(())
    }

    /// Points the working root at the committed one. Only valid for
    /// read-only sessions, which never write through the shadow index.
    fn view_committed(&mut self) {
        let committed = *self.header.committed();
        *self.header.shadow_mut() = committed;
    }

    /// Rereads the header so that a read-only multiclient session sees
    /// commits made by another process. Returns whether a newer transaction
    /// became visible.
    pub fn refresh(&mut self) -> Result<bool> {
        if !self.read_only {
            bail!(StorageError::InvalidOperation(
                "only read-only sessions can refresh"
            ));
        }
        self.pool.reload()?;
        let header = DatabaseHeader::from_bytes(self.pool.page(0)?)?;
        if header.transaction_id() == self.header.transaction_id() {
            return Ok(false);
        }

        self.header = header;
        self.view_committed();
        self.committed_index_size = self.header.committed().index_used();
        self.current_index_size = self.committed_index_size;
        self.objects.clear();
        self.size_space_hints();
        self.recount_used_size()?;
        debug!(
            transaction_id = self.header.transaction_id(),
            "refreshed committed view"
        );
        Ok(true)
    }

    fn size_space_hints(&mut self) {
        let pages = if self.header.shadow().bitmap_extent() != 0 {
            LARGE_BITMAP_PAGES
        } else {
            BITMAP_PAGES
        };
        self.bitmap_space.clear();
        self.bitmap_space.resize(pages as usize, u32::MAX);
    }

    fn recount_used_size(&mut self) -> Result<()> {
        let mut quanta = 0;
        for page in 0..self.bitmap_page_count() {
            let pos = self.bitmap_page_pos(page)?;
            quanta += count_set_bits(self.pool.page(pos)?);
        }
        self.used_size = quanta * ALLOCATION_QUANTUM as u64;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let header = self.header;
        header.write_to(self.pool.page_mut(0)?)
    }

    /// Marks the database modified, persisting the dirty flag on first use.
    fn set_dirty(&mut self) -> Result<()> {
        if self.read_only {
            bail!(StorageError::InvalidOperation("database is read-only"));
        }
        self.modified = true;
        if !self.header.is_dirty() {
            self.header.set_dirty(true);
            self.write_header()?;
            self.pool.flush()?;
        }
        Ok(())
    }

    /// Commits pending changes and marks the file cleanly closed.
    pub fn close(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        if self.modified {
            self.commit()?;
        }
        if self.header.is_dirty() {
            self.header.set_dirty(false);
            self.write_header()?;
        }
        self.pool.flush().wrap_err("failed to flush database on close")
    }

    /// Streams the committed image of the database.
    pub fn backup(&mut self, out: &mut dyn Write) -> Result<u64> {
        let mut header = self.header;
        header.set_dirty(self.modified);

        let mut page = [0u8; PAGE_SIZE];
        header.write_to(&mut page)?;
        out.write_all(&page).wrap_err("failed to write backup header")?;

        let end = align_up(self.header.committed().size(), PAGE_SIZE as u64);
        let mut pos = PAGE_SIZE as u64;
        while pos < end {
            page.copy_from_slice(self.pool.page(pos)?);
            out.write_all(&page).wrap_err("failed to write backup page")?;
            pos += PAGE_SIZE as u64;
        }
        Ok(end)
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Bytes of file space currently allocated in the shadow bitmap.
    pub fn used_size(&self) -> u64 {
        self.used_size
    }

    /// Tracked file size of the committed root.
    pub fn database_size(&self) -> u64 {
        self.header.committed().size()
    }

    pub fn transaction_id(&self) -> u64 {
        self.header.transaction_id()
    }

    /// Number of index slots handed out so far, reserved ids included.
    pub fn index_used(&self) -> u32 {
        self.current_index_size
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::layout::{ShapeLayout, TypeShape};
    use crate::storage::MemoryFile;

    pub fn config() -> StorageConfig {
        StorageConfig::default()
    }

    pub fn open(file: &MemoryFile) -> Engine {
        open_with(file, &config())
    }

    /// Type 1 records carry a reference table; everything else is opaque.
    pub fn layout() -> Arc<ShapeLayout> {
        Arc::new(ShapeLayout::default().with_shape(1, TypeShape::References))
    }

    pub fn open_with(file: &MemoryFile, config: &StorageConfig) -> Engine {
        Engine::open(Box::new(file.clone()), config, layout(), None).unwrap()
    }

    pub fn try_open(file: &MemoryFile) -> Result<Engine> {
        Engine::open(Box::new(file.clone()), &config(), layout(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::storage::MemoryFile;

    #[test]
    fn new_database_lays_out_header_indexes_and_bitmap() {
        let file = MemoryFile::new();
        let engine = open(&file);

        let committed = engine.header.committed();
        assert_eq!(committed.index(), PAGE_SIZE as u64);
        assert_eq!(committed.index_size(), 4608);
        assert_eq!(committed.shadow_index(), PAGE_SIZE as u64 + 4608 * 8);
        assert_eq!(committed.bitmap_end(), BITMAP_ID + 1);
        assert_eq!(committed.size(), 81920);
        assert_eq!(engine.used_size(), 81920);
        assert_eq!(engine.index_used(), FIRST_USER_ID);
        assert!(engine.header.is_dirty());
    }

    #[test]
    fn reopen_after_close_is_clean() {
        let file = MemoryFile::new();
        let mut engine = open(&file);
        engine.close().unwrap();
        drop(engine);

        let engine = open(&file);

        assert!(!engine.header.is_dirty());
        assert!(!engine.is_modified());
        assert_eq!(engine.used_size(), 81920);
        assert_eq!(engine.index_used(), FIRST_USER_ID);
    }

    #[test]
    fn zeroed_header_prefix_fails_with_corruption() {
        let file = MemoryFile::new();
        let mut engine = open(&file);
        engine.close().unwrap();
        drop(engine);

        file.patch(0, &[0u8; 10]);
        let err = try_open(&file).err().unwrap();

        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::DatabaseCorrupted(_))
        ));
    }

    #[test]
    fn short_file_fails_with_corruption() {
        let file = MemoryFile::from_bytes(vec![1u8; 40]);
        let err = try_open(&file).err().unwrap();

        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::DatabaseCorrupted(_))
        ));
    }

    #[test]
    fn read_only_open_of_empty_file_is_rejected() {
        let file = MemoryFile::new();
        let config = StorageConfig {
            read_only: true,
            ..StorageConfig::default()
        };

        let result = Engine::open(
            Box::new(file),
            &config,
            Arc::new(crate::layout::ShapeLayout::default()),
            None,
        );

        assert!(result.is_err());
    }

    #[test]
    fn backup_reproduces_committed_state() {
        let file = MemoryFile::new();
        let mut engine = open(&file);
        let oid = engine.allocate_id().unwrap();
        engine.store(oid, 1, b"backed up").unwrap();
        engine.commit().unwrap();

        let mut image = Vec::new();
        engine.backup(&mut image).unwrap();

        let copy = MemoryFile::from_bytes(image);
        let mut restored = open(&copy);
        assert_eq!(&*restored.load(oid).unwrap().body, b"backed up");
    }

    #[test]
    fn read_only_client_follows_a_live_writer() {
        let file = MemoryFile::new();
        let mut writer = open(&file);
        writer.commit().unwrap();

        let reader_config = StorageConfig {
            read_only: true,
            multiclient: true,
            ..StorageConfig::default()
        };
        let mut reader = open_with(&file, &reader_config);
        assert!(!reader.refresh().unwrap());

        let oid = writer.allocate_id().unwrap();
        writer.store(oid, 3, b"published").unwrap();
        assert!(writer.commit().unwrap());

        assert!(reader.refresh().unwrap());
        assert_eq!(&*reader.load(oid).unwrap().body, b"published");
        assert!(reader.store(oid, 3, b"nope").is_err());
    }

    #[test]
    fn writer_cannot_refresh() {
        let file = MemoryFile::new();
        let mut engine = open(&file);
        assert!(engine.refresh().is_err());
    }
}
