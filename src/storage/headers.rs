//! # Database Header
//!
//! The first 123 bytes of page 0 hold the database header. It is the only
//! structure updated in place: every other change reaches the file through
//! copy-on-write, and a commit becomes visible when the header with the
//! flipped root selector is flushed.
//!
//! ## Header Layout
//!
//! ```text
//! offset size field
//! 0      1    curr            selector of the committed root (0 or 1)
//! 1      1    dirty           set while the file has unclosed changes
//! 2      1    version         FORMAT_VERSION; 0 means never initialized
//! 3      56   root[0]
//! 59     56   root[1]
//! 115    8    transaction_id
//! ```
//!
//! ## Root Page Layout
//!
//! ```text
//! 0  u64 size               tracked file size
//! 8  u64 index              object index used by this root
//! 16 u64 shadow_index       the other index copy
//! 24 u32 index_size         slots in `index`
//! 28 u32 shadow_index_size  slots in `shadow_index`
//! 32 u32 index_used         slots handed out
//! 36 u32 free_list          head of the free-id list
//! 40 u32 bitmap_end         BITMAP_ID + number of bitmap pages
//! 44 u32 root_object
//! 48 u32 class_desc_list    head of the schema list
//! 52 u32 bitmap_extent      first slot of the bitmap extension block
//! ```
//!
//! `root[curr]` is the committed root; `root[curr ^ 1]` is the shadow root
//! that the running transaction mutates. Callers go through `committed()`,
//! `shadow()` and `shadow_mut()` and never index the array themselves.
//!
//! ## Endianness
//!
//! All multi-byte fields are little-endian (`zerocopy::little_endian`).

use eyre::{bail, ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::FORMAT_VERSION;
use crate::error::StorageError;

pub const ROOT_PAGE_SIZE: usize = 56;
pub const HEADER_SIZE: usize = 3 + 2 * ROOT_PAGE_SIZE + 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RootPage {
    size: U64,
    index: U64,
    shadow_index: U64,
    index_size: U32,
    shadow_index_size: U32,
    index_used: U32,
    free_list: U32,
    bitmap_end: U32,
    root_object: U32,
    class_desc_list: U32,
    bitmap_extent: U32,
}

const _: () = assert!(std::mem::size_of::<RootPage>() == ROOT_PAGE_SIZE);

macro_rules! root_field {
    ($get:ident, $set:ident, $ty:ty, $wrap:ident) => {
        pub fn $get(&self) -> $ty {
            self.$get.get()
        }

        pub fn $set(&mut self, value: $ty) {
            self.$get = $wrap::new(value);
        }
    };
}

impl RootPage {
    root_field!(size, set_size, u64, U64);
    root_field!(index, set_index, u64, U64);
    root_field!(shadow_index, set_shadow_index, u64, U64);
    root_field!(index_size, set_index_size, u32, U32);
    root_field!(shadow_index_size, set_shadow_index_size, u32, U32);
    root_field!(index_used, set_index_used, u32, U32);
    root_field!(free_list, set_free_list, u32, U32);
    root_field!(bitmap_end, set_bitmap_end, u32, U32);
    root_field!(root_object, set_root_object, u32, U32);
    root_field!(class_desc_list, set_class_desc_list, u32, U32);
    root_field!(bitmap_extent, set_bitmap_extent, u32, U32);

    /// Copies every field except the index locations.
    pub fn mirror_scalars(&mut self, other: &RootPage) {
        self.size = other.size;
        self.index_used = other.index_used;
        self.free_list = other.free_list;
        self.bitmap_end = other.bitmap_end;
        self.root_object = other.root_object;
        self.class_desc_list = other.class_desc_list;
        self.bitmap_extent = other.bitmap_extent;
    }

    /// Points this root at the index copy `other` does not use.
    pub fn cross_index(&mut self, other: &RootPage) {
        self.index = other.shadow_index;
        self.index_size = other.shadow_index_size;
        self.shadow_index = other.index;
        self.shadow_index_size = other.index_size;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct DatabaseHeader {
    curr: u8,
    dirty: u8,
    version: u8,
    root: [RootPage; 2],
    transaction_id: U64,
}

const _: () = assert!(std::mem::size_of::<DatabaseHeader>() == HEADER_SIZE);

impl DatabaseHeader {
    pub fn new() -> Self {
        Self {
            curr: 0,
            dirty: 0,
            version: FORMAT_VERSION,
            root: [RootPage::default(); 2],
            transaction_id: U64::new(0),
        }
    }

    /// Parses and validates the header at the start of page 0.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            bail!(StorageError::DatabaseCorrupted(format!(
                "header truncated: {} < {} bytes",
                bytes.len(),
                HEADER_SIZE
            )));
        }

        let header = Self::read_from_bytes(&bytes[..HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse DatabaseHeader: {:?}", e))?;

        if header.version != FORMAT_VERSION {
            bail!(StorageError::DatabaseCorrupted(format!(
                "unsupported format version {}",
                header.version
            )));
        }
        if header.curr > 1 || header.dirty > 1 {
            bail!(StorageError::DatabaseCorrupted(format!(
                "garbled header flags curr={} dirty={}",
                header.curr, header.dirty
            )));
        }

        let committed = header.committed();
        if committed.index_size() != committed.shadow_index_size() {
            bail!(StorageError::DatabaseCorrupted(format!(
                "index size mismatch: {} != {}",
                committed.index_size(),
                committed.shadow_index_size()
            )));
        }
        if committed.index_used() > committed.index_size() {
            bail!(StorageError::DatabaseCorrupted(format!(
                "index uses {} of {} slots",
                committed.index_used(),
                committed.index_size()
            )));
        }

        Ok(header)
    }

    pub fn write_to(&self, page: &mut [u8]) -> Result<()> {
        ensure!(
            page.len() >= HEADER_SIZE,
            "buffer too small for DatabaseHeader: {} < {}",
            page.len(),
            HEADER_SIZE
        );
        page[..HEADER_SIZE].copy_from_slice(self.as_bytes());
        Ok(())
    }

    /// Slot of the committed root.
    pub fn current(&self) -> usize {
        self.curr as usize
    }

    pub fn committed(&self) -> &RootPage {
        &self.root[self.current()]
    }

    pub fn committed_mut(&mut self) -> &mut RootPage {
        let slot = self.current();
        &mut self.root[slot]
    }

    pub fn shadow(&self) -> &RootPage {
        &self.root[self.current() ^ 1]
    }

    pub fn shadow_mut(&mut self) -> &mut RootPage {
        let slot = self.current() ^ 1;
        &mut self.root[slot]
    }

    /// Committed root and mutable shadow root at once.
    pub fn roots_mut(&mut self) -> (&RootPage, &mut RootPage) {
        let [first, second] = &mut self.root;
        if self.curr == 0 {
            (&*first, second)
        } else {
            (&*second, first)
        }
    }

    /// Makes the shadow root the committed one.
    pub fn flip(&mut self) {
        self.curr ^= 1;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty != 0
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty as u8;
    }

    pub fn transaction_id(&self) -> u64 {
        self.transaction_id.get()
    }

    pub fn bump_transaction_id(&mut self) {
        self.transaction_id = U64::new(self.transaction_id.get() + 1);
    }
}

impl Default for DatabaseHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DatabaseHeader {
        let mut header = DatabaseHeader::new();
        let (committed_index, shadow_index) = (4096, 8192);
        for slot in 0..2 {
            header.flip();
            let root = header.shadow_mut();
            root.set_index(if slot == 0 { committed_index } else { shadow_index });
            root.set_shadow_index(if slot == 0 { shadow_index } else { committed_index });
            root.set_index_size(512);
            root.set_shadow_index_size(512);
            root.set_index_used(10);
        }
        header
    }

    #[test]
    fn header_has_fixed_size() {
        assert_eq!(HEADER_SIZE, 123);
        assert_eq!(std::mem::size_of::<DatabaseHeader>(), 123);
    }

    #[test]
    fn root_fields_sit_at_documented_offsets() {
        let mut header = DatabaseHeader::new();
        header.shadow_mut().set_bitmap_extent(0xAABBCCDD);
        header.shadow_mut().set_size(0x0102030405060708);

        let mut page = vec![0u8; 4096];
        header.write_to(&mut page).unwrap();

        let root1 = 3 + ROOT_PAGE_SIZE;
        assert_eq!(&page[root1..root1 + 8], &0x0102030405060708u64.to_le_bytes());
        assert_eq!(&page[root1 + 52..root1 + 56], &0xAABBCCDDu32.to_le_bytes());
    }

    #[test]
    fn write_then_parse_preserves_roots() {
        let header = sample();
        let mut page = vec![0u8; 4096];
        header.write_to(&mut page).unwrap();

        let parsed = DatabaseHeader::from_bytes(&page).unwrap();

        assert_eq!(parsed, header);
        assert_eq!(parsed.committed().index_used(), 10);
    }

    #[test]
    fn zeroed_version_is_corruption() {
        let header = sample();
        let mut page = vec![0u8; 4096];
        header.write_to(&mut page).unwrap();
        page[..10].fill(0);

        let err = DatabaseHeader::from_bytes(&page).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::DatabaseCorrupted(_))
        ));
    }

    #[test]
    fn index_size_mismatch_is_corruption() {
        let mut header = sample();
        header.committed_mut().set_shadow_index_size(1024);
        let mut page = vec![0u8; 4096];
        header.write_to(&mut page).unwrap();

        assert!(DatabaseHeader::from_bytes(&page).is_err());
    }

    #[test]
    fn short_buffer_is_corruption() {
        let err = DatabaseHeader::from_bytes(&[1u8; 20]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::DatabaseCorrupted(_))
        ));
    }

    #[test]
    fn flip_swaps_committed_and_shadow() {
        let mut header = DatabaseHeader::new();
        header.shadow_mut().set_root_object(77);

        header.flip();

        assert_eq!(header.committed().root_object(), 77);
        assert_eq!(header.shadow().root_object(), 0);
    }

    #[test]
    fn cross_index_points_at_the_other_copy() {
        let header = sample();
        let mut shadow = RootPage::default();

        shadow.cross_index(header.committed());

        assert_eq!(shadow.index(), header.committed().shadow_index());
        assert_eq!(shadow.shadow_index(), header.committed().index());
    }
}
