//! # Storage Layout Constants
//!
//! This module centralizes the numeric constants that define the on-disk
//! layout. Most of them are derived from three primitives (page size,
//! allocation quantum and handles per index page) and must stay consistent
//! with each other, so they are co-located and tied together by compile-time
//! assertions.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE_LOG (12) ──> PAGE_SIZE (4096)
//!       │
//!       ├─> BITMAP_SEGMENT_BITS (derived: PAGE_SIZE_LOG + 3 + ALLOCATION_QUANTUM_BITS)
//!       │     One bitmap page holds PAGE_SIZE * 8 bits, one bit per quantum,
//!       │     so it covers 2^20 bytes of file space.
//!       │
//!       ├─> BITMAP_PAGES (derived: 2^(DATABASE_OFFSET_BITS - BITMAP_SEGMENT_BITS))
//!       │     Ids BITMAP_ID..BITMAP_ID + BITMAP_PAGES are reserved for bitmap
//!       │     pages, so FIRST_USER_ID follows them.
//!       │
//!       └─> LARGE_BITMAP_PAGES (derived: 2^(LARGE_DATABASE_OFFSET_BITS - BITMAP_SEGMENT_BITS))
//!             Bitmap pages past BITMAP_PAGES live in a block of index slots
//!             starting at the root page's `bitmap_extent`.
//!
//! ALLOCATION_QUANTUM_BITS (5) ──> ALLOCATION_QUANTUM (32)
//!       │
//!       └─> PAGE_ALIGNED_BITMAP_STEP (derived: PAGE_SIZE / ALLOCATION_QUANTUM / 8)
//!             Bitmap bytes per page of file space; page-aligned holes start on
//!             multiples of this offset.
//!
//! HANDLES_PER_PAGE_BITS (9) ──> HANDLES_PER_PAGE (512)
//!       │
//!       └─> Index sizes are always multiples of HANDLES_PER_PAGE so that
//!           one index page never straddles two storage extents.
//! ```
//!
//! ## Index Entry Flags
//!
//! The low `FLAGS_BITS` bits of every index slot are flags. Positions are
//! quantum aligned, so these bits are never part of a position.

// ============================================================================
// PAGE AND QUANTUM
// ============================================================================

/// log2 of the page size.
pub const PAGE_SIZE_LOG: u32 = 12;

/// Size of each page in bytes. The unit of caching and of page objects.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_LOG;

/// log2 of the allocation quantum.
pub const ALLOCATION_QUANTUM_BITS: u32 = 5;

/// Smallest allocation unit. Every allocation size is rounded up to it.
pub const ALLOCATION_QUANTUM: usize = 1 << ALLOCATION_QUANTUM_BITS;

/// Number of bitmap bytes describing one page of file space.
pub const PAGE_ALIGNED_BITMAP_STEP: usize = PAGE_SIZE / ALLOCATION_QUANTUM / 8;

/// Bits held by one bitmap page.
pub const BITS_PER_BITMAP_PAGE: u64 = (PAGE_SIZE as u64) * 8;

const _: () = assert!(
    PAGE_ALIGNED_BITMAP_STEP * 8 * ALLOCATION_QUANTUM == PAGE_SIZE,
    "PAGE_ALIGNED_BITMAP_STEP derivation mismatch"
);

// ============================================================================
// BITMAP GEOMETRY
// ============================================================================

/// log2 of the file space covered by one bitmap page.
pub const BITMAP_SEGMENT_BITS: u32 = PAGE_SIZE_LOG + 3 + ALLOCATION_QUANTUM_BITS;

/// Bytes of file space covered by one bitmap page.
pub const BITMAP_SEGMENT_SIZE: u64 = 1 << BITMAP_SEGMENT_BITS;

/// Address bits covered by the reserved bitmap page ids.
pub const DATABASE_OFFSET_BITS: u32 = 32;

/// Address bits reachable through bitmap extension pages.
pub const LARGE_DATABASE_OFFSET_BITS: u32 = 40;

/// Number of bitmap pages addressed by reserved ids.
pub const BITMAP_PAGES: u32 = 1 << (DATABASE_OFFSET_BITS - BITMAP_SEGMENT_BITS);

/// Hard limit on the number of bitmap pages.
pub const LARGE_BITMAP_PAGES: u32 = 1 << (LARGE_DATABASE_OFFSET_BITS - BITMAP_SEGMENT_BITS);

const _: () = assert!(BITMAP_SEGMENT_BITS == 20, "one bitmap page must cover 1 MiB");
const _: () = assert!(BITMAP_PAGES < LARGE_BITMAP_PAGES);

// ============================================================================
// OBJECT INDEX
// ============================================================================

/// log2 of the number of index slots per page.
pub const HANDLES_PER_PAGE_BITS: u32 = 9;

/// Index slots per page; every slot is an 8 byte `position | flags` word.
pub const HANDLES_PER_PAGE: u32 = 1 << HANDLES_PER_PAGE_BITS;

/// Bytes per index slot.
pub const INDEX_ENTRY_SIZE: usize = 8;

const _: () = assert!(
    HANDLES_PER_PAGE as usize * INDEX_ENTRY_SIZE == PAGE_SIZE,
    "one index page must hold exactly HANDLES_PER_PAGE slots"
);

/// Never a valid object id.
pub const INVALID_ID: u32 = 0;

/// Id of the first bitmap page.
pub const BITMAP_ID: u32 = 1;

/// First id handed out to applications.
pub const FIRST_USER_ID: u32 = BITMAP_ID + BITMAP_PAGES;

/// Ceiling on object ids; index growth past it fails with not-enough-space.
pub const MAX_OBJECT_OID: u32 = (1 << 31) - 1;

/// Slot refers to a page object rather than a record.
pub const PAGE_OBJECT_FLAG: u64 = 1;

/// Slot was changed in the running transaction.
pub const MODIFIED_FLAG: u64 = 2;

/// Slot is on the free-id list; the next free id is stored above the flags.
pub const FREE_HANDLE_FLAG: u64 = 4;

pub const FLAGS_MASK: u64 = 7;

pub const FLAGS_BITS: u32 = 3;

const _: () = assert!(FLAGS_MASK < ALLOCATION_QUANTUM as u64);

// ============================================================================
// ALLOCATOR TUNING
// ============================================================================

/// Reservation-chain depth past which the allocator only searches the last
/// bitmap page before extending the file.
pub const ALLOC_RECURSION_LIMIT: usize = 100;

/// Minimum number of bytes the file grows by when the bitmap is exhausted.
pub const DEFAULT_EXTENSION_QUANTUM: u64 = 1024 * 1024;

// ============================================================================
// DEFAULTS
// ============================================================================

/// Requested initial index slots. Raised to cover the reserved ids.
pub const DEFAULT_INITIAL_INDEX_SIZE: u32 = 1024;

/// Records kept in the object cache.
pub const DEFAULT_OBJECT_CACHE_SIZE: usize = 1024;

/// Frames kept in the page pool.
pub const DEFAULT_PAGE_POOL_SIZE: usize = 1024;

/// Smallest page pool accepted by the builder.
pub const MIN_PAGE_POOL_SIZE: usize = 16;

/// Persisted format version; 0 marks a header that was never written.
pub const FORMAT_VERSION: u8 = 1;
