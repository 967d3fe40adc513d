//! Record header shared by every stored object.
//!
//! ```text
//! +-----------+-------------+----------------------+
//! | size: u32 | type_id: u32| body (size - 8 bytes)|
//! +-----------+-------------+----------------------+
//! ```
//!
//! `size` includes the header. Records start on quantum boundaries, so the
//! header never straddles a page.

use eyre::{ensure, Result};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const RECORD_HEADER_SIZE: usize = 8;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct RecordHeader {
    size: U32,
    type_id: U32,
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == RECORD_HEADER_SIZE);

impl RecordHeader {
    pub fn new(size: u32, type_id: u32) -> Self {
        Self {
            size: U32::new(size),
            type_id: U32::new(type_id),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        ensure!(
            bytes.len() >= RECORD_HEADER_SIZE,
            "buffer too small for RecordHeader: {} < {}",
            bytes.len(),
            RECORD_HEADER_SIZE
        );

        Self::ref_from_bytes(&bytes[..RECORD_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse RecordHeader: {:?}", e))
    }

    pub fn size(&self) -> u32 {
        self.size.get()
    }

    pub fn type_id(&self) -> u32 {
        self.type_id.get()
    }
}
