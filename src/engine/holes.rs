//! # Bitmap Hole Search
//!
//! Pure functions over the bytes of one bitmap page. Bit `k` of byte `b`
//! stands for quantum `b * 8 + k` of the page's segment, so the low bit is the
//! lower address. A set bit means "allocated".
//!
//! ## Lookup Tables
//!
//! For every byte value the unaligned scan needs three facts, precomputed at
//! compile time:
//!
//! ```text
//! mask = 0b0110_0001     (bit 0 first)
//!         │││└──────── FIRST_HOLE_SIZE = 0 (bit 0 is used)
//!         ││
//!         │└────────── MAX_HOLE_SIZE   = 4 (bits 1..=4), MAX_HOLE_OFFSET = 1
//!         └─────────── LAST_HOLE_SIZE  = 1 (bit 7)
//! ```
//!
//! A hole may begin in the trailing zeros of one byte (or page) and continue
//! through the leading zeros of the next; the scans carry `hole_bits` across
//! that boundary.
//!
//! ## Two Regimes
//!
//! - Unaligned requests walk byte by byte using the tables.
//! - Page-multiple requests only consider holes that begin on a
//!   `PAGE_ALIGNED_BITMAP_STEP` byte boundary, so the resulting position is
//!   page aligned; any non-zero byte resets the hole and skips to the next
//!   boundary.

use smallvec::SmallVec;

use crate::config::{ALLOCATION_QUANTUM_BITS, PAGE_ALIGNED_BITMAP_STEP, PAGE_SIZE};

const fn build_first_hole() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut mask = 0;
    while mask < 256 {
        table[mask] = (mask as u8).trailing_zeros() as u8;
        mask += 1;
    }
    table
}

const fn build_last_hole() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut mask = 0;
    while mask < 256 {
        table[mask] = (mask as u8).leading_zeros() as u8;
        mask += 1;
    }
    table
}

const fn build_max_hole() -> ([u8; 256], [u8; 256]) {
    let mut sizes = [0u8; 256];
    let mut offsets = [0u8; 256];
    let mut mask = 0;
    while mask < 256 {
        let mut best = 0u8;
        let mut best_offset = 0u8;
        let mut run = 0u8;
        let mut bit = 0u8;
        while bit < 8 {
            if mask & (1 << bit) == 0 {
                run += 1;
                if run > best {
                    best = run;
                    best_offset = bit + 1 - run;
                }
            } else {
                run = 0;
            }
            bit += 1;
        }
        sizes[mask] = best;
        offsets[mask] = best_offset;
        mask += 1;
    }
    (sizes, offsets)
}

pub(crate) const FIRST_HOLE_SIZE: [u8; 256] = build_first_hole();
pub(crate) const LAST_HOLE_SIZE: [u8; 256] = build_last_hole();
pub(crate) const MAX_HOLE_SIZE: [u8; 256] = build_max_hole().0;
pub(crate) const MAX_HOLE_OFFSET: [u8; 256] = build_max_hole().1;

/// Ranges claimed by allocations that are still in flight.
#[derive(Debug, Default)]
pub(crate) struct Reservations {
    chain: SmallVec<[(u64, u64); 8]>,
}

impl Reservations {
    pub fn push(&mut self, pos: u64, size: u64) {
        self.chain.push((pos, size));
    }

    pub fn pop(&mut self) {
        self.chain.pop();
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn overlaps(&self, pos: u64, size: u64) -> bool {
        self.chain
            .iter()
            .any(|&(start, len)| pos < start + len && start < pos + size)
    }
}

/// Parameters shared by both scans.
#[derive(Debug, Clone, Copy)]
pub(crate) struct HoleQuery {
    pub page: u32,
    pub obj_bits: u64,
    pub size: u64,
    pub hole_bits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HoleScan {
    /// Hole found at `pos`; `offset` is the byte to resume from next time.
    Found { pos: u64, offset: usize },
    /// Page exhausted; `hole_bits` free quanta end the page.
    Exhausted { hole_bits: u64 },
}

fn quantum_to_pos(page: u32, byte: usize, back_bits: u64) -> u64 {
    let bit = (page as u64 * PAGE_SIZE as u64 + byte as u64) * 8 - back_bits;
    bit << ALLOCATION_QUANTUM_BITS
}

pub(crate) fn scan_unaligned(
    data: &[u8],
    mut offset: usize,
    query: HoleQuery,
    reserved: &Reservations,
) -> HoleScan {
    let HoleQuery {
        page,
        obj_bits,
        size,
        mut hole_bits,
    } = query;

    while offset < PAGE_SIZE {
        let mask = data[offset] as usize;

        if hole_bits + FIRST_HOLE_SIZE[mask] as u64 >= obj_bits {
            let pos = quantum_to_pos(page, offset, hole_bits);
            if reserved.overlaps(pos, size) {
                offset += obj_bits.div_ceil(8) as usize;
                hole_bits = 0;
                continue;
            }
            return HoleScan::Found { pos, offset };
        }

        if MAX_HOLE_SIZE[mask] as u64 >= obj_bits {
            let pos = quantum_to_pos(page, offset, 0)
                + ((MAX_HOLE_OFFSET[mask] as u64) << ALLOCATION_QUANTUM_BITS);
            if reserved.overlaps(pos, size) {
                offset += 1;
                hole_bits = 0;
                continue;
            }
            return HoleScan::Found { pos, offset };
        }

        offset += 1;
        let last = LAST_HOLE_SIZE[mask] as u64;
        hole_bits = if last == 8 { hole_bits + 8 } else { last };
    }

    HoleScan::Exhausted { hole_bits }
}

pub(crate) fn scan_aligned(
    data: &[u8],
    mut offset: usize,
    query: HoleQuery,
    reserved: &Reservations,
) -> HoleScan {
    let HoleQuery {
        page,
        obj_bits,
        size,
        mut hole_bits,
    } = query;

    while offset < PAGE_SIZE {
        let used = data[offset] != 0;
        offset += 1;

        if used {
            offset = offset.next_multiple_of(PAGE_ALIGNED_BITMAP_STEP);
            hole_bits = 0;
            continue;
        }

        hole_bits += 8;
        if hole_bits == obj_bits {
            let pos = quantum_to_pos(page, offset, hole_bits);
            if reserved.overlaps(pos, size) {
                hole_bits = 0;
                continue;
            }
            return HoleScan::Found { pos, offset };
        }
    }

    HoleScan::Exhausted { hole_bits }
}

/// Sets or clears `count` bits starting at bit `first` of `bytes`.
pub(crate) fn update_bits(bytes: &mut [u8], first: usize, count: usize, set: bool) {
    let mut bit = first;
    let end = first + count;

    while bit < end && bit % 8 != 0 {
        apply(&mut bytes[bit / 8], 1 << (bit % 8), set);
        bit += 1;
    }

    let whole = (end - bit) / 8;
    let fill = if set { 0xFF } else { 0x00 };
    bytes[bit / 8..bit / 8 + whole].fill(fill);
    bit += whole * 8;

    while bit < end {
        apply(&mut bytes[bit / 8], 1 << (bit % 8), set);
        bit += 1;
    }
}

fn apply(byte: &mut u8, mask: u8, set: bool) {
    if set {
        *byte |= mask;
    } else {
        *byte &= !mask;
    }
}

pub(crate) fn count_set_bits(bytes: &[u8]) -> u64 {
    bytes.iter().map(|b| b.count_ones() as u64).sum()
}
