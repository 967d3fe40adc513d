//! # Object Layout Reflector
//!
//! The engine never interprets record bodies. Whenever it needs to know how
//! large a stored record is, which objects it points to, or which page objects
//! it owns, it asks an [`ObjectLayout`]:
//!
//! ```text
//!            size_of(prefix)            for_each_reference(record)
//! commit ───────────────────> layout <─────────────────────────── GC mark
//!            (free old copy)            for_each_owned_page(record)
//!                                    <─────────────────────────── GC sweep
//! ```
//!
//! ## ShapeLayout
//!
//! The shipped implementation maps each `type_id` to a closed [`TypeShape`]
//! and decodes bodies accordingly:
//!
//! ```text
//! Opaque      body = payload
//! References  body = n: u32 | oid: u32 * n | payload
//! IndexNode   body = n: u32 | child: u32 * n | m: u32 | page: u32 * m | payload
//! ```
//!
//! All integers are little-endian. A truncated reference table is read up to
//! the last complete entry. Type ids that were never registered fall back to
//! the shape given at construction, `Opaque` for [`ShapeLayout::default`], so
//! an unknown body never keeps other objects alive by accident.

use eyre::Result;
use hashbrown::HashMap;

use crate::storage::{RecordHeader, RECORD_HEADER_SIZE};
use crate::Oid;

pub trait ObjectLayout: Send + Sync {
    /// Stored size in bytes of the record whose first bytes are `prefix`.
    fn size_of(&self, prefix: &[u8]) -> Result<u64> {
        Ok(RecordHeader::from_bytes(prefix)?.size() as u64)
    }

    /// Calls `visit` with every object id `record` refers to.
    fn for_each_reference(&self, record: &[u8], visit: &mut dyn FnMut(Oid));

    /// Calls `visit` with every page object owned by `record`. Owned pages are
    /// released together with their owner.
    fn for_each_owned_page(&self, _record: &[u8], _visit: &mut dyn FnMut(Oid)) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeShape {
    Opaque,
    References,
    IndexNode,
}

#[derive(Debug, Clone)]
pub struct ShapeLayout {
    shapes: HashMap<u32, TypeShape>,
    fallback: TypeShape,
}

impl Default for ShapeLayout {
    fn default() -> Self {
        Self::new(TypeShape::Opaque)
    }
}

impl ShapeLayout {
    /// Layout where unregistered type ids decode as `fallback`.
    pub fn new(fallback: TypeShape) -> Self {
        Self {
            shapes: HashMap::new(),
            fallback,
        }
    }

    pub fn with_shape(mut self, type_id: u32, shape: TypeShape) -> Self {
        self.register(type_id, shape);
        self
    }

    pub fn register(&mut self, type_id: u32, shape: TypeShape) {
        self.shapes.insert(type_id, shape);
    }

    pub fn shape_of(&self, type_id: u32) -> TypeShape {
        self.shapes.get(&type_id).copied().unwrap_or(self.fallback)
    }

    /// Body for a `References` record.
    pub fn encode_references(refs: &[Oid], payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(4 + refs.len() * 4 + payload.len());
        push_table(&mut body, refs);
        body.extend_from_slice(payload);
        body
    }

    /// Body for an `IndexNode` record.
    pub fn encode_index_node(children: &[Oid], pages: &[Oid], payload: &[u8]) -> Vec<u8> {
        let mut body =
            Vec::with_capacity(8 + (children.len() + pages.len()) * 4 + payload.len());
        push_table(&mut body, children);
        push_table(&mut body, pages);
        body.extend_from_slice(payload);
        body
    }

    /// Opaque payload that follows the reference tables of `body`.
    pub fn payload<'a>(&self, type_id: u32, body: &'a [u8]) -> &'a [u8] {
        match self.shape_of(type_id) {
            TypeShape::Opaque => body,
            TypeShape::References => table(body).1,
            TypeShape::IndexNode => table(table(body).1).1,
        }
    }

    /// References stored in `body`, in order.
    pub fn references(&self, type_id: u32, body: &[u8]) -> Vec<Oid> {
        let mut refs = Vec::new();
        self.visit_body(type_id, body, &mut |oid| refs.push(oid), &mut |_| {});
        refs
    }

    fn visit_body(
        &self,
        type_id: u32,
        body: &[u8],
        refs: &mut dyn FnMut(Oid),
        pages: &mut dyn FnMut(Oid),
    ) {
        match self.shape_of(type_id) {
            TypeShape::Opaque => {}
            TypeShape::References => {
                let (entries, _) = table(body);
                entries.iter().for_each(|&oid| refs(oid));
            }
            TypeShape::IndexNode => {
                let (children, rest) = table(body);
                children.iter().for_each(|&oid| refs(oid));
                let (owned, _) = table(rest);
                owned.iter().for_each(|&oid| pages(oid));
            }
        }
    }
}

impl ObjectLayout for ShapeLayout {
    fn for_each_reference(&self, record: &[u8], visit: &mut dyn FnMut(Oid)) {
        if let Some((type_id, body)) = split_record(record) {
            self.visit_body(type_id, body, visit, &mut |_| {});
        }
    }

    fn for_each_owned_page(&self, record: &[u8], visit: &mut dyn FnMut(Oid)) {
        if let Some((type_id, body)) = split_record(record) {
            self.visit_body(type_id, body, &mut |_| {}, visit);
        }
    }
}

fn split_record(record: &[u8]) -> Option<(u32, &[u8])> {
    let header = RecordHeader::from_bytes(record).ok()?;
    let end = (header.size() as usize).clamp(RECORD_HEADER_SIZE, record.len());
    Some((header.type_id(), &record[RECORD_HEADER_SIZE..end]))
}

fn push_table(out: &mut Vec<u8>, oids: &[Oid]) {
    out.extend_from_slice(&(oids.len() as u32).to_le_bytes());
    for oid in oids {
        out.extend_from_slice(&oid.to_le_bytes());
    }
}

/// Splits a `count | entries` table off the front of `bytes`.
fn table(bytes: &[u8]) -> (Vec<Oid>, &[u8]) {
    let Some(count) = bytes.get(..4) else {
        return (Vec::new(), &[]);
    };
    let count = u32::from_le_bytes([count[0], count[1], count[2], count[3]]) as usize;
    let available = (bytes.len() - 4) / 4;
    let n = count.min(available);

    let entries = bytes[4..4 + n * 4]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    (entries, &bytes[4 + n * 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    fn record(type_id: u32, body: &[u8]) -> Vec<u8> {
        let size = (RECORD_HEADER_SIZE + body.len()) as u32;
        let mut bytes = RecordHeader::new(size, type_id).as_bytes().to_vec();
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn size_of_reads_record_header() {
        let layout = ShapeLayout::default();
        let rec = record(1, &[0u8; 40]);

        assert_eq!(layout.size_of(&rec).unwrap(), 48);
    }

    #[test]
    fn references_shape_visits_table_entries() {
        let layout = ShapeLayout::default().with_shape(9, TypeShape::References);
        let body = ShapeLayout::encode_references(&[4200, 4201], b"tail");
        let rec = record(9, &body);

        let mut seen = Vec::new();
        layout.for_each_reference(&rec, &mut |oid| seen.push(oid));

        assert_eq!(seen, vec![4200, 4201]);
        assert_eq!(layout.payload(9, &body), b"tail");
    }

    #[test]
    fn opaque_shape_has_no_references() {
        let layout = ShapeLayout::new(TypeShape::References).with_shape(2, TypeShape::Opaque);
        let body = ShapeLayout::encode_references(&[4200], &[]);
        let rec = record(2, &body);

        let mut seen = Vec::new();
        layout.for_each_reference(&rec, &mut |oid| seen.push(oid));

        assert!(seen.is_empty());
    }

    #[test]
    fn unregistered_types_are_opaque_by_default() {
        let layout = ShapeLayout::default();
        let body = ShapeLayout::encode_index_node(&[4200], &[4300], b"tail");
        let rec = record(11, &body);

        let mut seen = Vec::new();
        layout.for_each_reference(&rec, &mut |oid| seen.push(oid));
        layout.for_each_owned_page(&rec, &mut |oid| seen.push(oid));

        assert!(seen.is_empty());
        assert_eq!(layout.shape_of(11), TypeShape::Opaque);
        assert_eq!(layout.payload(11, &body), &body[..]);
    }

    #[test]
    fn index_node_separates_children_from_owned_pages() {
        let layout = ShapeLayout::default().with_shape(5, TypeShape::IndexNode);
        let body = ShapeLayout::encode_index_node(&[5000, 5001], &[6000], b"keys");
        let rec = record(5, &body);

        let mut children = Vec::new();
        let mut pages = Vec::new();
        layout.for_each_reference(&rec, &mut |oid| children.push(oid));
        layout.for_each_owned_page(&rec, &mut |oid| pages.push(oid));

        assert_eq!(children, vec![5000, 5001]);
        assert_eq!(pages, vec![6000]);
        assert_eq!(layout.payload(5, &body), b"keys");
    }

    #[test]
    fn truncated_table_stops_at_last_complete_entry() {
        let layout = ShapeLayout::new(TypeShape::References);
        let mut body = 10u32.to_le_bytes().to_vec();
        body.extend_from_slice(&4300u32.to_le_bytes());
        body.extend_from_slice(&[1, 2]);

        assert_eq!(layout.references(1, &body), vec![4300]);
    }
}
