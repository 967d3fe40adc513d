//! # Garbage Collection Tests
//!
//! Reachability-based reclamation through the public API. Object graphs are
//! built with [`ShapeLayout`]: `NODE` records carry a reference table,
//! `INDEX` records additionally own page objects, everything else is opaque.

use shadowstore::error::error_kind;
use shadowstore::{Database, MemoryFile, ShapeLayout, StorageError, TransactionMode, TypeShape};
use std::sync::Arc;
use tempfile::tempdir;

const BLOB: u32 = 1;
const NODE: u32 = 2;
const INDEX: u32 = 3;

fn layout() -> Arc<ShapeLayout> {
    Arc::new(
        ShapeLayout::new(TypeShape::Opaque)
            .with_shape(NODE, TypeShape::References)
            .with_shape(INDEX, TypeShape::IndexNode),
    )
}

fn memory_db() -> Database {
    Database::builder()
        .in_memory(MemoryFile::new())
        .layout(layout())
        .open()
        .unwrap()
}

fn is_deleted(db: &Database, oid: u32) -> bool {
    match db.load(oid) {
        Ok(_) => false,
        Err(err) => matches!(error_kind(&err), Some(StorageError::DeletedObject(_))),
    }
}

/// Stores a chain `chain[0] -> chain[1] -> ...` rooted at `chain[0]`.
fn build_chain(db: &Database, len: usize) -> Vec<u32> {
    let mut txn = db.begin(TransactionMode::Exclusive).unwrap();
    let chain: Vec<u32> = (0..len).map(|_| txn.allocate().unwrap()).collect();
    for (i, &oid) in chain.iter().enumerate() {
        let next: Vec<u32> = chain.get(i + 1).copied().into_iter().collect();
        let body = ShapeLayout::encode_references(&next, format!("node {i}").as_bytes());
        txn.store(oid, NODE, &body).unwrap();
    }
    txn.set_root(chain[0]).unwrap();
    txn.end().unwrap();
    chain
}

#[test]
fn orphans_are_reclaimed_and_the_chain_survives() {
    let db = memory_db();
    let chain = build_chain(&db, 100);

    let mut txn = db.begin(TransactionMode::Exclusive).unwrap();
    let orphans: Vec<u32> = (0..50)
        .map(|_| txn.insert(BLOB, &[7u8; 500]).unwrap())
        .collect();
    txn.end().unwrap();
    let used = db.used_size().unwrap();

    assert_eq!(db.gc().unwrap(), 50);
    assert!(db.commit().unwrap());

    assert!(db.used_size().unwrap() < used);
    for &oid in &orphans {
        assert!(is_deleted(&db, oid), "orphan {oid} still loadable");
    }
    for (i, &oid) in chain.iter().enumerate() {
        let record = db.load(oid).unwrap();
        assert_eq!(record.type_id, NODE);
        assert!(record.body.ends_with(format!("node {i}").as_bytes()));
    }
}

#[test]
fn cutting_a_chain_reclaims_its_tail() {
    let db = memory_db();
    let chain = build_chain(&db, 60);

    let mut txn = db.begin(TransactionMode::Exclusive).unwrap();
    let body = ShapeLayout::encode_references(&[], b"node 19");
    txn.store(chain[19], NODE, &body).unwrap();
    txn.end().unwrap();

    assert_eq!(db.gc().unwrap(), 40);
    db.commit().unwrap();

    assert!(chain[..20].iter().all(|&oid| db.load(oid).is_ok()));
    assert!(chain[20..].iter().all(|&oid| is_deleted(&db, oid)));
}

#[test]
fn reclaimed_index_node_releases_its_pages() {
    let db = memory_db();

    let mut txn = db.begin(TransactionMode::Exclusive).unwrap();
    let kept_page = txn.allocate_page().unwrap();
    txn.write_page(kept_page, b"kept page").unwrap();
    let kept = txn
        .insert(INDEX, &ShapeLayout::encode_index_node(&[], &[kept_page], b""))
        .unwrap();

    let pages: Vec<u32> = (0..3)
        .map(|i| {
            let page = txn.allocate_page().unwrap();
            txn.write_page(page, &[i as u8; 64]).unwrap();
            page
        })
        .collect();
    let child = txn.insert(BLOB, b"child").unwrap();
    let dropped = txn
        .insert(INDEX, &ShapeLayout::encode_index_node(&[child], &pages, b""))
        .unwrap();
    txn.set_root(kept).unwrap();
    txn.end().unwrap();

    // the unreachable node and its child; pages are not counted
    assert_eq!(db.gc().unwrap(), 2);
    db.commit().unwrap();

    assert!(is_deleted(&db, dropped));
    assert!(is_deleted(&db, child));

    let mut txn = db.begin(TransactionMode::Exclusive).unwrap();
    for &page in &pages {
        let err = txn.read_page(page).unwrap_err();
        assert!(matches!(
            error_kind(&err),
            Some(StorageError::DeletedObject(_))
        ));
    }
    assert_eq!(&txn.read_page(kept_page).unwrap()[..9], b"kept page");
    txn.end().unwrap();
}

#[test]
fn background_worker_reclaims_committed_garbage() {
    let dir = tempdir().unwrap();
    let db = Database::builder()
        .path(dir.path().join("objects.db"))
        .layout(layout())
        .gc_threshold(Some(16 * 1024))
        .background_gc(true)
        .reuse_oid(false)
        .open()
        .unwrap();

    let mut txn = db.begin(TransactionMode::Exclusive).unwrap();
    let root = txn.insert(BLOB, b"root").unwrap();
    txn.set_root(root).unwrap();
    txn.end().unwrap();

    let mut batches = Vec::new();
    for _ in 0..10 {
        let mut txn = db.begin(TransactionMode::Exclusive).unwrap();
        let batch: Vec<u32> = (0..20)
            .map(|_| txn.insert(BLOB, &[0u8; 1024]).unwrap())
            .collect();
        txn.end().unwrap();
        batches.push(batch);
    }

    // every batch but the last was committed before the last request
    db.await_background_gc().unwrap();
    db.commit().unwrap();

    let (_, earlier) = batches.split_last().unwrap();
    for &oid in earlier.iter().flatten() {
        assert!(is_deleted(&db, oid), "object {oid} survived the collector");
    }
    assert_eq!(&*db.load(root).unwrap().body, b"root");
    db.close().unwrap();
}
