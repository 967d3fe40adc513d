//! # Transaction Tests
//!
//! Multi-threaded use of the three transaction modes against one database:
//!
//! - cooperative writers share one working state and one commit
//! - serializable transfers between accounts keep the total balance
//! - rollback restores every object touched since the last commit

use std::sync::Arc;
use std::thread;

use shadowstore::error::error_kind;
use shadowstore::{Database, MemoryFile, StorageError, TransactionMode};

fn memory_db() -> Database {
    Database::builder().in_memory(MemoryFile::new()).open().unwrap()
}

fn balance(db: &Database, oid: u32) -> u64 {
    let body = db.load(oid).unwrap().body;
    u64::from_le_bytes(body[..8].try_into().unwrap())
}

#[test]
fn cooperative_writers_share_one_commit() {
    let db = Arc::new(memory_db());
    let before = db.transaction_id().unwrap();

    let handles: Vec<_> = (0..8u32)
        .map(|worker| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let mut oids = Vec::new();
                for i in 0..25u32 {
                    let mut txn = db.begin(TransactionMode::Cooperative).unwrap();
                    let body = format!("{worker}:{i}");
                    oids.push((txn.insert(2, body.as_bytes()).unwrap(), body));
                    txn.end().unwrap();
                }
                oids
            })
        })
        .collect();

    let written: Vec<(u32, String)> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(written.len(), 200);
    for (oid, body) in &written {
        assert_eq!(&*db.load(*oid).unwrap().body, body.as_bytes());
    }
    // whoever left last committed the shared state
    assert!(!db.is_modified().unwrap());
    assert!(db.transaction_id().unwrap() > before);
}

#[test]
fn serializable_transfers_preserve_the_total() {
    const ACCOUNTS: usize = 6;
    const START: u64 = 1_000;

    let db = Arc::new(memory_db());
    let accounts: Vec<u32> = {
        let mut txn = db.begin(TransactionMode::Exclusive).unwrap();
        let oids = (0..ACCOUNTS)
            .map(|_| txn.insert(3, &START.to_le_bytes()).unwrap())
            .collect();
        txn.end().unwrap();
        oids
    };

    let handles: Vec<_> = (0..4usize)
        .map(|worker| {
            let db = Arc::clone(&db);
            let accounts = accounts.clone();
            thread::spawn(move || {
                for round in 0..20usize {
                    let from = accounts[(worker + round) % ACCOUNTS];
                    let to = accounts[(worker + round * 5 + 1) % ACCOUNTS];
                    if from == to {
                        continue;
                    }

                    let mut txn = db.begin(TransactionMode::Serializable).unwrap();
                    // lock both accounts in id order before reading them
                    let (first, second) = (from.min(to), from.max(to));
                    txn.store(first, 3, &[]).unwrap();
                    txn.store(second, 3, &[]).unwrap();

                    let amount = (round as u64 % 7) + 1;
                    let from_balance = balance(&db, from);
                    let to_balance = balance(&db, to);
                    if from_balance < amount {
                        txn.rollback().unwrap();
                        continue;
                    }
                    txn.store(from, 3, &(from_balance - amount).to_le_bytes())
                        .unwrap();
                    txn.store(to, 3, &(to_balance + amount).to_le_bytes())
                        .unwrap();
                    txn.end().unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let total: u64 = accounts.iter().map(|&oid| balance(&db, oid)).sum();
    assert_eq!(total, START * ACCOUNTS as u64);
    assert!(!db.is_modified().unwrap());
}

#[test]
fn rollback_restores_every_modified_object() {
    let db = memory_db();
    let oids: Vec<u32> = {
        let mut txn = db.begin(TransactionMode::Exclusive).unwrap();
        let oids = (0..40u32)
            .map(|i| txn.insert(1, &i.to_le_bytes()).unwrap())
            .collect();
        txn.end().unwrap();
        oids
    };
    let used = db.used_size().unwrap();

    let txn = db.begin(TransactionMode::Exclusive).unwrap();
    assert!(!txn.rollback().unwrap());

    let mut txn = db.begin(TransactionMode::Exclusive).unwrap();
    for (i, &oid) in oids.iter().enumerate() {
        if i % 2 == 0 {
            txn.store(oid, 1, &[0xAB; 300]).unwrap();
        } else {
            txn.deallocate(oid).unwrap();
        }
    }
    let fresh = txn.insert(1, b"new").unwrap();
    assert!(txn.rollback().unwrap());

    for (i, &oid) in oids.iter().enumerate() {
        let record = db.load(oid).unwrap();
        assert_eq!(&*record.body, &(i as u32).to_le_bytes());
    }
    assert!(db.load(fresh).is_err());
    assert_eq!(db.used_size().unwrap(), used);
    assert!(!db.is_modified().unwrap());
}

#[test]
fn page_objects_are_rejected_in_serializable_mode() {
    let db = memory_db();
    let mut txn = db.begin(TransactionMode::Serializable).unwrap();
    let err = txn.allocate_page().unwrap_err();
    assert!(matches!(
        error_kind(&err),
        Some(StorageError::InvalidOperation(_))
    ));
    assert!(!txn.end().unwrap());
}
