//! # Object Locks
//!
//! Per-object write locks for serializable transactions. A transaction locks
//! an object the first time it stores or deletes it and keeps the lock until
//! it ends, so two serializable writers of the same object run one after the
//! other.
//!
//! ```text
//! txn 7: store(A) ── lock A ── store(B) ── lock B ── end ── release A, B
//! txn 9:     store(B) ──────────── waits ─────────────────┘ lock B ── ...
//! ```
//!
//! Locks are exclusive and reentrant for the owning transaction. There is no
//! deadlock detection: two transactions that lock the same pair of objects in
//! opposite order wait for each other forever.

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use super::transaction::TxnId;
use crate::Oid;

#[derive(Default)]
pub(crate) struct ObjectLocks {
    owners: Mutex<HashMap<Oid, TxnId>>,
    released: Condvar,
}

impl ObjectLocks {
    /// Blocks until `oid` is free or already owned by `txn`, then owns it.
    /// Returns true when the lock was newly taken.
    pub fn acquire(&self, oid: Oid, txn: TxnId) -> bool {
        let mut owners = self.owners.lock();
        loop {
            match owners.get(&oid) {
                None => {
                    owners.insert(oid, txn);
                    return true;
                }
                Some(&owner) if owner == txn => return false,
                Some(_) => self.released.wait(&mut owners),
            }
        }
    }

    pub fn release_all(&self, txn: TxnId, oids: &[Oid]) {
        if oids.is_empty() {
            return;
        }
        let mut owners = self.owners.lock();
        for oid in oids {
            if owners.get(oid) == Some(&txn) {
                owners.remove(oid);
            }
        }
        drop(owners);
        self.released.notify_all();
    }

    #[cfg(test)]
    pub fn owner(&self, oid: Oid) -> Option<TxnId> {
        self.owners.lock().get(&oid).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn lock_is_reentrant_for_its_owner() {
        let locks = ObjectLocks::default();
        assert!(locks.acquire(5000, 1));
        assert!(!locks.acquire(5000, 1));
        assert_eq!(locks.owner(5000), Some(1));

        locks.release_all(1, &[5000]);
        assert_eq!(locks.owner(5000), None);
    }

    #[test]
    fn release_ignores_locks_of_other_transactions() {
        let locks = ObjectLocks::default();
        locks.acquire(5000, 1);
        locks.release_all(2, &[5000]);
        assert_eq!(locks.owner(5000), Some(1));
    }

    #[test]
    fn second_writer_waits_for_release() {
        let locks = Arc::new(ObjectLocks::default());
        locks.acquire(5000, 1);

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                locks.acquire(5000, 2);
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        locks.release_all(1, &[5000]);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
        assert_eq!(locks.owner(5000), Some(2));
    }
}
