//! # Transactions
//!
//! Every change goes through an explicit [`Transaction`] handle obtained from
//! [`Database::begin`]. The handle carries its mode, so there is no ambient
//! per-thread transaction state.
//!
//! ## Modes
//!
//! ```text
//! Exclusive     one writer; begin waits until nobody else is active
//! Cooperative   many writers share the working state; the last one to end
//!               performs the physical commit
//! Serializable  writes are buffered on the handle, object locks are taken on
//!               first store/delete; end applies the buffer and commits it
//!               atomically
//! ```
//!
//! Exclusive and serializable transactions never overlap cooperative ones, and
//! an exclusive transaction overlaps nothing. Serializable transactions run
//! side by side; conflicting writers are ordered by [`ObjectLocks`].
//!
//! ## Cooperative Commit Schedule
//!
//! ```text
//!   end()                  commit due now
//!   end_with_delay(d)      commit due within d (earliest request wins)
//!   end_with_delay(ZERO)   commit due now, caller waits for it
//!
//!   last participant ends ──► due?  yes ──► physical commit, wake waiters
//!                                   no  ──► deferred
//!   new cooperative begin ──► due and idle ──► commits first
//!                             due and busy ──► waits for the commit
//! ```
//!
//! A deferred commit stays pending until the next cooperative begin after its
//! due time, an explicit [`Database::commit`], or close.
//!
//! ## Rollback
//!
//! Rolling back an exclusive or cooperative transaction discards the whole
//! working state, including the work of other cooperative participants. A
//! serializable rollback only drops its own buffer and the ids it allocated.
//! The same holds when applying a serializable buffer fails at end: the writes
//! already applied are reverted one by one, and concurrent serializable
//! transactions keep their reserved ids. Dropping an unfinished handle rolls
//! it back.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{bail, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::object_locks::ObjectLocks;
use super::{Database, Shared};
use crate::engine::{Engine, Record};
use crate::error::StorageError;
use crate::Oid;

pub type TxnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    Exclusive,
    Cooperative,
    Serializable,
}

#[derive(Default)]
struct MonitorState {
    exclusive: bool,
    cooperative: usize,
    serializable: usize,
    /// A physical commit started by the monitor is running.
    committing: bool,
    /// Deadline of the pending cooperative commit.
    commit_due: Option<Instant>,
    /// Completed physical commits.
    commits: u64,
}

impl MonitorState {
    fn commit_is_due(&self, now: Instant) -> bool {
        self.commit_due.is_some_and(|due| due <= now)
    }

    fn note_commit(&mut self) {
        self.commits += 1;
        self.commit_due = None;
    }
}

/// Admission control for the three transaction modes.
#[derive(Default)]
pub(crate) struct Monitor {
    state: Mutex<MonitorState>,
    changed: Condvar,
}

impl Monitor {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock()
    }

    fn wait(&self, state: &mut MutexGuard<'_, MonitorState>) {
        self.changed.wait(state);
    }

    pub fn wake_all(&self) {
        self.changed.notify_all();
    }

    /// Records a commit made outside the monitor, such as `Database::commit`.
    pub fn commit_completed(&self) {
        self.lock().note_commit();
        self.wake_all();
    }
}

enum Pending {
    Store(Record),
    Delete,
}

/// Writes of a serializable transaction, applied at `end`.
#[derive(Default)]
struct WriteBuffer {
    writes: BTreeMap<Oid, Pending>,
    created: Vec<Oid>,
    locked: SmallVec<[Oid; 16]>,
    root: Option<Oid>,
    schema_root: Option<Oid>,
}

pub struct Transaction<'db> {
    db: &'db Database,
    id: TxnId,
    mode: TransactionMode,
    active: bool,
    buffer: Option<WriteBuffer>,
}

impl Database {
    /// Starts a transaction, blocking until `mode` is admitted.
    pub fn begin(&self, mode: TransactionMode) -> Result<Transaction<'_>> {
        let shared = &self.shared;
        shared.check_open()?;
        if shared.config.multiclient && shared.config.read_only {
            shared.with_engine(|engine| engine.refresh())?;
        }

        let mut state = shared.monitor.lock();
        match mode {
            TransactionMode::Exclusive => {
                while state.exclusive
                    || state.cooperative > 0
                    || state.serializable > 0
                    || state.committing
                {
                    shared.monitor.wait(&mut state);
                }
                state.exclusive = true;
            }
            TransactionMode::Cooperative => loop {
                if state.exclusive || state.serializable > 0 || state.committing {
                    shared.monitor.wait(&mut state);
                } else if state.commit_is_due(Instant::now()) {
                    if state.cooperative == 0 {
                        shared.monitor_commit(&mut state)?;
                    } else {
                        shared.monitor.wait(&mut state);
                    }
                } else {
                    state.cooperative += 1;
                    break;
                }
            },
            TransactionMode::Serializable => {
                while state.exclusive || state.cooperative > 0 || state.committing {
                    shared.monitor.wait(&mut state);
                }
                state.serializable += 1;
            }
        }
        drop(state);

        let id = shared.next_transaction_id();
        debug!(id, ?mode, "transaction started");
        Ok(Transaction {
            db: self,
            id,
            mode,
            active: true,
            buffer: (mode == TransactionMode::Serializable).then(WriteBuffer::default),
        })
    }
}

impl Shared {
    /// Runs a physical commit on behalf of the monitor. The monitor lock is
    /// released while the commit runs; `committing` keeps newcomers out.
    fn monitor_commit(&self, state: &mut MutexGuard<'_, MonitorState>) -> Result<bool> {
        state.committing = true;
        let result = MutexGuard::unlocked(state, || self.commit_now());
        state.committing = false;
        if result.is_ok() {
            state.note_commit();
        }
        self.monitor.wake_all();
        result
    }
}

impl<'db> Transaction<'db> {
    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    fn shared(&self) -> &'db Shared {
        &self.db.shared
    }

    fn locks(&self) -> &'db ObjectLocks {
        &self.db.shared.object_locks
    }

    fn lock_object(&mut self, oid: Oid) {
        let locks = self.locks();
        if let Some(buffer) = self.buffer.as_mut() {
            if locks.acquire(oid, self.id) {
                buffer.locked.push(oid);
            }
        }
    }

    /// Reserves a new object id. The object becomes loadable once stored.
    pub fn allocate(&mut self) -> Result<Oid> {
        let oid = self.shared().with_engine(|engine| engine.allocate_id())?;
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.created.push(oid);
        }
        self.lock_object(oid);
        Ok(oid)
    }

    pub fn store(&mut self, oid: Oid, type_id: u32, body: &[u8]) -> Result<()> {
        if self.buffer.is_none() {
            return self
                .shared()
                .with_engine(|engine| engine.store(oid, type_id, body));
        }

        self.lock_object(oid);
        let record = Record {
            type_id,
            body: Arc::from(body),
        };
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.writes.insert(oid, Pending::Store(record));
        }
        Ok(())
    }

    /// Allocates an id and stores `body` under it.
    pub fn insert(&mut self, type_id: u32, body: &[u8]) -> Result<Oid> {
        let oid = self.allocate()?;
        self.store(oid, type_id, body)?;
        Ok(oid)
    }

    pub fn load(&mut self, oid: Oid) -> Result<Record> {
        if let Some(buffer) = &self.buffer {
            match buffer.writes.get(&oid) {
                Some(Pending::Store(record)) => return Ok(record.clone()),
                Some(Pending::Delete) => bail!(StorageError::DeletedObject(oid)),
                None => {}
            }
        }
        self.shared().with_engine(|engine| engine.load(oid))
    }

    pub fn deallocate(&mut self, oid: Oid) -> Result<()> {
        if self.buffer.is_none() {
            return self.shared().with_engine(|engine| engine.deallocate(oid));
        }

        self.lock_object(oid);
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.writes.insert(oid, Pending::Delete);
        }
        Ok(())
    }

    fn reject_serializable(&self, what: &'static str) -> Result<()> {
        if self.buffer.is_some() {
            bail!(StorageError::InvalidOperation(what));
        }
        Ok(())
    }

    pub fn allocate_page(&mut self) -> Result<Oid> {
        self.reject_serializable("page objects are not available in serializable transactions")?;
        self.shared().with_engine(|engine| engine.allocate_page())
    }

    pub fn read_page(&mut self, oid: Oid) -> Result<Vec<u8>> {
        self.shared().with_engine(|engine| engine.read_page(oid))
    }

    pub fn write_page(&mut self, oid: Oid, data: &[u8]) -> Result<()> {
        self.reject_serializable("page objects are not available in serializable transactions")?;
        self.shared()
            .with_engine(|engine| engine.write_page(oid, data))
    }

    pub fn free_page(&mut self, oid: Oid) -> Result<()> {
        self.reject_serializable("page objects are not available in serializable transactions")?;
        self.shared().with_engine(|engine| engine.free_page(oid))
    }

    pub fn root(&self) -> Result<Oid> {
        if let Some(root) = self.buffer.as_ref().and_then(|b| b.root) {
            return Ok(root);
        }
        self.shared().with_engine(|engine| Ok(engine.root()))
    }

    pub fn set_root(&mut self, oid: Oid) -> Result<()> {
        match self.buffer.as_mut() {
            Some(buffer) => {
                buffer.root = Some(oid);
                Ok(())
            }
            None => self.shared().with_engine(|engine| engine.set_root(oid)),
        }
    }

    pub fn schema_root(&self) -> Result<Oid> {
        if let Some(root) = self.buffer.as_ref().and_then(|b| b.schema_root) {
            return Ok(root);
        }
        self.shared().with_engine(|engine| Ok(engine.schema_root()))
    }

    pub fn set_schema_root(&mut self, oid: Oid) -> Result<()> {
        match self.buffer.as_mut() {
            Some(buffer) => {
                buffer.schema_root = Some(oid);
                Ok(())
            }
            None => self
                .shared()
                .with_engine(|engine| engine.set_schema_root(oid)),
        }
    }

    /// Commits the working state without ending the transaction. Returns
    /// false when nothing was modified.
    pub fn commit(&mut self) -> Result<bool> {
        self.reject_serializable("commit inside a serializable transaction")?;
        let committed = self.shared().commit_now()?;
        self.shared().monitor.commit_completed();
        Ok(committed)
    }

    /// Ends the transaction. Returns whether this call wrote a commit.
    pub fn end(mut self) -> Result<bool> {
        self.active = false;
        match self.mode {
            TransactionMode::Exclusive => self.end_exclusive(),
            TransactionMode::Cooperative => self.end_cooperative(None),
            TransactionMode::Serializable => self.end_serializable(),
        }
    }

    /// Ends a cooperative transaction with its commit due within `delay`.
    /// `Duration::ZERO` waits until the commit completed. Other modes end
    /// as with [`Transaction::end`].
    pub fn end_with_delay(mut self, delay: Duration) -> Result<bool> {
        if self.mode != TransactionMode::Cooperative {
            return self.end();
        }
        self.active = false;
        self.end_cooperative(Some(delay))
    }

    /// Discards the transaction's changes.
    pub fn rollback(mut self) -> Result<bool> {
        self.active = false;
        self.abort()
    }

    fn end_exclusive(&mut self) -> Result<bool> {
        let shared = self.shared();
        let result = shared.commit_now();

        let mut state = shared.monitor.lock();
        state.exclusive = false;
        if result.is_ok() {
            state.note_commit();
        }
        drop(state);
        shared.monitor.wake_all();
        result
    }

    fn end_cooperative(&mut self, delay: Option<Duration>) -> Result<bool> {
        let shared = self.shared();
        let mut state = shared.monitor.lock();
        state.cooperative -= 1;

        let now = Instant::now();
        let due = now + delay.unwrap_or(Duration::ZERO);
        state.commit_due = Some(state.commit_due.map_or(due, |d| d.min(due)));

        if state.cooperative == 0 && !state.committing && state.commit_is_due(now) {
            return shared.monitor_commit(&mut state);
        }
        shared.monitor.wake_all();

        if delay == Some(Duration::ZERO) {
            let seen = state.commits;
            while state.commits == seen && state.commit_due.is_some() {
                shared.monitor.wait(&mut state);
            }
        }
        Ok(false)
    }

    fn end_serializable(&mut self) -> Result<bool> {
        let shared = self.shared();
        let buffer = self.buffer.take().unwrap_or_default();
        let result = shared.apply(&buffer);

        self.locks().release_all(self.id, &buffer.locked);
        let mut state = shared.monitor.lock();
        state.serializable -= 1;
        if matches!(result, Ok(true)) {
            state.note_commit();
        }
        drop(state);
        shared.monitor.wake_all();
        result
    }

    fn abort(&mut self) -> Result<bool> {
        let shared = self.shared();
        match self.mode {
            TransactionMode::Exclusive => {
                let result = shared.rollback_now();
                shared.monitor.lock().exclusive = false;
                shared.monitor.wake_all();
                result
            }
            TransactionMode::Cooperative => {
                let result = shared.rollback_now();
                let mut state = shared.monitor.lock();
                state.cooperative -= 1;
                state.commit_due = None;
                drop(state);
                shared.monitor.wake_all();
                result
            }
            TransactionMode::Serializable => {
                let buffer = self.buffer.take().unwrap_or_default();
                let result = shared.discard(&buffer);
                self.locks().release_all(self.id, &buffer.locked);
                shared.monitor.lock().serializable -= 1;
                shared.monitor.wake_all();
                result.map(|()| !buffer.writes.is_empty())
            }
        }
    }
}

/// What applying one buffered write replaced, for reverting a failed apply.
enum Undo {
    Stored { oid: Oid, prior: Option<Record> },
    Deleted { oid: Oid, prior: Option<Record> },
    Root(Oid),
    SchemaRoot(Oid),
}

fn apply_writes(engine: &mut Engine, buffer: &WriteBuffer, undo: &mut Vec<Undo>) -> Result<()> {
    for (&oid, write) in &buffer.writes {
        let prior = engine.prior_version(oid)?;
        match write {
            Pending::Store(record) => {
                engine.store(oid, record.type_id, &record.body)?;
                undo.push(Undo::Stored { oid, prior });
            }
            Pending::Delete => {
                engine.deallocate(oid)?;
                undo.push(Undo::Deleted { oid, prior });
            }
        }
    }
    if let Some(root) = buffer.root {
        let previous = engine.root();
        engine.set_root(root)?;
        undo.push(Undo::Root(previous));
    }
    if let Some(root) = buffer.schema_root {
        let previous = engine.schema_root();
        engine.set_schema_root(root)?;
        undo.push(Undo::SchemaRoot(previous));
    }
    Ok(())
}

/// Puts back what `apply_writes` replaced, newest first. Work of other
/// transactions in the working state is left alone.
fn revert_writes(engine: &mut Engine, undo: Vec<Undo>) -> Result<()> {
    for step in undo.into_iter().rev() {
        match step {
            Undo::Stored { oid, prior: Some(record) } => {
                engine.store(oid, record.type_id, &record.body)?
            }
            Undo::Stored { oid, prior: None } => engine.clear_record(oid)?,
            Undo::Deleted { oid, prior } => {
                engine.reclaim_id(oid)?;
                if let Some(record) = prior {
                    engine.store(oid, record.type_id, &record.body)?;
                }
            }
            Undo::Root(oid) => engine.set_root(oid)?,
            Undo::SchemaRoot(oid) => engine.set_schema_root(oid)?,
        }
    }
    Ok(())
}

fn release_ids(engine: &mut Engine, created: &[Oid]) -> Result<()> {
    for &oid in created {
        engine.deallocate(oid)?;
    }
    Ok(())
}

impl Shared {
    /// Applies a serializable buffer and commits it under the storage write
    /// lock, so the buffer becomes durable as one transaction. A failed
    /// apply reverts its own writes and releases its own ids. The rest of the
    /// working state, including ids other serializable transactions hold, is
    /// left untouched.
    fn apply(&self, buffer: &WriteBuffer) -> Result<bool> {
        self.with_engine_exclusive(|engine| {
            let mut undo = Vec::with_capacity(buffer.writes.len());
            match apply_writes(engine, buffer, &mut undo) {
                Ok(()) => engine.commit(),
                Err(err) => {
                    let reverted = revert_writes(engine, undo)
                        .and_then(|()| release_ids(engine, &buffer.created));
                    if let Err(revert) = reverted {
                        warn!(error = %revert, "reverting a failed serializable apply also failed");
                    }
                    Err(err)
                }
            }
        })
    }

    /// Releases the ids a rolled back serializable transaction allocated.
    fn discard(&self, buffer: &WriteBuffer) -> Result<()> {
        if buffer.created.is_empty() {
            return Ok(());
        }
        self.with_engine(|engine| release_ids(engine, &buffer.created))
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        match self.abort() {
            Ok(_) => debug!(id = self.id, "unfinished transaction rolled back"),
            Err(err) => warn!(id = self.id, error = %err, "failed to roll back dropped transaction"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::error_kind;
    use crate::storage::MemoryFile;
    use std::sync::mpsc;
    use std::thread;

    fn memory_db() -> (MemoryFile, Database) {
        let file = MemoryFile::new();
        let db = Database::builder().in_memory(file.clone()).open().unwrap();
        (file, db)
    }

    #[test]
    fn exclusive_end_commits() {
        let (_file, db) = memory_db();
        let mut txn = db.begin(TransactionMode::Exclusive).unwrap();
        let oid = txn.insert(1, b"alpha").unwrap();
        assert!(txn.end().unwrap());

        let before = db.transaction_id().unwrap();
        let txn = db.begin(TransactionMode::Exclusive).unwrap();
        assert!(!txn.end().unwrap());
        assert_eq!(db.transaction_id().unwrap(), before);
        assert_eq!(&*db.load(oid).unwrap().body, b"alpha");
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let (_file, db) = memory_db();
        let oid = {
            let mut txn = db.begin(TransactionMode::Exclusive).unwrap();
            txn.insert(1, b"never committed").unwrap()
        };

        assert!(db.load(oid).is_err());
        let txn = db.begin(TransactionMode::Exclusive).unwrap();
        txn.end().unwrap();
    }

    #[test]
    fn exclusive_waits_for_the_active_writer() {
        let (_file, db) = memory_db();
        let first = db.begin(TransactionMode::Exclusive).unwrap();

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            let db = &db;
            scope.spawn(move || {
                let txn = db.begin(TransactionMode::Exclusive).unwrap();
                tx.send(()).unwrap();
                txn.end().unwrap();
            });

            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
            first.end().unwrap();
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        });
    }

    #[test]
    fn last_cooperative_participant_commits() {
        let (_file, db) = memory_db();
        let start = db.transaction_id().unwrap();

        let mut a = db.begin(TransactionMode::Cooperative).unwrap();
        let mut b = db.begin(TransactionMode::Cooperative).unwrap();
        let x = a.insert(1, b"from a").unwrap();
        let y = b.insert(1, b"from b").unwrap();

        assert!(!a.end().unwrap());
        assert_eq!(db.transaction_id().unwrap(), start);
        assert!(b.end().unwrap());
        assert_eq!(db.transaction_id().unwrap(), start + 1);

        assert_eq!(&*db.load(x).unwrap().body, b"from a");
        assert_eq!(&*db.load(y).unwrap().body, b"from b");
    }

    #[test]
    fn delayed_commit_is_performed_by_the_next_cooperative_begin() {
        let (_file, db) = memory_db();
        let start = db.transaction_id().unwrap();

        let mut txn = db.begin(TransactionMode::Cooperative).unwrap();
        txn.insert(1, b"batched").unwrap();
        assert!(!txn.end_with_delay(Duration::from_millis(20)).unwrap());
        assert_eq!(db.transaction_id().unwrap(), start);

        thread::sleep(Duration::from_millis(40));
        let txn = db.begin(TransactionMode::Cooperative).unwrap();
        assert_eq!(db.transaction_id().unwrap(), start + 1);
        txn.end().unwrap();
    }

    #[test]
    fn zero_delay_waits_for_the_shared_commit() {
        let (_file, db) = memory_db();
        let start = db.transaction_id().unwrap();
        let mut a = db.begin(TransactionMode::Cooperative).unwrap();
        let b = db.begin(TransactionMode::Cooperative).unwrap();
        a.insert(1, b"shared").unwrap();

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            scope.spawn(move || {
                a.end_with_delay(Duration::ZERO).unwrap();
                tx.send(()).unwrap();
            });

            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
            assert!(b.end().unwrap());
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        });
        assert_eq!(db.transaction_id().unwrap(), start + 1);
    }

    #[test]
    fn serializable_buffers_until_end() {
        let (_file, db) = memory_db();
        let mut setup = db.begin(TransactionMode::Exclusive).unwrap();
        let oid = setup.insert(1, b"v1").unwrap();
        setup.end().unwrap();

        let mut txn = db.begin(TransactionMode::Serializable).unwrap();
        txn.store(oid, 1, b"v2").unwrap();
        assert_eq!(&*txn.load(oid).unwrap().body, b"v2");
        assert_eq!(&*db.load(oid).unwrap().body, b"v1");
        assert_eq!(db.shared.object_locks.owner(oid), Some(txn.id()));

        assert!(txn.end().unwrap());
        assert_eq!(&*db.load(oid).unwrap().body, b"v2");
        assert_eq!(db.shared.object_locks.owner(oid), None);
    }

    #[test]
    fn serializable_rollback_discards_buffer() {
        let (_file, db) = memory_db();
        let mut setup = db.begin(TransactionMode::Exclusive).unwrap();
        let kept = setup.insert(1, b"kept").unwrap();
        setup.end().unwrap();

        let mut txn = db.begin(TransactionMode::Serializable).unwrap();
        txn.store(kept, 1, b"overwritten").unwrap();
        txn.deallocate(kept).unwrap();
        let fresh = txn.insert(1, b"fresh").unwrap();
        assert!(matches!(
            error_kind(&txn.load(kept).unwrap_err()),
            Some(StorageError::DeletedObject(_))
        ));
        assert!(txn.rollback().unwrap());

        assert_eq!(&*db.load(kept).unwrap().body, b"kept");
        assert!(db.load(fresh).is_err());
    }

    #[test]
    fn failed_serializable_end_leaves_other_transactions_intact() {
        let (_file, db) = memory_db();
        let mut setup = db.begin(TransactionMode::Exclusive).unwrap();
        let kept = setup.insert(1, b"kept").unwrap();
        setup.end().unwrap();

        let mut sibling = db.begin(TransactionMode::Serializable).unwrap();
        let fresh = sibling.insert(1, b"fresh").unwrap();

        let mut failing = db.begin(TransactionMode::Serializable).unwrap();
        let created = failing.insert(1, b"created").unwrap();
        failing.store(kept, 1, b"overwritten").unwrap();
        failing.deallocate(1_000_000).unwrap();

        let err = failing.end().unwrap_err();
        assert_eq!(
            error_kind(&err),
            Some(&StorageError::InvalidObjectId(1_000_000))
        );
        assert_eq!(&*db.load(kept).unwrap().body, b"kept");
        assert!(matches!(
            error_kind(&db.load(created).unwrap_err()),
            Some(StorageError::DeletedObject(_))
        ));
        assert_eq!(db.shared.object_locks.owner(kept), None);

        assert!(sibling.end().unwrap());
        assert_eq!(&*db.load(fresh).unwrap().body, b"fresh");
        assert_eq!(&*db.load(kept).unwrap().body, b"kept");
    }

    #[test]
    fn failed_serializable_delete_is_restored() {
        let (_file, db) = memory_db();
        let mut setup = db.begin(TransactionMode::Exclusive).unwrap();
        let first = setup.insert(1, b"first").unwrap();
        let second = setup.insert(1, b"second").unwrap();
        setup.set_root(first).unwrap();
        setup.end().unwrap();

        let mut txn = db.begin(TransactionMode::Serializable).unwrap();
        txn.deallocate(first).unwrap();
        txn.deallocate(second).unwrap();
        txn.set_root(second).unwrap();
        txn.store(1_000_000, 1, b"out of range").unwrap();

        assert!(txn.end().is_err());
        assert_eq!(&*db.load(first).unwrap().body, b"first");
        assert_eq!(&*db.load(second).unwrap().body, b"second");
        assert_eq!(db.root().unwrap(), first);

        let mut txn = db.begin(TransactionMode::Exclusive).unwrap();
        let third = txn.insert(1, b"third").unwrap();
        assert!(third != first && third != second);
        txn.end().unwrap();
    }

    #[test]
    fn commit_inside_serializable_is_invalid() {
        let (_file, db) = memory_db();
        let mut txn = db.begin(TransactionMode::Serializable).unwrap();
        let err = txn.commit().unwrap_err();
        assert!(matches!(
            error_kind(&err),
            Some(StorageError::InvalidOperation(_))
        ));
        assert!(txn.allocate_page().is_err());
        txn.end().unwrap();
    }

    #[test]
    fn serializable_writers_of_one_object_are_ordered() {
        let (_file, db) = memory_db();
        let mut setup = db.begin(TransactionMode::Exclusive).unwrap();
        let counter = setup.insert(1, &0u64.to_le_bytes()).unwrap();
        setup.end().unwrap();

        thread::scope(|scope| {
            for _ in 0..4 {
                let db = &db;
                scope.spawn(move || {
                    for _ in 0..10 {
                        let mut txn = db.begin(TransactionMode::Serializable).unwrap();
                        // lock first, then read the committed value
                        txn.store(counter, 1, &[]).unwrap();
                        let current = db.load(counter).unwrap();
                        let value = u64::from_le_bytes(current.body[..8].try_into().unwrap());
                        txn.store(counter, 1, &(value + 1).to_le_bytes()).unwrap();
                        txn.end().unwrap();
                    }
                });
            }
        });

        let body = db.load(counter).unwrap().body;
        assert_eq!(u64::from_le_bytes(body[..8].try_into().unwrap()), 40);
    }

    #[test]
    fn cooperative_waits_for_serializable() {
        let (_file, db) = memory_db();
        let txn = db.begin(TransactionMode::Serializable).unwrap();

        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel();
            let db = &db;
            scope.spawn(move || {
                let coop = db.begin(TransactionMode::Cooperative).unwrap();
                tx.send(()).unwrap();
                coop.end().unwrap();
            });

            assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
            txn.end().unwrap();
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        });
    }
}
