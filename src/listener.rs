//! Observability hooks.
//!
//! A listener is told about notable engine events. It is invoked while the
//! engine lock is held, so implementations must not call back into the
//! database. Every method has an empty default.

pub trait StorageListener: Send + Sync {
    /// The file was not closed cleanly; a recovery pass follows.
    fn database_corrupted(&self) {}

    /// The shadow root and index were rebuilt from the committed root.
    fn recovery_completed(&self) {}

    fn gc_started(&self) {}

    fn gc_completed(&self, _reclaimed: usize) {}

    /// A commit made `transaction_id` durable.
    fn on_transaction_commit(&self, _transaction_id: u64) {}

    fn on_transaction_rollback(&self) {}
}
