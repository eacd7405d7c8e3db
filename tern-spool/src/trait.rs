use async_trait::async_trait;

use crate::{EntryId, QueueEntry};

/// Durable storage for queue entries.
///
/// Each entry is in exactly one of two states: pending, or in flight (claimed
/// by a worker). Claims do not survive a restart; `recover` returns every
/// claimed entry to pending.
#[async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Persist a new entry. It must be durable once this returns.
    async fn write(&self, entry: &QueueEntry) -> crate::Result<()>;

    /// IDs of every stored entry, oldest first.
    async fn list(&self) -> crate::Result<Vec<EntryId>>;

    async fn read(&self, id: &EntryId) -> crate::Result<QueueEntry>;

    /// Replace the stored state of an existing entry.
    async fn update(&self, entry: &QueueEntry) -> crate::Result<()>;

    async fn delete(&self, id: &EntryId) -> crate::Result<()>;

    /// Atomically mark an entry in flight.
    ///
    /// Returns `false` when another worker already holds the claim.
    async fn claim(&self, id: &EntryId) -> crate::Result<bool>;

    /// Return a claimed entry to pending.
    async fn release(&self, id: &EntryId) -> crate::Result<()>;

    /// Return every in-flight entry to pending, returning how many there were.
    async fn recover(&self) -> crate::Result<usize>;
}
