use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::{EntryId, QueueEntry, SpoolError, r#trait::BackingStore};

#[derive(Debug, Default)]
pub(crate) struct Entries {
    pub(crate) entries: HashMap<EntryId, QueueEntry>,
    pub(crate) claimed: HashSet<EntryId>,
}

/// In-memory backing store
///
/// Entries and claims live behind a single `RwLock`, so a claim is atomic
/// with respect to every other operation. Nothing survives a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackingStore {
    pub(crate) inner: Arc<RwLock<Entries>>,
    /// Maximum number of entries to store (None = unlimited)
    capacity: Option<usize>,
}

impl MemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// Recovers gracefully if the lock is poisoned.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .claimed
            .len()
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn write(&self, entry: &QueueEntry) -> crate::Result<()> {
        let mut inner = self.inner.write()?;

        if inner.entries.contains_key(&entry.id) {
            return Err(SpoolError::AlreadyExists(entry.id));
        }

        if let Some(capacity) = self.capacity
            && inner.entries.len() >= capacity
        {
            return Err(SpoolError::Full(capacity));
        }

        inner.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn list(&self) -> crate::Result<Vec<EntryId>> {
        let mut ids: Vec<_> = self.inner.read()?.entries.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    async fn read(&self, id: &EntryId) -> crate::Result<QueueEntry> {
        self.inner
            .read()?
            .entries
            .get(id)
            .cloned()
            .ok_or(SpoolError::NotFound(*id))
    }

    async fn update(&self, entry: &QueueEntry) -> crate::Result<()> {
        let mut inner = self.inner.write()?;

        match inner.entries.get_mut(&entry.id) {
            Some(stored) => {
                *stored = entry.clone();
                Ok(())
            }
            None => Err(SpoolError::NotFound(entry.id)),
        }
    }

    async fn delete(&self, id: &EntryId) -> crate::Result<()> {
        let mut inner = self.inner.write()?;

        inner.claimed.remove(id);
        inner
            .entries
            .remove(id)
            .map(|_| ())
            .ok_or(SpoolError::NotFound(*id))
    }

    async fn claim(&self, id: &EntryId) -> crate::Result<bool> {
        let mut inner = self.inner.write()?;

        if !inner.entries.contains_key(id) {
            return Err(SpoolError::NotFound(*id));
        }

        Ok(inner.claimed.insert(*id))
    }

    async fn release(&self, id: &EntryId) -> crate::Result<()> {
        self.inner.write()?.claimed.remove(id);
        Ok(())
    }

    async fn recover(&self) -> crate::Result<usize> {
        let mut inner = self.inner.write()?;
        let recovered = inner.claimed.len();
        inner.claimed.clear();
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use tern_common::{Address, Mail, ReversePath};

    use super::*;
    use crate::Route;

    fn entry(body: &str) -> QueueEntry {
        let recipient = Address::new("john", "example.com");
        let mail = Mail::new(
            ReversePath::Mailbox(Address::new("sender", "example.org")),
            vec![recipient.clone()],
            body.as_bytes().to_vec(),
        );
        QueueEntry::new(mail, recipient, Route::Transmit)
    }

    #[tokio::test]
    async fn basic_operations() {
        let store = MemoryBackingStore::new();
        let mut entry = entry("test message");

        store.write(&entry).await.expect("Failed to write");
        assert_eq!(store.list().await.expect("list"), vec![entry.id]);

        let read = store.read(&entry.id).await.expect("Failed to read");
        assert_eq!(read.mail.body(), b"test message");

        entry.attempts = 3;
        store.update(&entry).await.expect("Failed to update");
        assert_eq!(store.read(&entry.id).await.expect("read").attempts, 3);

        store.delete(&entry.id).await.expect("Failed to delete");
        assert!(store.is_empty());
        assert!(matches!(
            store.read(&entry.id).await,
            Err(SpoolError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn capacity_limit() {
        let store = MemoryBackingStore::with_capacity(2);

        store.write(&entry("1")).await.expect("first write");
        store.write(&entry("2")).await.expect("second write");

        let third = entry("3");
        assert!(matches!(
            store.write(&third).await,
            Err(SpoolError::Full(2))
        ));

        let ids = store.list().await.expect("list");
        store.delete(&ids[0]).await.expect("delete");
        store.write(&third).await.expect("write after delete");
    }

    #[tokio::test]
    async fn duplicate_writes_are_refused() {
        let store = MemoryBackingStore::new();
        let entry = entry("once");

        store.write(&entry).await.expect("write");
        assert!(matches!(
            store.write(&entry).await,
            Err(SpoolError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn claims_are_exclusive() {
        let store = MemoryBackingStore::new();
        let entry = entry("claimed");
        store.write(&entry).await.expect("write");

        assert!(store.claim(&entry.id).await.expect("claim"));
        assert!(!store.claim(&entry.id).await.expect("second claim"));
        assert_eq!(store.in_flight(), 1);

        store.release(&entry.id).await.expect("release");
        assert!(store.claim(&entry.id).await.expect("claim after release"));

        assert_eq!(store.recover().await.expect("recover"), 1);
        assert_eq!(store.in_flight(), 0);

        assert!(matches!(
            store.claim(&EntryId::generate()).await,
            Err(SpoolError::NotFound(_))
        ));
    }

    #[test]
    fn capacity_accessors() {
        assert_eq!(MemoryBackingStore::new().capacity(), None);
        assert_eq!(MemoryBackingStore::with_capacity(100).capacity(), Some(100));
    }
}
