use std::{
    pin::pin,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::memory::MemoryBackingStore;
use crate::{EntryId, QueueEntry, SpoolError, r#trait::BackingStore};

/// Memory store instrumented for tests
///
/// Wakes waiters on every change and counts the operations performed, so
/// tests can wait for background workers instead of sleeping.
#[derive(Debug, Clone, Default)]
pub struct TestBackingStore {
    pub(crate) inner: MemoryBackingStore,
    notify: Arc<Notify>,
    writes: Arc<AtomicUsize>,
    deletes: Arc<AtomicUsize>,
    failing_writes: Arc<AtomicUsize>,
    passing_writes: Arc<AtomicUsize>,
    updates: Arc<AtomicUsize>,
    failing_updates: Arc<AtomicUsize>,
}

impl TestBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `condition` holds for the store, or the timeout elapses.
    pub async fn wait_until(
        &self,
        timeout: Duration,
        condition: impl Fn(&Self) -> bool,
    ) -> crate::Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                let mut notified = pin!(self.notify.notified());
                notified.as_mut().enable();

                if condition(self) {
                    return;
                }

                notified.await;
            }
        })
        .await
        .map_err(|e| SpoolError::Internal(format!("Timeout waiting for the store: {e}")))
    }

    /// Wait until at least `expected` entries are stored.
    pub async fn wait_for_count(&self, expected: usize, timeout: Duration) -> crate::Result<()> {
        self.wait_until(timeout, |store| store.entry_count() >= expected)
            .await
    }

    pub async fn wait_for_empty(&self, timeout: Duration) -> crate::Result<()> {
        self.wait_until(timeout, |store| store.entry_count() == 0)
            .await
    }

    pub fn entry_count(&self) -> usize {
        self.inner.len()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }

    /// The stored state of `id`, usable from a `wait_until` condition.
    pub fn get(&self, id: &EntryId) -> Option<QueueEntry> {
        self.inner
            .inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entries
            .get(id)
            .cloned()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    /// Make the next `count` writes fail as if the disk were unavailable.
    pub fn fail_next_writes(&self, count: usize) {
        self.fail_writes_after(0, count);
    }

    /// Let `passing` writes through, then fail the `count` after them.
    pub fn fail_writes_after(&self, passing: usize, count: usize) {
        self.passing_writes.store(passing, Ordering::SeqCst);
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` updates fail, leaving the stored state untouched.
    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    fn injected(counter: &AtomicUsize, operation: &str) -> crate::Result<()> {
        if counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SpoolError::Io(std::io::Error::other(format!(
                "injected {operation} failure"
            ))));
        }
        Ok(())
    }

    /// Every stored entry, oldest first.
    pub async fn entries(&self) -> crate::Result<Vec<QueueEntry>> {
        let mut entries = Vec::new();
        for id in self.inner.list().await? {
            entries.push(self.inner.read(&id).await?);
        }
        Ok(entries)
    }

    pub fn clear(&self) {
        if let Ok(mut inner) = self.inner.inner.write() {
            inner.entries.clear();
            inner.claimed.clear();
        }
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl BackingStore for TestBackingStore {
    async fn write(&self, entry: &QueueEntry) -> crate::Result<()> {
        let passing = self.failing_writes.load(Ordering::SeqCst) > 0
            && self
                .passing_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if !passing {
            Self::injected(&self.failing_writes, "write")?;
        }

        self.inner.write(entry).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn list(&self) -> crate::Result<Vec<EntryId>> {
        self.inner.list().await
    }

    async fn read(&self, id: &EntryId) -> crate::Result<QueueEntry> {
        self.inner.read(id).await
    }

    async fn update(&self, entry: &QueueEntry) -> crate::Result<()> {
        let injected = Self::injected(&self.failing_updates, "update");
        // Waiters watching for the failure need waking too
        self.notify.notify_waiters();
        injected?;

        self.inner.update(entry).await?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn delete(&self, id: &EntryId) -> crate::Result<()> {
        self.inner.delete(id).await?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn claim(&self, id: &EntryId) -> crate::Result<bool> {
        let claimed = self.inner.claim(id).await?;
        self.notify.notify_waiters();
        Ok(claimed)
    }

    async fn release(&self, id: &EntryId) -> crate::Result<()> {
        self.inner.release(id).await?;
        self.notify.notify_waiters();
        Ok(())
    }

    async fn recover(&self) -> crate::Result<usize> {
        self.inner.recover().await
    }
}
