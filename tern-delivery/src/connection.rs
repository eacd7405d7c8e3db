//! Per-host outgoing connection slots.

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tern_common::internal;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("Timed out after {0:?} waiting for a connection slot to {1}")]
    Timeout(Duration, String),

    #[error("Connection registry for {0} is closed")]
    Closed(String),
}

type Slots = Arc<DashMap<String, Arc<Semaphore>>>;

/// Bounds the number of simultaneous client connections to each host.
///
/// A `max_per_host` of 0 disables the bound. A host is only tracked while
/// someone holds or waits for one of its slots.
#[derive(Debug)]
pub struct ConnectionRegistry {
    max_per_host: usize,
    wait_timeout: Duration,
    slots: Slots,
}

impl ConnectionRegistry {
    pub fn new(max_per_host: usize, wait_timeout: Duration) -> Self {
        Self {
            max_per_host,
            wait_timeout,
            slots: Arc::new(DashMap::new()),
        }
    }

    pub const fn max_per_host(&self) -> usize {
        self.max_per_host
    }

    /// Wait for a free slot to `host`.
    pub async fn acquire(&self, host: &str) -> Result<ConnectionSlot, SlotError> {
        let key = host.to_ascii_lowercase();

        if self.max_per_host == 0 {
            return Ok(ConnectionSlot {
                host: key,
                permit: None,
                slots: None,
            });
        }

        // Clone the semaphore out so the map shard is not held across the await
        let semaphore = Arc::clone(
            self.slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
                .value(),
        );

        let acquired = tokio::time::timeout(self.wait_timeout, semaphore.acquire_owned()).await;

        let permit = match acquired {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(SlotError::Closed(key)),
            Err(_) => {
                internal!(level = WARN, host = %key, "No connection slot free within {:?}", self.wait_timeout);
                evict_if_idle(&self.slots, &key, self.max_per_host);
                return Err(SlotError::Timeout(self.wait_timeout, key));
            }
        };

        Ok(ConnectionSlot {
            host: key,
            permit: Some((permit, self.max_per_host)),
            slots: Some(Arc::clone(&self.slots)),
        })
    }

    /// Hosts currently tracked.
    pub fn hosts(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently held for `host`.
    pub fn in_use(&self, host: &str) -> usize {
        if self.max_per_host == 0 {
            return 0;
        }

        self.slots
            .get(&host.to_ascii_lowercase())
            .map_or(0, |semaphore| {
                self.max_per_host - semaphore.available_permits()
            })
    }
}

/// Drop the entry for `host` once nothing holds or waits for its semaphore.
fn evict_if_idle(slots: &DashMap<String, Arc<Semaphore>>, host: &str, max_per_host: usize) {
    slots.remove_if(host, |_, semaphore| {
        Arc::strong_count(semaphore) == 1 && semaphore.available_permits() == max_per_host
    });
}

/// Permission to hold one connection open. The slot is returned on drop.
#[derive(Debug)]
pub struct ConnectionSlot {
    host: String,
    permit: Option<(OwnedSemaphorePermit, usize)>,
    slots: Option<Slots>,
}

impl ConnectionSlot {
    pub fn host(&self) -> &str {
        &self.host
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        let Some((permit, max_per_host)) = self.permit.take() else {
            return;
        };
        drop(permit);

        if let Some(slots) = &self.slots {
            evict_if_idle(slots, &self.host, max_per_host);
        }
    }
}
