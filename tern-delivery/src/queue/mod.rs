//! Persistent queues drained by a pool of workers.
//!
//! Entries live in a [`BackingStore`]; the queue keeps an in-memory index of
//! when each pending entry is next due. Workers take the earliest due entry,
//! claim it in the store, hand it to a [`QueueHandler`] and then either delete
//! it or write back its new schedule. An entry whose new state cannot be
//! written back stays claimed, and only the write is retried until it lands.

mod worker;

use std::{
    collections::{BTreeSet, HashMap},
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tern_common::{Signal, internal};
use tern_spool::{BackingStore, EntryId, QueueEntry};
use tokio::{
    sync::{Notify, broadcast, watch},
    task::JoinSet,
};

use crate::error::QueueError;

/// What a handler wants done with an entry after processing it.
#[derive(Debug)]
pub enum Completion {
    /// Delivered, bounced or abandoned: remove it.
    Done,
    /// Keep it, with its updated state, until `next_attempt_at`.
    Reschedule(QueueEntry),
}

#[async_trait]
pub trait QueueHandler: Send + Sync + Debug {
    async fn handle(&self, entry: QueueEntry) -> Completion;
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "defaults::workers")]
    pub workers: usize,

    /// Upper bound on how long an idle worker sleeps before checking the index.
    #[serde(default = "defaults::poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How long shutdown waits for in-flight entries.
    #[serde(default = "defaults::shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

mod defaults {
    pub fn workers() -> usize {
        num_cpus::get()
    }

    pub const fn poll_interval_secs() -> u64 {
        10
    }

    pub const fn shutdown_timeout_secs() -> u64 {
        30
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: defaults::workers(),
            poll_interval_secs: defaults::poll_interval_secs(),
            shutdown_timeout_secs: defaults::shutdown_timeout_secs(),
        }
    }
}

#[derive(Debug)]
pub struct Queue {
    name: String,
    store: Arc<dyn BackingStore>,
    config: QueueConfig,
    notify: Notify,
    schedule: Mutex<BTreeSet<(SystemTime, EntryId)>>,
    /// Handled entries whose new state has not reached the store yet.
    unsaved: Mutex<HashMap<EntryId, QueueEntry>>,
    stopped: AtomicBool,
}

impl Queue {
    pub fn new(name: impl Into<String>, store: Arc<dyn BackingStore>, config: QueueConfig) -> Self {
        Self {
            name: name.into(),
            store,
            config,
            notify: Notify::new(),
            schedule: Mutex::new(BTreeSet::new()),
            unsaved: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Entries waiting in the index, due or not.
    pub fn pending(&self) -> usize {
        self.schedule.lock().len()
    }

    /// Entries whose new state is held in memory until the store takes it.
    pub fn unsaved(&self) -> usize {
        self.unsaved.lock().len()
    }

    /// Whether shutdown has begun. A stopped queue refuses new entries.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Persist `entry` and make it visible to the workers.
    ///
    /// The entry is durable once this returns.
    pub async fn enqueue(&self, entry: QueueEntry) -> Result<EntryId, QueueError> {
        self.ensure_running()?;
        self.store.write(&entry).await?;
        self.schedule(entry.next_attempt_at, entry.id);

        internal!(queue = %self.name, entry = %entry.id, recipient = %entry.recipient, "Enqueued");
        Ok(entry.id)
    }

    /// Persist every entry, or none of them.
    ///
    /// Entries only become visible to the workers once all are written. If a
    /// write fails the entries already written are deleted again.
    pub async fn enqueue_all(&self, entries: &[QueueEntry]) -> Result<Vec<EntryId>, QueueError> {
        self.ensure_running()?;

        for (written, entry) in entries.iter().enumerate() {
            if let Err(err) = self.store.write(entry).await {
                for entry in &entries[..written] {
                    if let Err(err) = self.store.delete(&entry.id).await {
                        internal!(level = ERROR, queue = %self.name, entry = %entry.id, "Failed to withdraw entry: {err}");
                    }
                }
                return Err(err.into());
            }
        }

        for entry in entries {
            self.schedule(entry.next_attempt_at, entry.id);
        }

        internal!(queue = %self.name, count = entries.len(), "Enqueued together");
        Ok(entries.iter().map(|entry| entry.id).collect())
    }

    fn ensure_running(&self) -> Result<(), QueueError> {
        if self.is_stopped() {
            return Err(QueueError::ShuttingDown(self.name.clone()));
        }
        Ok(())
    }

    /// Return entries claimed before a restart to pending and rebuild the index
    /// from the store. Returns the number of entries found.
    pub async fn init(&self) -> Result<usize, QueueError> {
        let recovered = self.store.recover().await?;

        let mut found = 0;
        for id in self.store.list().await? {
            match self.store.read(&id).await {
                Ok(entry) => {
                    self.schedule(entry.next_attempt_at, entry.id);
                    found += 1;
                }
                Err(err) => {
                    internal!(level = ERROR, queue = %self.name, entry = %id, "Unreadable entry skipped: {err}");
                }
            }
        }

        internal!(level = INFO, queue = %self.name, "Loaded {found} entries ({recovered} recovered from a previous run)");
        Ok(found)
    }

    /// Run the worker pool until a shutdown signal arrives.
    ///
    /// On shutdown the queue stops accepting entries, workers stop taking
    /// them and in-flight entries get
    /// `shutdown_timeout_secs` to finish. Anything still running after that is
    /// abandoned; its claim is recovered by [`Queue::init`] on the next start.
    pub async fn serve(
        self: Arc<Self>,
        handler: Arc<dyn QueueHandler>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), QueueError> {
        let (stop, stopped) = watch::channel(false);
        let mut workers = JoinSet::new();

        for worker in 0..self.config.workers.max(1) {
            workers.spawn(worker::run(
                Arc::clone(&self),
                worker,
                Arc::clone(&handler),
                stopped.clone(),
            ));
        }

        internal!(level = INFO, queue = %self.name, "Started {} workers", workers.len());

        match shutdown.recv().await {
            Ok(signal) => internal!(queue = %self.name, ?signal, "Queue received shutdown signal"),
            Err(err) => internal!(level = ERROR, queue = %self.name, "Shutdown channel error: {err}"),
        }

        self.stopped.store(true, Ordering::SeqCst);
        let _ = stop.send(true);

        let timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
        let drained = tokio::time::timeout(timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            internal!(
                level = WARN,
                queue = %self.name,
                "Shutdown timeout exceeded, {} in-flight entries will be retried on restart",
                workers.len()
            );
            workers.shutdown().await;
        }

        internal!(level = INFO, queue = %self.name, "Queue shutdown complete");
        Ok(())
    }

    fn schedule(&self, at: SystemTime, id: EntryId) {
        self.schedule.lock().insert((at, id));
        self.notify.notify_one();
    }

    /// Remove and return the earliest entry due at `now`.
    fn take_due(&self, now: SystemTime) -> Option<EntryId> {
        let mut schedule = self.schedule.lock();
        let &(at, _) = schedule.first()?;

        if at <= now {
            schedule.pop_first().map(|(_, id)| id)
        } else {
            None
        }
    }

    fn next_due_at(&self) -> Option<SystemTime> {
        self.schedule.lock().first().map(|&(at, _)| at)
    }
}
