use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};

use tern_common::{internal, tracing};
use tern_spool::{EntryId, QueueEntry, SpoolError};
use tern_tracing::traced;
use tokio::sync::watch;

use super::{Completion, Queue, QueueHandler};

pub(super) async fn run(
    queue: Arc<Queue>,
    worker: usize,
    handler: Arc<dyn QueueHandler>,
    mut stop: watch::Receiver<bool>,
) {
    let poll = Duration::from_secs(queue.config.poll_interval_secs.max(1));
    internal!(queue = %queue.name, worker, "Worker started");

    while !*stop.borrow() {
        let now = SystemTime::now();

        if let Some(id) = queue.take_due(now) {
            process(&queue, id, handler.as_ref()).await;
            continue;
        }

        let wait = queue
            .next_due_at()
            .map_or(poll, |at| at.duration_since(now).unwrap_or_default().min(poll));

        tokio::select! {
            () = queue.notify.notified() => {}
            () = tokio::time::sleep(wait) => {}
            _ = stop.changed() => {}
        }
    }

    internal!(queue = %queue.name, worker, "Worker stopped");
}

#[traced(instrument(level = tracing::Level::DEBUG, skip(queue, handler), fields(queue = %queue.name, entry = %id)), timing(precision = "ms"))]
async fn process(queue: &Queue, id: EntryId, handler: &dyn QueueHandler) {
    let store = &queue.store;

    // Still claimed from the last run of this entry; only the write is owed
    let unsaved = queue.unsaved.lock().remove(&id);
    if let Some(entry) = unsaved {
        persist(queue, entry).await;
        return;
    }

    match store.claim(&id).await {
        Ok(true) => {}
        Ok(false) => {
            internal!(entry = %id, "Entry is already in flight");
            return;
        }
        Err(SpoolError::NotFound(_)) => return,
        Err(err) => {
            internal!(level = ERROR, entry = %id, "Failed to claim entry: {err}");
            queue.schedule(retry_later(queue), id);
            return;
        }
    }

    let entry = match store.read(&id).await {
        Ok(entry) => entry,
        Err(err) => {
            internal!(level = ERROR, entry = %id, "Failed to read claimed entry: {err}");
            if let Err(err) = store.release(&id).await {
                internal!(level = ERROR, entry = %id, "Failed to release entry: {err}");
            }
            if !matches!(err, SpoolError::NotFound(_)) {
                queue.schedule(retry_later(queue), id);
            }
            return;
        }
    };

    match handler.handle(entry).await {
        Completion::Done => {
            // Left claimed on failure; the next start returns it to pending
            if let Err(err) = store.delete(&id).await {
                internal!(level = ERROR, entry = %id, "Failed to delete completed entry: {err}");
            }
        }
        Completion::Reschedule(entry) => persist(queue, entry).await,
    }
}

/// Write back a handled entry's state and hand it back to the schedule.
///
/// Until the write succeeds the entry keeps its claim and its state is held
/// by the queue, so it is never handled again from the stale stored copy.
async fn persist(queue: &Queue, entry: QueueEntry) {
    let id = entry.id;

    if let Err(err) = queue.store.update(&entry).await {
        internal!(level = ERROR, entry = %id, "Failed to persist entry state, holding it: {err}");
        queue.unsaved.lock().insert(id, entry);
        queue.schedule(retry_later(queue), id);
        return;
    }

    if let Err(err) = queue.store.release(&id).await {
        internal!(level = ERROR, entry = %id, "Failed to release entry: {err}");
    }
    queue.schedule(entry.next_attempt_at, id);
}

fn retry_later(queue: &Queue) -> SystemTime {
    SystemTime::now() + Duration::from_secs(queue.config.poll_interval_secs.max(1))
}
