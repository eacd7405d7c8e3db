use std::{sync::Arc, time::SystemTime};

use async_trait::async_trait;
use tern_common::{Reply, internal, tracing};
use tern_spool::{FailureNotice, QueueEntry, Route};
use tern_tracing::traced;

use crate::{
    dsn::{DsnConfig, DsnKind, generate_dsn},
    queue::{Completion, Queue, QueueHandler},
    retry::{RetryDecision, RetryPolicy},
    transmission::{TransmissionResult, Transmitter},
};

/// Drains a queue through a transmitter, applying the retry policy to failures
/// and sending notifications to the DSN queue.
#[derive(Debug)]
pub struct DeliveryAgent {
    transmitter: Arc<dyn Transmitter>,
    policy: RetryPolicy,
    dsn: DsnConfig,
    notifications: Arc<Queue>,
}

impl DeliveryAgent {
    pub fn new(
        transmitter: Arc<dyn Transmitter>,
        policy: RetryPolicy,
        dsn: DsnConfig,
        notifications: Arc<Queue>,
    ) -> Self {
        Self {
            transmitter,
            policy,
            dsn,
            notifications,
        }
    }

    /// Queue a notification about `entry`. Returns `false` only when one was
    /// due but could not be queued.
    async fn notify(
        &self,
        entry: &QueueEntry,
        kind: DsnKind,
        reply: &Reply,
        remote: Option<&str>,
    ) -> bool {
        let Some(dsn) = generate_dsn(entry, kind, reply, remote, &self.dsn) else {
            internal!(level = INFO, entry = %entry.id, %kind, "No notification sent for the null reverse path");
            return true;
        };
        let Some(recipient) = dsn.recipients.first().cloned() else {
            return true;
        };

        match self
            .notifications
            .enqueue(QueueEntry::new(dsn, recipient, Route::Transmit))
            .await
        {
            Ok(id) => {
                internal!(level = INFO, entry = %entry.id, notification = %id, %kind, "Notification queued");
                true
            }
            Err(err) => {
                internal!(level = ERROR, entry = %entry.id, %kind, "Failed to queue notification: {err}");
                false
            }
        }
    }

    /// Report a final failure. Until the report is queued the entry is kept
    /// carrying the failure, so it is never transmitted again.
    async fn finish(&self, mut entry: QueueEntry, notice: FailureNotice, now: SystemTime) -> Completion {
        if self
            .notify(&entry, DsnKind::Failure, &notice.reply, notice.remote.as_deref())
            .await
        {
            return Completion::Done;
        }

        entry.next_attempt_at = now + self.policy.delay_for(entry.attempts);
        entry.undelivered = Some(notice);
        Completion::Reschedule(entry)
    }
}

#[async_trait]
impl QueueHandler for DeliveryAgent {
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(entry = %entry.id)), timing(precision = "ms"))]
    async fn handle(&self, entry: QueueEntry) -> Completion {
        let mut entry = entry;
        let now = SystemTime::now();
        let reported = entry.delay_reports;

        if let Some(notice) = entry.undelivered.take() {
            internal!(level = INFO, entry = %entry.id, "Retrying the failure notification only");
            return self.finish(entry, notice, now).await;
        }

        let result = self.transmitter.transmit(&entry).await;
        let Some(reply) = result.reply() else {
            internal!(level = INFO, entry = %entry.id, recipient = %entry.recipient, "Delivered");
            return Completion::Done;
        };

        let decision = match &result {
            TransmissionResult::Postponed { after, .. } => {
                self.policy
                    .on_postpone(&mut entry, *after, result.to_string(), now)
            }
            _ => self
                .policy
                .on_failure(&mut entry, result.is_permanent(), result.to_string(), now),
        };

        internal!(
            level = INFO,
            entry = %entry.id,
            attempts = entry.attempts,
            ?decision,
            "Delivery failed: {result}"
        );

        match decision {
            RetryDecision::Retry { report_delay, .. } => {
                if report_delay
                    && !self
                        .notify(&entry, DsnKind::Delayed, &reply, result.remote())
                        .await
                {
                    // Caught up after the next failure
                    entry.delay_reports = reported;
                }
                Completion::Reschedule(entry)
            }
            RetryDecision::Postpone { .. } => Completion::Reschedule(entry),
            RetryDecision::Bounce | RetryDecision::Abandon => {
                let notice = FailureNotice {
                    reply,
                    remote: result.remote().map(ToString::to_string),
                };
                self.finish(entry, notice, now).await
            }
        }
    }
}
