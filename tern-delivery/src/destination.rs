//! Executing the destination accepted for each recipient.

use std::sync::Arc;

use tern_common::{Address, Destination, Mail, Reply, ReversePath, internal, tracing};
use tern_filter::RecipientTable;
use tern_spool::{QueueEntry, Route};
use tern_tracing::traced;

use crate::{error::DispatchError, maildrop::Maildrop, queue::Queue, srs::Srs};

/// Carries out destinations once a mail has been accepted.
///
/// Local destinations complete before `execute` returns. Queued destinations
/// only need to reach the queue; delivery happens later on the workers.
#[derive(Debug)]
pub struct Dispatcher {
    table: Arc<RecipientTable>,
    maildrop: Arc<dyn Maildrop>,
    queue: Arc<Queue>,
    srs: Option<Arc<Srs>>,
}

impl Dispatcher {
    pub fn new(table: Arc<RecipientTable>, maildrop: Arc<dyn Maildrop>, queue: Arc<Queue>) -> Self {
        Self {
            table,
            maildrop,
            queue,
            srs: None,
        }
    }

    /// Rewrite reverse paths of forwarded mail and decode SRS recipients.
    #[must_use]
    pub fn with_srs(mut self, srs: Arc<Srs>) -> Self {
        self.srs = Some(srs);
        self
    }

    /// Execute every accepted recipient's destination, in order.
    pub async fn execute_all(
        &self,
        mail: &Mail,
        accepted: &[(Address, Destination)],
    ) -> Vec<(Address, Result<(), DispatchError>)> {
        let mut results = Vec::with_capacity(accepted.len());

        for (recipient, destination) in accepted {
            let result = self.execute(mail, recipient, destination).await;
            results.push((recipient.clone(), result));
        }

        results
    }

    /// Execute `destination` for `recipient`.
    ///
    /// Aliases are followed exactly one hop: the target is looked up in the
    /// recipient table again, and a target that is itself an alias fails.
    /// Mail to an SRS address is a bounce; it continues to the decoded sender
    /// with a null reverse path.
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(mail = %mail.id, recipient = %recipient)), timing(precision = "ms"))]
    pub async fn execute(
        &self,
        mail: &Mail,
        recipient: &Address,
        destination: &Destination,
    ) -> Result<(), DispatchError> {
        let (target, resolved) = match destination {
            Destination::AliasTo { canonical } => {
                let resolved = self
                    .table
                    .resolve(canonical)
                    .await
                    .ok_or_else(|| DispatchError::Permanent(Reply::unknown_recipient()))?;
                (canonical.clone(), resolved)
            }
            Destination::SrsRewrite => {
                let original = self.decode(recipient)?;
                // Nobody local claims a bounce address; it goes back where it came from
                let resolved = self
                    .table
                    .resolve(&original)
                    .await
                    .unwrap_or(Destination::Transmit);

                // A bounce must never cause another bounce
                let bounce = mail.with_reverse_path(ReversePath::Null);
                internal!(recipient = %recipient, target = %original, destination = ?resolved, "Returning bounce");
                return self.perform(&bounce, &original, &resolved).await;
            }
            _ => return self.perform(mail, recipient, destination).await,
        };

        internal!(recipient = %recipient, target = %target, destination = ?resolved, "Followed alias");
        self.perform(mail, &target, &resolved).await
    }

    fn decode(&self, recipient: &Address) -> Result<Address, DispatchError> {
        let Some(srs) = &self.srs else {
            internal!(level = WARN, recipient = %recipient, "SRS address received without SRS configured");
            return Err(DispatchError::Permanent(Reply::unknown_recipient()));
        };

        srs.decode(recipient).map_err(|err| {
            internal!(level = INFO, recipient = %recipient, "Refusing SRS address: {err}");
            DispatchError::Permanent(err.reply())
        })
    }

    async fn perform(
        &self,
        mail: &Mail,
        recipient: &Address,
        destination: &Destination,
    ) -> Result<(), DispatchError> {
        match destination {
            Destination::Drop => {
                internal!(level = INFO, mail = %mail.id, recipient = %recipient, "Dropped");
                Ok(())
            }
            Destination::Store { maildrop } => {
                self.maildrop.store(mail, maildrop).await.map_err(|err| {
                    internal!(level = ERROR, mail = %mail.id, maildrop, "Failed to store mail: {err}");
                    DispatchError::local_error()
                })
            }
            Destination::Forward { members } => {
                let reverse_path = self.forward_path(&mail.reverse_path);
                let forwarded = mail
                    .with_reverse_path(reverse_path)
                    .with_recipients(members.clone());

                let entries: Vec<_> = members
                    .iter()
                    .map(|member| QueueEntry::new(forwarded.clone(), member.clone(), Route::Transmit))
                    .collect();

                // All members or none, so a retrying client causes no duplicates
                self.queue.enqueue_all(&entries).await.map(|_| ()).map_err(|err| {
                    internal!(level = ERROR, mail = %mail.id, recipient = %recipient, "Failed to queue forwarded mail: {err}");
                    DispatchError::local_error()
                })
            }
            Destination::Relay { host } => {
                self.enqueue(mail, recipient, Route::Relay { host: host.clone() })
                    .await
            }
            Destination::Transmit => self.enqueue(mail, recipient, Route::Transmit).await,
            Destination::AliasTo { .. } | Destination::SrsRewrite => {
                internal!(level = ERROR, recipient = %recipient, "Alias resolves to another alias");
                Err(DispatchError::Permanent(Reply::new(
                    554,
                    "5.4.6",
                    format!("Alias chain too long for {recipient}"),
                )))
            }
        }
    }

    fn forward_path(&self, reverse_path: &ReversePath) -> ReversePath {
        self.srs
            .as_ref()
            .map_or_else(|| reverse_path.clone(), |srs| srs.forward(reverse_path))
    }

    async fn enqueue(&self, mail: &Mail, recipient: &Address, route: Route) -> Result<(), DispatchError> {
        self.queue
            .enqueue(QueueEntry::new(mail.clone(), recipient.clone(), route))
            .await
            .map(|_| ())
            .map_err(|err| {
                internal!(level = ERROR, mail = %mail.id, recipient = %recipient, "Failed to queue mail: {err}");
                DispatchError::local_error()
            })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tern_spool::{BackingStore, TestBackingStore};

    use super::*;
    use crate::{
        maildrop::MemoryMaildrop,
        queue::QueueConfig,
        srs::SrsConfig,
    };

    struct Fixture {
        dispatcher: Dispatcher,
        maildrop: Arc<MemoryMaildrop>,
        store: TestBackingStore,
    }

    fn fixture(table: RecipientTable) -> Fixture {
        let maildrop = Arc::new(MemoryMaildrop::new());
        let store = TestBackingStore::new();
        let queue = Arc::new(Queue::new(
            "outbound",
            Arc::new(store.clone()),
            QueueConfig::default(),
        ));
        let srs = Srs::new(&SrsConfig {
            secret: hex::encode("key"),
            domain: String::from("forwarder.example.com"),
            local_domains: vec![String::from("example.com")],
            max_age_days: 21,
        })
        .unwrap();

        Fixture {
            dispatcher: Dispatcher::new(Arc::new(table), Arc::clone(&maildrop) as Arc<dyn Maildrop>, queue)
                .with_srs(Arc::new(srs)),
            maildrop,
            store,
        }
    }

    fn mail() -> Mail {
        Mail::new(
            ReversePath::Mailbox(Address::new("sender", "source.example.org")),
            vec![Address::new("john", "example.com")],
            b"Subject: hi\r\n\r\nHello\r\n".to_vec(),
        )
    }

    fn john() -> Address {
        Address::new("john", "example.com")
    }

    fn table_with(entries: Vec<(Address, Destination)>) -> RecipientTable {
        let mut exact = tern_filter::table::ExactMapper::new();
        for (address, destination) in entries {
            exact = exact.with(address, destination);
        }
        RecipientTable::new().with(exact)
    }

    #[tokio::test]
    async fn drop_and_store() {
        let f = fixture(RecipientTable::new());

        f.dispatcher.execute(&mail(), &john(), &Destination::Drop).await.unwrap();
        f.dispatcher
            .execute(
                &mail(),
                &john(),
                &Destination::Store {
                    maildrop: String::from("john"),
                },
            )
            .await
            .unwrap();

        assert_eq!(f.maildrop.count("john"), 1);
        assert_eq!(f.store.entry_count(), 0);
    }

    #[tokio::test]
    async fn store_failure_is_temporary() {
        let f = fixture(RecipientTable::new());
        f.maildrop.set_unavailable(true);

        let err = f
            .dispatcher
            .execute(
                &mail(),
                &john(),
                &Destination::Store {
                    maildrop: String::from("john"),
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err, DispatchError::Temporary(Reply::local_error()));
    }

    #[tokio::test]
    async fn forward_rewrites_reverse_path_per_member() {
        let f = fixture(RecipientTable::new());
        let members = vec![
            Address::new("jane", "remote.example.net"),
            Address::new("joe", "other.example.net"),
        ];

        f.dispatcher
            .execute(
                &mail(),
                &john(),
                &Destination::Forward {
                    members: members.clone(),
                },
            )
            .await
            .unwrap();

        let entries = f.store.entries().await.unwrap();
        assert_eq!(entries.len(), 2);

        let mut recipients: Vec<_> = entries.iter().map(|e| e.recipient.clone()).collect();
        recipients.sort_by_key(Address::key);
        assert_eq!(recipients, vec![members[0].clone(), members[1].clone()]);

        for entry in &entries {
            assert_eq!(entry.route, Route::Transmit);
            let sender = entry.mail.reverse_path.address().unwrap();
            assert!(sender.local_part().starts_with("SRS0="));
            assert_eq!(sender.domain().unwrap().as_str(), "forwarder.example.com");
        }
    }

    #[tokio::test]
    async fn queued_destinations() {
        let f = fixture(RecipientTable::new());

        f.dispatcher
            .execute(
                &mail(),
                &john(),
                &Destination::Relay {
                    host: String::from("smarthost.example.net:2525"),
                },
            )
            .await
            .unwrap();
        f.dispatcher
            .execute(&mail(), &john(), &Destination::Transmit)
            .await
            .unwrap();

        let routes: Vec<_> = f
            .store
            .entries()
            .await
            .unwrap()
            .into_iter()
            .map(|entry| entry.route)
            .collect();
        assert_eq!(routes.len(), 2);
        assert!(routes.contains(&Route::Transmit));
        assert!(routes.contains(&Route::Relay {
            host: String::from("smarthost.example.net:2525")
        }));
    }

    #[tokio::test]
    async fn queue_failure_is_temporary() {
        let f = fixture(RecipientTable::new());
        f.store.fail_next_writes(1);

        let err = f
            .dispatcher
            .execute(&mail(), &john(), &Destination::Transmit)
            .await
            .unwrap_err();

        assert!(err.is_temporary());
        assert_eq!(err.reply().status(), "4.3.0");
        assert_eq!(f.store.list().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn alias_is_followed_once() {
        let canonical = Address::new("john.smith", "example.com");
        let f = fixture(table_with(vec![(
            canonical.clone(),
            Destination::Store {
                maildrop: String::from("jsmith"),
            },
        )]));

        f.dispatcher
            .execute(
                &mail(),
                &john(),
                &Destination::AliasTo {
                    canonical: canonical.clone(),
                },
            )
            .await
            .unwrap();
        assert_eq!(f.maildrop.count("jsmith"), 1);
    }

    #[tokio::test]
    async fn alias_chains_are_refused() {
        let hop = Address::new("hop", "example.com");
        let f = fixture(table_with(vec![(
            hop.clone(),
            Destination::AliasTo { canonical: john() },
        )]));

        let err = f
            .dispatcher
            .execute(&mail(), &john(), &Destination::AliasTo { canonical: hop })
            .await
            .unwrap_err();

        assert!(err.is_permanent());
        assert_eq!(err.reply().code, 554);
        assert_eq!(err.reply().status(), "5.4.6");

        let err = f
            .dispatcher
            .execute(
                &mail(),
                &john(),
                &Destination::AliasTo {
                    canonical: Address::new("nobody", "example.com"),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err, DispatchError::Permanent(Reply::unknown_recipient()));
    }

    #[tokio::test]
    async fn srs_bounces_go_back_to_the_original_sender() {
        let f = fixture(RecipientTable::new());
        let original = Address::new("sender", "source.example.org");
        let bounce_to = f
            .dispatcher
            .srs
            .as_ref()
            .unwrap()
            .encode(&original);

        f.dispatcher
            .execute(&mail(), &bounce_to, &Destination::SrsRewrite)
            .await
            .unwrap();

        let entries = f.store.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].recipient, original);
        assert_eq!(entries[0].route, Route::Transmit);
        assert!(entries[0].mail.reverse_path.is_null());
        assert!(!mail().reverse_path.is_null());
    }

    #[tokio::test]
    async fn forward_queues_all_members_or_none() {
        let f = fixture(RecipientTable::new());
        let members = vec![
            Address::new("jane", "remote.example.net"),
            Address::new("joe", "other.example.net"),
            Address::new("ann", "third.example.net"),
        ];

        // The second member's write fails after the first one landed
        f.store.fail_writes_after(1, 1);
        let err = f
            .dispatcher
            .execute(
                &mail(),
                &john(),
                &Destination::Forward {
                    members: members.clone(),
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_temporary());
        assert_eq!(f.store.entry_count(), 0);
        assert_eq!(f.dispatcher.queue.pending(), 0);

        // The client's retry queues each member exactly once
        f.dispatcher
            .execute(&mail(), &john(), &Destination::Forward { members })
            .await
            .unwrap();
        assert_eq!(f.store.entry_count(), 3);
        assert_eq!(f.dispatcher.queue.pending(), 3);
    }

    #[tokio::test]
    async fn forged_srs_addresses_are_refused() {
        let f = fixture(RecipientTable::new());
        let forged = Address::new("SRS0=abcd=AA=source.example.org=sender", "forwarder.example.com");

        let err = f
            .dispatcher
            .execute(&mail(), &forged, &Destination::SrsRewrite)
            .await
            .unwrap_err();

        assert_eq!(err.reply().code, 553);
        assert_eq!(err.reply().status(), "5.1.0");
        assert_eq!(f.store.entry_count(), 0);
    }

    #[tokio::test]
    async fn execute_all_reports_each_recipient() {
        let f = fixture(RecipientTable::new());
        let jane = Address::new("jane", "example.com");

        let results = f
            .dispatcher
            .execute_all(
                &mail(),
                &[
                    (john(), Destination::Drop),
                    (
                        jane.clone(),
                        Destination::AliasTo {
                            canonical: Address::new("nobody", "example.com"),
                        },
                    ),
                ],
            )
            .await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0], (john(), Ok(())));
        assert_eq!(results[1].0, jane);
        assert!(results[1].1.as_ref().is_err_and(DispatchError::is_permanent));
    }
}
