//! The surface a session layer drives.
//!
//! A session asks [`Mta::evaluate_recipient`] about each `RCPT TO`, collects
//! the accepted recipients with their destinations, asks
//! [`Mta::evaluate_message`] once the content is in, and finally hands the
//! mail over with [`Mta::accept`]. Everything after that happens on the queue
//! workers started by [`Mta::serve`].

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tern_common::{Address, Destination, Mail, Signal, internal, tracing};
use tern_delivery::{
    ConnectionRegistry, DeliveryAgent, DirMaildrop, DispatchError, Dispatcher, DnsResolver,
    DsnConfig, Maildrop, MemoryMaildrop, Queue, QueueConfig, QueueError, QueueHandler,
    RetryPolicy, Srs, TransmissionEngine, Transmitter,
};
use tern_filter::{
    FilterChain, MessageVerdict, RecipientTable, RecipientVerdict, SessionInfo, SpfChecker,
    filters::LookupDestination,
};
use tern_spool::{BackingStore, MemoryBackingStore};
use tern_tracing::traced;
use tokio::sync::broadcast;

use crate::{
    config::{Config, MaildropConfig},
    error::BuildError,
};

pub const OUTBOUND_QUEUE: &str = "outbound";
pub const DSN_QUEUE: &str = "dsn";

pub struct Mta {
    chain: FilterChain,
    dispatcher: Dispatcher,
    outbound: Arc<Queue>,
    notifications: Arc<Queue>,
    outbound_agent: Arc<DeliveryAgent>,
    notification_agent: Arc<DeliveryAgent>,
    initialised: AtomicBool,
}

impl Mta {
    /// Assemble an MTA piece by piece. Stores and the maildrop fall back to
    /// in-memory implementations, which suits tests. [`Mta::from_config`]
    /// uses durable ones unless the configuration asks otherwise.
    pub fn builder(
        table: Arc<RecipientTable>,
        transmitter: Arc<dyn Transmitter>,
        policy: RetryPolicy,
        dsn: DsnConfig,
    ) -> MtaBuilder {
        MtaBuilder {
            chain: None,
            table,
            transmitter,
            policy,
            dsn,
            maildrop: None,
            stores: None,
            queue: QueueConfig::default(),
            srs: None,
        }
    }

    /// Assemble the MTA described by `config`.
    ///
    /// `spf` is required when the configuration uses the `RejectOnFailedSpf`
    /// filter.
    pub fn from_config(config: &Config, spf: Option<Arc<dyn SpfChecker>>) -> Result<Self, BuildError> {
        let table = Arc::new(config.recipient_table()?);
        let chain = config.filter_chain(Arc::clone(&table), spf)?;

        let transmission = config.transmission();
        let registry = ConnectionRegistry::new(
            transmission.max_connections_per_host,
            Duration::from_secs(transmission.slot_wait_secs),
        );
        let engine = TransmissionEngine::new(
            Arc::new(DnsResolver::new(config.dns.clone())?),
            Arc::new(registry),
            transmission,
        );

        let maildrop: Arc<dyn Maildrop> = match &config.maildrop {
            MaildropConfig::Directory { path } => Arc::new(DirMaildrop::new(path)),
            MaildropConfig::Memory => Arc::new(MemoryMaildrop::new()),
        };

        let mut builder = Self::builder(table, Arc::new(engine), config.retry.clone(), config.dsn())
            .filters(chain)
            .maildrop(maildrop)
            .stores(
                config.spool.open(OUTBOUND_QUEUE)?,
                config.spool.open(DSN_QUEUE)?,
            )
            .queue_config(config.queue.clone());

        if let Some(srs) = &config.srs {
            builder = builder.srs(Arc::new(Srs::new(srs)?));
        }

        Ok(builder.build())
    }

    pub async fn evaluate_recipient(
        &self,
        session: Arc<SessionInfo>,
        recipient: Address,
    ) -> RecipientVerdict {
        self.chain.evaluate_recipient(session, recipient).await
    }

    pub async fn evaluate_message(&self, session: Arc<SessionInfo>, mail: &Mail) -> MessageVerdict {
        self.chain.evaluate_message(session, mail).await
    }

    /// Execute the destinations of every accepted recipient.
    ///
    /// A recipient whose result is `Ok` is the MTA's responsibility from now
    /// on. For the others the carried reply is what the client should be told.
    #[traced(instrument(level = tracing::Level::INFO, skip_all, fields(mail = %mail.id, recipients = accepted.len())), timing(precision = "ms"))]
    pub async fn accept(
        &self,
        mail: &Mail,
        accepted: &[(Address, Destination)],
    ) -> Vec<(Address, Result<(), DispatchError>)> {
        let results = self.dispatcher.execute_all(mail, accepted).await;

        let failed = results.iter().filter(|(_, result)| result.is_err()).count();
        if failed > 0 {
            internal!(level = WARN, mail = %mail.id, "{failed} of {} recipients could not be accepted", results.len());
        }

        results
    }

    /// Load entries left by a previous run. Must be called before [`Mta::serve`].
    pub async fn init(&self) -> Result<(), QueueError> {
        self.outbound.init().await?;
        self.notifications.init().await?;
        self.initialised.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Run both queues until `shutdown` broadcasts.
    pub async fn serve(&self, shutdown: &broadcast::Sender<Signal>) -> Result<(), QueueError> {
        if !self.initialised.load(Ordering::SeqCst) {
            return Err(QueueError::NotInitialised(self.outbound.name().to_string()));
        }

        internal!(level = INFO, "Delivery started");

        tokio::try_join!(
            Arc::clone(&self.outbound).serve(
                Arc::clone(&self.outbound_agent) as Arc<dyn QueueHandler>,
                shutdown.subscribe(),
            ),
            Arc::clone(&self.notifications).serve(
                Arc::clone(&self.notification_agent) as Arc<dyn QueueHandler>,
                shutdown.subscribe(),
            ),
        )?;

        internal!(level = INFO, "Delivery stopped");
        Ok(())
    }

    pub const fn outbound(&self) -> &Arc<Queue> {
        &self.outbound
    }

    pub const fn notifications(&self) -> &Arc<Queue> {
        &self.notifications
    }
}

pub struct MtaBuilder {
    chain: Option<FilterChain>,
    table: Arc<RecipientTable>,
    transmitter: Arc<dyn Transmitter>,
    policy: RetryPolicy,
    dsn: DsnConfig,
    maildrop: Option<Arc<dyn Maildrop>>,
    stores: Option<(Arc<dyn BackingStore>, Arc<dyn BackingStore>)>,
    queue: QueueConfig,
    srs: Option<Arc<Srs>>,
}

impl MtaBuilder {
    /// Without a chain only the recipient table is consulted.
    #[must_use]
    pub fn filters(mut self, chain: FilterChain) -> Self {
        self.chain = Some(chain);
        self
    }

    #[must_use]
    pub fn maildrop(mut self, maildrop: Arc<dyn Maildrop>) -> Self {
        self.maildrop = Some(maildrop);
        self
    }

    /// Stores for the outbound and the notification queue.
    #[must_use]
    pub fn stores(mut self, outbound: Arc<dyn BackingStore>, notifications: Arc<dyn BackingStore>) -> Self {
        self.stores = Some((outbound, notifications));
        self
    }

    #[must_use]
    pub fn queue_config(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    #[must_use]
    pub fn srs(mut self, srs: Arc<Srs>) -> Self {
        self.srs = Some(srs);
        self
    }

    pub fn build(self) -> Mta {
        let (outbound, notifications) = self.stores.unwrap_or_else(|| {
            (
                Arc::new(MemoryBackingStore::new()) as Arc<dyn BackingStore>,
                Arc::new(MemoryBackingStore::new()) as Arc<dyn BackingStore>,
            )
        });

        let outbound = Arc::new(Queue::new(OUTBOUND_QUEUE, outbound, self.queue.clone()));
        let notifications = Arc::new(Queue::new(DSN_QUEUE, notifications, self.queue));

        let chain = self.chain.unwrap_or_else(|| {
            FilterChain::builder()
                .recipient_filter(LookupDestination::new(Arc::clone(&self.table)))
                .build()
        });

        let maildrop = self
            .maildrop
            .unwrap_or_else(|| Arc::new(MemoryMaildrop::new()) as Arc<dyn Maildrop>);
        let mut dispatcher = Dispatcher::new(self.table, maildrop, Arc::clone(&outbound));
        if let Some(srs) = self.srs {
            dispatcher = dispatcher.with_srs(srs);
        }

        // Notifications carry a null reverse path, so the second agent never
        // queues anything itself.
        let outbound_agent = DeliveryAgent::new(
            Arc::clone(&self.transmitter),
            self.policy.clone(),
            self.dsn.clone(),
            Arc::clone(&notifications),
        );
        let notification_agent = DeliveryAgent::new(
            self.transmitter,
            self.policy,
            self.dsn,
            Arc::clone(&notifications),
        );

        internal!(
            level = INFO,
            recipient_filters = ?chain.recipient_filters().collect::<Vec<_>>(),
            message_filters = ?chain.message_filters().collect::<Vec<_>>(),
            "MTA assembled"
        );

        Mta {
            chain,
            dispatcher,
            outbound,
            notifications,
            outbound_agent: Arc::new(outbound_agent),
            notification_agent: Arc::new(notification_agent),
            initialised: AtomicBool::new(false),
        }
    }
}
