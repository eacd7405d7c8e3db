//! Outbound transmission: one SMTP transaction per queue entry.

use std::{
    fmt::{self, Display},
    future::Future,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tern_common::{Reply, internal, tracing};
use tern_smtp::{ClientError, Response, SmtpClient};
use tern_spool::{QueueEntry, Route};
use tern_tracing::traced;

use crate::{
    connection::ConnectionRegistry,
    dns::{MailServer, MxResolver},
};

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmissionResult {
    Delivered,
    /// The remote host, or the DNS, says the recipient can never be reached.
    PermanentFailure {
        reply: Reply,
        remote: Option<String>,
    },
    /// The remote host asked us to try later, or the session broke mid-way.
    TemporaryFailure {
        reply: Reply,
        remote: Option<String>,
    },
    /// No session could be established.
    ConnectionError(String),
    /// Every host that could be tried already had all its connection slots in
    /// use. Retrying after `after` is not a new attempt.
    Postponed { reason: String, after: Duration },
}

impl TransmissionResult {
    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::PermanentFailure { .. })
    }

    /// The reply describing the failure, synthesising one for connection errors.
    pub fn reply(&self) -> Option<Reply> {
        match self {
            Self::Delivered => None,
            Self::PermanentFailure { reply, .. } | Self::TemporaryFailure { reply, .. } => {
                Some(reply.clone())
            }
            Self::ConnectionError(reason) => Some(Reply::new(451, "4.4.1", reason.clone())),
            Self::Postponed { reason, .. } => Some(Reply::new(451, "4.4.5", reason.clone())),
        }
    }

    /// The host that produced the reply, when one was reached.
    pub fn remote(&self) -> Option<&str> {
        match self {
            Self::PermanentFailure { remote, .. } | Self::TemporaryFailure { remote, .. } => {
                remote.as_deref()
            }
            Self::Delivered | Self::ConnectionError(_) | Self::Postponed { .. } => None,
        }
    }
}

impl Display for TransmissionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => f.write_str("Delivered"),
            Self::PermanentFailure { reply, remote } | Self::TemporaryFailure { reply, remote } => {
                match remote {
                    Some(remote) => write!(f, "{remote} said: {reply}"),
                    None => Display::fmt(reply, f),
                }
            }
            Self::ConnectionError(reason) => write!(f, "Connection error: {reason}"),
            Self::Postponed { reason, after } => write!(f, "Postponed for {after:?}: {reason}"),
        }
    }
}

/// Per-stage limits for a client session, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpTimeouts {
    #[serde(default = "defaults::connect")]
    pub connect_secs: u64,

    /// Also bounds reading the greeting.
    #[serde(default = "defaults::command")]
    pub ehlo_secs: u64,

    #[serde(default = "defaults::command")]
    pub mail_from_secs: u64,

    #[serde(default = "defaults::command")]
    pub rcpt_to_secs: u64,

    /// Covers the DATA command and the message content.
    #[serde(default = "defaults::data")]
    pub data_secs: u64,

    #[serde(default = "defaults::quit")]
    pub quit_secs: u64,
}

impl Default for SmtpTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: defaults::connect(),
            ehlo_secs: defaults::command(),
            mail_from_secs: defaults::command(),
            rcpt_to_secs: defaults::command(),
            data_secs: defaults::data(),
            quit_secs: defaults::quit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransmissionConfig {
    /// Name announced in EHLO/HELO.
    pub helo_name: String,

    /// Bound on a whole attempt: resolution, slot wait and transaction.
    #[serde(default = "defaults::attempt")]
    pub attempt_timeout_secs: u64,

    /// 0 for no limit.
    #[serde(default = "defaults::max_connections_per_host")]
    pub max_connections_per_host: usize,

    #[serde(default = "defaults::slot_wait")]
    pub slot_wait_secs: u64,

    #[serde(default)]
    pub timeouts: SmtpTimeouts,
}

mod defaults {
    pub const fn connect() -> u64 {
        30
    }

    pub const fn command() -> u64 {
        30
    }

    pub const fn data() -> u64 {
        120
    }

    pub const fn quit() -> u64 {
        10
    }

    pub const fn attempt() -> u64 {
        600
    }

    pub const fn max_connections_per_host() -> usize {
        3
    }

    pub const fn slot_wait() -> u64 {
        60
    }
}

impl TransmissionConfig {
    pub fn new(helo_name: impl Into<String>) -> Self {
        Self {
            helo_name: helo_name.into(),
            attempt_timeout_secs: defaults::attempt(),
            max_connections_per_host: defaults::max_connections_per_host(),
            slot_wait_secs: defaults::slot_wait(),
            timeouts: SmtpTimeouts::default(),
        }
    }
}

/// Delivers a queue entry to its next hop.
#[async_trait]
pub trait Transmitter: Send + Sync + std::fmt::Debug {
    async fn transmit(&self, entry: &QueueEntry) -> TransmissionResult;
}

#[derive(Debug)]
pub struct TransmissionEngine {
    resolver: Arc<dyn MxResolver>,
    registry: Arc<ConnectionRegistry>,
    config: TransmissionConfig,
}

impl TransmissionEngine {
    pub fn new(
        resolver: Arc<dyn MxResolver>,
        registry: Arc<ConnectionRegistry>,
        config: TransmissionConfig,
    ) -> Self {
        Self {
            resolver,
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    async fn targets(&self, entry: &QueueEntry) -> Result<Arc<Vec<MailServer>>, TransmissionResult> {
        let domain = match &entry.route {
            Route::Relay { host } => return Ok(Arc::new(vec![MailServer::relay(host)])),
            Route::Transmit => entry.recipient.domain().ok_or_else(|| {
                TransmissionResult::PermanentFailure {
                    reply: Reply::new(550, "5.1.2", "Recipient has no domain"),
                    remote: None,
                }
            })?,
        };

        self.resolver.resolve(domain.as_str()).await.map_err(|err| {
            if err.is_temporary() {
                TransmissionResult::ConnectionError(err.to_string())
            } else {
                TransmissionResult::PermanentFailure {
                    reply: Reply::new(550, "5.1.2", err.to_string()),
                    remote: None,
                }
            }
        })
    }

    async fn attempt(&self, entry: &QueueEntry) -> TransmissionResult {
        let servers = match self.targets(entry).await {
            Ok(servers) => servers,
            Err(result) => return result,
        };

        let connect_timeout = Duration::from_secs(self.config.timeouts.connect_secs);
        let mut last_error = None;
        let mut busy = None;

        for server in servers.iter() {
            let _slot = match self.registry.acquire(&server.host).await {
                Ok(slot) => slot,
                Err(err) => {
                    internal!(level = DEBUG, server = %server.host, "Host is busy, trying the next one: {err}");
                    busy = Some(err.to_string());
                    continue;
                }
            };

            let address = server.address();
            let client = match tokio::time::timeout(connect_timeout, SmtpClient::connect(&address)).await {
                Ok(Ok(client)) => client,
                Ok(Err(err)) => {
                    internal!(level = WARN, server = %address, "Connection failed: {err}");
                    last_error = Some(format!("{address}: {err}"));
                    continue;
                }
                Err(_) => {
                    internal!(level = WARN, server = %address, "Connection timed out after {connect_timeout:?}");
                    last_error = Some(format!("{address}: connection timed out"));
                    continue;
                }
            };

            return Transaction {
                entry,
                server,
                config: &self.config,
            }
            .run(client)
            .await;
        }

        // A host that failed outranks one that was merely busy
        match (last_error, busy) {
            (Some(error), _) => TransmissionResult::ConnectionError(error),
            (None, Some(reason)) => TransmissionResult::Postponed {
                reason,
                after: Duration::from_secs(rand::rng().random_range(5..=15)),
            },
            (None, None) => TransmissionResult::ConnectionError(String::from("No mail servers to try")),
        }
    }
}

#[async_trait]
impl Transmitter for TransmissionEngine {
    #[traced(instrument(level = tracing::Level::INFO, skip_all, fields(entry = %entry.id, recipient = %entry.recipient)), timing(precision = "ms"))]
    async fn transmit(&self, entry: &QueueEntry) -> TransmissionResult {
        let limit = Duration::from_secs(self.config.attempt_timeout_secs);

        let result = tokio::time::timeout(limit, self.attempt(entry))
            .await
            .unwrap_or_else(|_| {
                TransmissionResult::ConnectionError(format!("Attempt timed out after {limit:?}"))
            });

        internal!(level = INFO, entry = %entry.id, "{result}");
        result
    }
}

/// Why a session stopped short of delivering.
#[derive(Debug)]
enum StageError {
    Rejected(Response),
    Client(ClientError),
    Timeout(&'static str, Duration),
}

impl From<ClientError> for StageError {
    fn from(value: ClientError) -> Self {
        Self::Client(value)
    }
}

struct Transaction<'a> {
    entry: &'a QueueEntry,
    server: &'a MailServer,
    config: &'a TransmissionConfig,
}

impl Transaction<'_> {
    async fn run(self, mut client: SmtpClient) -> TransmissionResult {
        let outcome = self.exchange(&mut client).await;

        let quit_timeout = Duration::from_secs(self.config.timeouts.quit_secs);
        if !matches!(outcome, Err(StageError::Client(_) | StageError::Timeout(..)))
            && let Err(err) = self
                .stage("QUIT", quit_timeout, client.quit())
                .await
        {
            internal!(level = DEBUG, server = %self.server.host, "QUIT failed: {err:?}");
        }

        let remote = Some(self.server.host.clone());
        match outcome {
            Ok(()) => TransmissionResult::Delivered,
            Err(StageError::Rejected(response)) => {
                let reply = response.to_reply();
                if reply.is_permanent() {
                    TransmissionResult::PermanentFailure { reply, remote }
                } else {
                    TransmissionResult::TemporaryFailure { reply, remote }
                }
            }
            Err(StageError::Client(err)) => TransmissionResult::TemporaryFailure {
                reply: Reply::new(451, "4.4.2", format!("Session with {} failed: {err}", self.server.host)),
                remote,
            },
            Err(StageError::Timeout(stage, after)) => TransmissionResult::TemporaryFailure {
                reply: Reply::new(451, "4.4.2", format!("{stage} timed out after {after:?}")),
                remote,
            },
        }
    }

    async fn exchange(&self, client: &mut SmtpClient) -> Result<(), StageError> {
        let timeouts = &self.config.timeouts;
        let ehlo_timeout = Duration::from_secs(timeouts.ehlo_secs);
        let helo_name = self.config.helo_name.as_str();

        let greeting = self.stage("Greeting", ehlo_timeout, client.read_greeting()).await?;
        expect_success(greeting)?;

        let mut hello = self.stage("EHLO", ehlo_timeout, client.ehlo(helo_name)).await?;
        if hello.is_permanent_error() {
            hello = self.stage("HELO", ehlo_timeout, client.helo(helo_name)).await?;
        }
        let size = hello
            .has_extension("SIZE")
            .then_some(self.entry.mail.size);
        expect_success(hello)?;

        let from = self
            .entry
            .mail
            .reverse_path
            .address()
            .map(ToString::to_string)
            .unwrap_or_default();
        let mail_from = self
            .stage(
                "MAIL FROM",
                Duration::from_secs(timeouts.mail_from_secs),
                client.mail_from(&from, size),
            )
            .await?;
        expect_success(mail_from)?;

        let rcpt_to = self
            .stage(
                "RCPT TO",
                Duration::from_secs(timeouts.rcpt_to_secs),
                client.rcpt_to(&self.entry.recipient.to_string()),
            )
            .await?;
        expect_success(rcpt_to)?;

        let data_timeout = Duration::from_secs(timeouts.data_secs);
        let data = self.stage("DATA", data_timeout, client.data()).await?;
        if !data.is_intermediate() {
            return Err(StageError::Rejected(data));
        }

        let queued = self
            .stage(
                "Message content",
                data_timeout,
                client.send_data(self.entry.mail.body()),
            )
            .await?;
        expect_success(queued)
    }

    async fn stage<T>(
        &self,
        name: &'static str,
        limit: Duration,
        future: impl Future<Output = tern_smtp::Result<T>>,
    ) -> Result<T, StageError> {
        tokio::time::timeout(limit, future)
            .await
            .map_err(|_| StageError::Timeout(name, limit))?
            .map_err(StageError::from)
    }
}

fn expect_success(response: Response) -> Result<(), StageError> {
    if response.is_success() {
        Ok(())
    } else {
        Err(StageError::Rejected(response))
    }
}
