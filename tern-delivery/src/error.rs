//! Error types for destination execution, queueing and configuration.

use tern_common::Reply;
use tern_spool::SpoolError;
use thiserror::Error;

/// Why a destination could not be executed for one recipient.
///
/// The carried reply is what the session layer returns to the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Local resources are unavailable; the client should try again later.
    #[error("Temporary failure: {0}")]
    Temporary(Reply),

    /// The recipient can never be delivered to as configured.
    #[error("Permanent failure: {0}")]
    Permanent(Reply),
}

impl DispatchError {
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    pub const fn reply(&self) -> &Reply {
        match self {
            Self::Temporary(reply) | Self::Permanent(reply) => reply,
        }
    }

    pub(crate) fn local_error() -> Self {
        Self::Temporary(Reply::local_error())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Spool error: {0}")]
    Spool(#[from] SpoolError),

    #[error("Queue {0} has not been initialised")]
    NotInitialised(String),

    #[error("Queue {0} is shutting down")]
    ShuttingDown(String),
}

impl QueueError {
    pub const fn is_temporary(&self) -> bool {
        match self {
            Self::Spool(err) => err.is_temporary(),
            Self::NotInitialised(_) => false,
            Self::ShuttingDown(_) => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum MaildropError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid maildrop name: {0:?}")]
    InvalidName(String),

    #[error("Maildrop {0} is unavailable")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid retry backoff: {0}")]
    Backoff(String),

    #[error("Invalid SRS configuration: {0}")]
    Srs(String),

    #[error("DNS resolver error: {0}")]
    Dns(#[from] crate::dns::DnsError),
}
