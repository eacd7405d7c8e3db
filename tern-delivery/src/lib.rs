//! Everything that happens to a mail after it has been accepted.
//!
//! - [`destination::Dispatcher`] executes the destination accepted for each
//!   recipient: local maildrops complete immediately, everything else becomes
//!   one [`tern_spool::QueueEntry`] per recipient on a persistent [`Queue`].
//! - [`Queue`] workers hand entries to a [`DeliveryAgent`], which transmits
//!   them through the [`TransmissionEngine`] and applies the [`RetryPolicy`]
//!   to failures, queueing delivery status notifications as needed.
//! - [`Srs`] rewrites reverse paths of forwarded mail and decodes bounces
//!   addressed to rewritten addresses.

pub mod agent;
pub mod connection;
pub mod destination;
pub mod dns;
pub mod dsn;
pub mod error;
pub mod maildrop;
pub mod queue;
pub mod retry;
pub mod srs;
pub mod transmission;

pub use agent::DeliveryAgent;
pub use connection::{ConnectionRegistry, ConnectionSlot, SlotError};
pub use destination::Dispatcher;
pub use dns::{DnsConfig, DnsError, DnsResolver, MailServer, MxResolver, StaticResolver};
pub use dsn::{DsnConfig, DsnKind, generate_dsn};
pub use error::{ConfigError, DispatchError, MaildropError, QueueError};
pub use maildrop::{DirMaildrop, Maildrop, MemoryMaildrop};
pub use queue::{Completion, Queue, QueueConfig, QueueHandler};
pub use retry::{Backoff, RetryDecision, RetryPolicy};
pub use srs::{Srs, SrsConfig, SrsError};
pub use transmission::{
    SmtpTimeouts, TransmissionConfig, TransmissionEngine, TransmissionResult, Transmitter,
};
