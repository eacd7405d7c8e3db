pub mod address;
pub mod destination;
pub mod domain;
pub mod logging;
pub mod mail;
pub mod reply;

pub use address::{Address, AddressError, ReversePath};
pub use destination::Destination;
pub use domain::Domain;
pub use mail::{Mail, MailId};
pub use reply::Reply;
pub use tracing;

/// Lifecycle signal broadcast to every long-running component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
