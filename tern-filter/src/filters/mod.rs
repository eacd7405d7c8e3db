//! Built-in filters.
//!
//! The conventional order for a receiving MX is lookup-destination,
//! accept-global-postmaster, prohibit-relaying, accept-domain-postmaster,
//! refuse-blacklisted-recipient, refuse-unknown-recipient,
//! reject-on-failed-spf and accept-all-recipient, followed by the message
//! filters reject-large-mail and stop-loop.

mod message;
mod recipient;

pub use message::{RejectLargeMail, StopLoop, received_headers};
pub use recipient::{
    AcceptAllRecipient, AcceptDomainPostmaster, AcceptGlobalPostmaster, LookupDestination,
    ProhibitRelaying, RefuseBlacklistedRecipient, RefuseUnknownRecipient, RejectOnFailedSpf,
};
