use serde::{Deserialize, Serialize};

use crate::address::Address;

/// What happens to mail accepted for a recipient.
///
/// Destinations are plain data produced by the recipient table; executing them
/// is the dispatcher's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Destination {
    /// Accept and discard.
    Drop,
    /// Hand the mail to the local maildrop with the given name.
    Store { maildrop: String },
    /// Send a copy to every member, rewriting the reverse path when SRS is enabled.
    Forward { members: Vec<Address> },
    /// Send through a fixed smart host.
    Relay { host: String },
    /// Send to the MX of the recipient's domain.
    Transmit,
    /// The recipient is another name for `canonical`.
    AliasTo { canonical: Address },
    /// The recipient is an SRS address whose original must be recovered.
    SrsRewrite,
}

impl Destination {
    /// Destinations that resolve to another recipient rather than an action.
    pub const fn is_alias(&self) -> bool {
        matches!(self, Self::AliasTo { .. } | Self::SrsRewrite)
    }

    /// Destinations executed through the persistent queue.
    pub const fn is_queued(&self) -> bool {
        matches!(
            self,
            Self::Forward { .. } | Self::Relay { .. } | Self::Transmit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Destination::SrsRewrite.is_alias());
        assert!(
            Destination::AliasTo {
                canonical: Address::new("john", "example.com")
            }
            .is_alias()
        );
        assert!(!Destination::Transmit.is_alias());

        assert!(Destination::Transmit.is_queued());
        assert!(
            Destination::Relay {
                host: String::from("smarthost.example.net")
            }
            .is_queued()
        );
        assert!(!Destination::Drop.is_queued());
        assert!(
            !Destination::Store {
                maildrop: String::from("john")
            }
            .is_queued()
        );
    }
}
