use tern_common::{Destination, Reply};

/// Final disposition of a recipient or a message for one session.
///
/// `Reject` and `TemporaryFailure` are terminal: the client sees the reply
/// and the recipient is not evaluated again within the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict<A> {
    Accept(A),
    Reject(Reply),
    TemporaryFailure(Reply),
}

pub type RecipientVerdict = Verdict<Destination>;

pub type MessageVerdict = Verdict<()>;

impl<A> Verdict<A> {
    pub const fn is_accept(&self) -> bool {
        matches!(self, Self::Accept(_))
    }

    /// The reply sent to the client, when the verdict carries one.
    pub const fn reply(&self) -> Option<&Reply> {
        match self {
            Self::Accept(_) => None,
            Self::Reject(reply) | Self::TemporaryFailure(reply) => Some(reply),
        }
    }

    pub fn accepted(self) -> Option<A> {
        match self {
            Self::Accept(accepted) => Some(accepted),
            Self::Reject(_) | Self::TemporaryFailure(_) => None,
        }
    }
}
