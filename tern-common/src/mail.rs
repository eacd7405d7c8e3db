use std::{
    fmt::{self, Display},
    str::FromStr,
    sync::Arc,
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::address::{Address, ReversePath};

/// Identifier of an accepted mail, shared by every queue entry derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MailId(Ulid);

impl MailId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl Display for MailId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl FromStr for MailId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s).map(Self)
    }
}

/// An accepted message: the envelope plus a shared, immutable body.
///
/// Mail is never mutated once accepted. Bounces, SRS rewrites and per-recipient
/// copies are derived as new values with the `with_*` methods, sharing the body.
///
/// The body is not part of the serialised form; stores persist it separately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mail {
    pub id: MailId,
    pub reverse_path: ReversePath,
    pub recipients: Vec<Address>,
    pub size: usize,
    pub arrived_at: SystemTime,
    #[serde(skip, default = "empty_body")]
    body: Arc<[u8]>,
}

fn empty_body() -> Arc<[u8]> {
    Arc::from(Vec::new())
}

impl Mail {
    pub fn new(reverse_path: ReversePath, recipients: Vec<Address>, body: impl Into<Arc<[u8]>>) -> Self {
        let body = body.into();

        Self {
            id: MailId::generate(),
            reverse_path,
            recipients,
            size: body.len(),
            arrived_at: SystemTime::now(),
            body,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn shared_body(&self) -> Arc<[u8]> {
        Arc::clone(&self.body)
    }

    /// Reattach a body read back from storage.
    #[must_use]
    pub fn with_body(&self, body: impl Into<Arc<[u8]>>) -> Self {
        Self {
            body: body.into(),
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_reverse_path(&self, reverse_path: ReversePath) -> Self {
        Self {
            reverse_path,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_recipients(&self, recipients: Vec<Address>) -> Self {
        Self {
            recipients,
            ..self.clone()
        }
    }

    /// The header section, up to the first empty line.
    pub fn headers(&self) -> &[u8] {
        let body = self.body();

        body.windows(4)
            .position(|w| w == b"\r\n\r\n")
            .map(|end| &body[..end + 2])
            .or_else(|| {
                body.windows(2)
                    .position(|w| w == b"\n\n")
                    .map(|end| &body[..=end])
            })
            .unwrap_or(body)
    }
}
