//! Domain names.
//!
//! Domains compare case-insensitively, so they are folded to ASCII lowercase
//! when constructed and every derived comparison or hash is already normalised.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// Longest domain accepted in a forward or reverse path.
pub const MAX_DOMAIN_LENGTH: usize = 255;

/// A lowercase domain name.
///
/// ```
/// use tern_common::Domain;
///
/// let domain = Domain::new("Mail.Example.COM");
/// assert_eq!(domain.as_str(), "mail.example.com");
/// assert_eq!(domain, Domain::new("mail.example.com"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Domain(Arc<str>);

impl Domain {
    pub fn new(s: impl AsRef<str>) -> Self {
        Self(Arc::from(s.as_ref().to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for `example.com` and any of its subdomains.
    pub fn is_within(&self, parent: &Self) -> bool {
        self == parent
            || self
                .0
                .strip_suffix(parent.as_str())
                .is_some_and(|prefix| prefix.ends_with('.'))
    }
}

impl Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Domain {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for Domain {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for Domain {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<Domain> for String {
    fn from(domain: Domain) -> Self {
        domain.0.to_string()
    }
}
