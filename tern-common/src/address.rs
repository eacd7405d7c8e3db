use std::{
    fmt::{self, Display},
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Domain, MAX_DOMAIN_LENGTH};

/// Longest local part accepted in a forward or reverse path.
pub const MAX_LOCAL_PART_LENGTH: usize = 64;

const POSTMASTER: &str = "postmaster";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,

    #[error("Address {0} has no domain")]
    MissingDomain(String),

    #[error("Local part is longer than {MAX_LOCAL_PART_LENGTH} characters")]
    LocalPartTooLong,

    #[error("Domain is longer than {MAX_DOMAIN_LENGTH} characters")]
    DomainTooLong,

    #[error("Invalid local part: {0}")]
    InvalidLocalPart(String),

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),
}

/// A mailbox, `local_part@domain`, or the domainless global `postmaster`.
///
/// Equality and hashing ignore ASCII case in both halves; the local part keeps
/// its original spelling for display and transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    local_part: Arc<str>,
    domain: Option<Domain>,
}

impl Address {
    pub fn new(local_part: impl AsRef<str>, domain: impl Into<Domain>) -> Self {
        Self {
            local_part: Arc::from(local_part.as_ref()),
            domain: Some(domain.into()),
        }
    }

    /// The RFC 5321 global postmaster, accepted without a domain.
    pub fn global_postmaster() -> Self {
        Self {
            local_part: Arc::from(POSTMASTER),
            domain: None,
        }
    }

    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    pub fn domain(&self) -> Option<&Domain> {
        self.domain.as_ref()
    }

    pub fn is_global_postmaster(&self) -> bool {
        self.domain.is_none()
    }

    /// `postmaster@<domain>`, for any domain.
    pub fn is_domain_postmaster(&self) -> bool {
        self.domain.is_some() && self.local_part.eq_ignore_ascii_case(POSTMASTER)
    }

    /// The lowercase `local@domain` form used as a lookup key.
    pub fn key(&self) -> String {
        self.to_string().to_ascii_lowercase()
    }

    /// The address in angle brackets, as written in an SMTP path.
    pub fn as_path(&self) -> String {
        format!("<{self}>")
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.domain == other.domain && self.local_part.eq_ignore_ascii_case(&other.local_part)
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.local_part.to_ascii_lowercase().hash(state);
        self.domain.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.domain {
            Some(domain) => write!(f, "{}@{domain}", self.local_part),
            None => f.write_str(&self.local_part),
        }
    }
}

fn validate_domain(domain: &str) -> Result<(), AddressError> {
    if domain.len() > MAX_DOMAIN_LENGTH {
        return Err(AddressError::DomainTooLong);
    }

    // Address literals such as `[192.0.2.1]` are passed through untouched
    if domain.starts_with('[') && domain.ends_with(']') {
        return Ok(());
    }

    let valid = !domain.is_empty()
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(AddressError::InvalidDomain(domain.to_string()))
    }
}

fn validate_local_part(local_part: &str) -> Result<(), AddressError> {
    if local_part.len() > MAX_LOCAL_PART_LENGTH {
        return Err(AddressError::LocalPartTooLong);
    }

    let quoted = local_part.len() >= 2 && local_part.starts_with('"') && local_part.ends_with('"');
    let valid = !local_part.is_empty()
        && local_part
            .chars()
            .all(|c| !c.is_control() && (quoted || !c.is_whitespace()));

    if valid {
        Ok(())
    } else {
        Err(AddressError::InvalidLocalPart(local_part.to_string()))
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s
            .strip_prefix('<')
            .and_then(|inner| inner.strip_suffix('>'))
            .unwrap_or(s);

        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        if s.eq_ignore_ascii_case(POSTMASTER) {
            return Ok(Self::global_postmaster());
        }

        // A quoted local part may itself contain '@'
        let Some((local_part, domain)) = s.rsplit_once('@') else {
            return Err(AddressError::MissingDomain(s.to_string()));
        };

        validate_local_part(local_part)?;
        validate_domain(domain)?;

        Ok(Self::new(local_part, domain))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

/// The envelope sender. The null path `<>` is used by bounces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ReversePath {
    #[default]
    Null,
    Mailbox(Address),
}

impl ReversePath {
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub const fn address(&self) -> Option<&Address> {
        match self {
            Self::Null => None,
            Self::Mailbox(address) => Some(address),
        }
    }

    /// The path as written after `MAIL FROM:`.
    pub fn as_path(&self) -> String {
        match self {
            Self::Null => String::from("<>"),
            Self::Mailbox(address) => address.as_path(),
        }
    }
}

impl Display for ReversePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("<>"),
            Self::Mailbox(address) => Display::fmt(address, f),
        }
    }
}

impl From<Address> for ReversePath {
    fn from(value: Address) -> Self {
        Self::Mailbox(value)
    }
}

impl FromStr for ReversePath {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "<>" => Ok(Self::Null),
            path => path.parse().map(Self::Mailbox),
        }
    }
}
