//! Sender Rewriting Scheme.
//!
//! Forwarded mail leaves with a reverse path at the forwarding domain so SPF
//! checks at the next hop pass, while bounces can still be routed back:
//!
//! ```text
//! john@source.example.com
//!   -> SRS0=HHHH=TT=source.example.com=john@forwarder.example.com
//!   -> SRS1=HHHH=forwarder.example.com==HHHH=TT=source.example.com=john@we.example.net
//! ```
//!
//! `HHHH` authenticates the address and `TT` is the day it was issued, so
//! rewritten addresses can neither be forged nor replayed forever.

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use ring::hmac;
use serde::Deserialize;
use tern_common::{Address, Domain, Reply, ReversePath, internal};
use thiserror::Error;

use crate::error::ConfigError;

/// Timestamps wrap around after this many days.
const TIMESLOTS: u32 = 1024;

const BASE32: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

const HASH_LENGTH: usize = 4;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SrsError {
    #[error("SRS hash is invalid")]
    InvalidSignature,

    #[error("SRS timestamp expired")]
    Expired,

    #[error("SRS address format invalid")]
    Malformed,
}

impl SrsError {
    /// The reply given for a bounce to an unusable SRS address.
    pub fn reply(&self) -> Reply {
        Reply::new(553, "5.1.0", self.to_string())
    }
}

/// ```ron
/// srs: (
///     secret: "6d792d7365637265742d6b6579",
///     domain: "forwarder.example.com",
///     local_domains: ["example.com"],
/// ),
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct SrsConfig {
    /// Hex encoded HMAC key.
    pub secret: String,

    /// Domain rewritten addresses are issued at.
    pub domain: String,

    /// Reverse paths at these domains are left alone.
    #[serde(default)]
    pub local_domains: Vec<String>,

    #[serde(default = "defaults::max_age_days")]
    pub max_age_days: u32,
}

mod defaults {
    pub const fn max_age_days() -> u32 {
        21
    }
}

pub struct Srs {
    key: hmac::Key,
    domain: Domain,
    local_domains: Vec<Domain>,
    max_age_days: u32,
}

impl fmt::Debug for Srs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Srs")
            .field("domain", &self.domain)
            .field("local_domains", &self.local_domains)
            .field("max_age_days", &self.max_age_days)
            .finish_non_exhaustive()
    }
}

impl Srs {
    pub fn new(config: &SrsConfig) -> Result<Self, ConfigError> {
        let secret = hex::decode(&config.secret)
            .map_err(|err| ConfigError::Srs(format!("secret is not valid hex: {err}")))?;
        if secret.is_empty() {
            return Err(ConfigError::Srs(String::from("secret must not be empty")));
        }
        if config.domain.is_empty() {
            return Err(ConfigError::Srs(String::from("domain must not be empty")));
        }
        if config.max_age_days >= TIMESLOTS {
            return Err(ConfigError::Srs(format!(
                "max_age_days must be less than {TIMESLOTS}"
            )));
        }

        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, &secret),
            domain: Domain::new(&config.domain),
            local_domains: config.local_domains.iter().map(Domain::new).collect(),
            max_age_days: config.max_age_days,
        })
    }

    pub const fn domain(&self) -> &Domain {
        &self.domain
    }

    /// The reverse path to use when forwarding mail sent from `reverse_path`.
    ///
    /// The null reverse path and addresses at local domains are returned
    /// unchanged.
    pub fn forward(&self, reverse_path: &ReversePath) -> ReversePath {
        match reverse_path {
            ReversePath::Null => ReversePath::Null,
            ReversePath::Mailbox(address) if self.is_local(address) => reverse_path.clone(),
            ReversePath::Mailbox(address) => ReversePath::Mailbox(self.encode(address)),
        }
    }

    fn is_local(&self, address: &Address) -> bool {
        address.domain().is_none_or(|domain| {
            *domain == self.domain || self.local_domains.iter().any(|local| local == domain)
        })
    }

    pub fn encode(&self, address: &Address) -> Address {
        self.encode_at(address, SystemTime::now())
    }

    pub fn encode_at(&self, address: &Address, now: SystemTime) -> Address {
        let local = address.local_part();
        let host = address.domain().map_or("", |domain| domain.as_str());

        let local_part = match srs_prefix(local) {
            Some(Tag::Srs0) => {
                // Keep the separator so the first hop can be recovered verbatim
                let rest = &local[4..];
                format!("SRS1={}={host}={rest}", self.hash(&[host, rest]))
            }
            Some(Tag::Srs1) => match split_srs1(&local[5..]) {
                Some((_, first_host, compact)) => format!(
                    "SRS1={}={first_host}={compact}",
                    self.hash(&[first_host, compact])
                ),
                None => self.srs0(local, host, now),
            },
            None => self.srs0(local, host, now),
        };

        Address::new(local_part, self.domain.clone())
    }

    fn srs0(&self, local: &str, host: &str, now: SystemTime) -> String {
        let timestamp = timestamp(day(now));
        format!(
            "SRS0={}={timestamp}={host}={local}",
            self.hash(&[&timestamp, host, local])
        )
    }

    pub fn decode(&self, address: &Address) -> Result<Address, SrsError> {
        self.decode_at(address, SystemTime::now())
    }

    /// Recover the address one hop closer to the original sender.
    pub fn decode_at(&self, address: &Address, now: SystemTime) -> Result<Address, SrsError> {
        let local = address.local_part();

        match srs_prefix(local) {
            Some(Tag::Srs0) => {
                let mut fields = local[5..].splitn(4, '=');
                let (Some(hash), Some(stamp), Some(host), Some(original)) =
                    (fields.next(), fields.next(), fields.next(), fields.next())
                else {
                    return Err(SrsError::Malformed);
                };
                if host.is_empty() || original.is_empty() {
                    return Err(SrsError::Malformed);
                }

                self.verify(hash, &[stamp, host, original])?;

                let slot = parse_timestamp(stamp).ok_or(SrsError::Malformed)?;
                if !is_valid_timeslot(slot, day(now), self.max_age_days) {
                    return Err(SrsError::Expired);
                }

                Ok(Address::new(original, host))
            }
            Some(Tag::Srs1) => {
                let (hash, first_host, compact) =
                    split_srs1(&local[5..]).ok_or(SrsError::Malformed)?;

                self.verify(hash, &[first_host, compact])?;

                Ok(Address::new(format!("SRS0{compact}"), first_host))
            }
            None => Err(SrsError::Malformed),
        }
    }

    fn hash(&self, parts: &[&str]) -> String {
        let mut context = hmac::Context::with_key(&self.key);
        for part in parts {
            context.update(part.to_lowercase().as_bytes());
        }

        let mut encoded = STANDARD.encode(context.sign().as_ref());
        encoded.truncate(HASH_LENGTH);
        encoded
    }

    fn verify(&self, hash: &str, parts: &[&str]) -> Result<(), SrsError> {
        let expected = self.hash(parts);

        if hash == expected {
            Ok(())
        } else if hash.eq_ignore_ascii_case(&expected) {
            internal!(
                level = WARN,
                "SRS hash matched only ignoring case, a relay has changed the case of the local part"
            );
            Ok(())
        } else {
            Err(SrsError::InvalidSignature)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tag {
    Srs0,
    Srs1,
}

fn srs_prefix(local: &str) -> Option<Tag> {
    let bytes = local.as_bytes();
    if bytes.len() <= 5 || !matches!(bytes[4], b'=' | b'+' | b'-') {
        return None;
    }

    if bytes[..4].eq_ignore_ascii_case(b"SRS0") {
        Some(Tag::Srs0)
    } else if bytes[..4].eq_ignore_ascii_case(b"SRS1") {
        Some(Tag::Srs1)
    } else {
        None
    }
}

/// `HHHH=first-host=compact`, where `compact` keeps its leading separator.
fn split_srs1(rest: &str) -> Option<(&str, &str, &str)> {
    let mut fields = rest.splitn(3, '=');
    let hash = fields.next()?;
    let host = fields.next()?;
    let compact = fields.next()?;

    if hash.is_empty() || host.is_empty() || compact.is_empty() {
        return None;
    }

    Some((hash, host, compact))
}

fn day(now: SystemTime) -> u32 {
    let days = now.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() / SECONDS_PER_DAY;
    #[allow(clippy::cast_possible_truncation)]
    let slot = (days % u64::from(TIMESLOTS)) as u32;
    slot
}

fn timestamp(slot: u32) -> String {
    [slot >> 5, slot]
        .iter()
        .map(|bits| char::from(BASE32[(bits & 31) as usize]))
        .collect()
}

fn parse_timestamp(stamp: &str) -> Option<u32> {
    let bytes = stamp.as_bytes();
    if bytes.len() != 2 {
        return None;
    }

    let index = |byte: u8| {
        BASE32
            .iter()
            .position(|&c| c == byte.to_ascii_uppercase())
            .and_then(|index| u32::try_from(index).ok())
    };

    Some((index(bytes[0])? << 5) | index(bytes[1])?)
}

/// Whether an address issued on day `slot` is still usable on day `today`.
///
/// One day of clock skew into the future is accepted. Both days are taken
/// modulo [`TIMESLOTS`].
pub fn is_valid_timeslot(slot: u32, today: u32, max_age_days: u32) -> bool {
    let first = (slot + TIMESLOTS - 1) % TIMESLOTS;
    let last = first + 1 + max_age_days;
    let today = if today < first {
        today + TIMESLOTS
    } else {
        today
    };

    today <= last
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    fn srs(domain: &str) -> Srs {
        Srs::new(&SrsConfig {
            secret: hex::encode("a very secret key"),
            domain: domain.to_string(),
            local_domains: vec![String::from("example.com")],
            max_age_days: 21,
        })
        .unwrap()
    }

    fn address(s: &str) -> Address {
        s.parse().unwrap()
    }

    /// 2011-07-21, day 15176, slot 840 ("2I")
    fn issued() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(15_176 * SECONDS_PER_DAY + 3600)
    }

    #[test]
    fn timestamp_encoding() {
        assert_eq!(day(issued()), 840);
        assert_eq!(timestamp(840), "2I");
        assert_eq!(parse_timestamp("2I"), Some(840));
        assert_eq!(parse_timestamp("2i"), Some(840));
        assert_eq!(parse_timestamp("2"), None);
        assert_eq!(parse_timestamp("21"), None);
    }

    #[test]
    fn timeslot_validity() {
        let cases = [
            (0, 0, true),
            (0, 10, true),
            (0, 11, false),
            (10, 9, true),
            (10, 8, false),
            (0, 1023, true),
            (0, 1022, false),
            (1020, 0, true),
        ];

        for (slot, today, expected) in cases {
            assert_eq!(
                is_valid_timeslot(slot, today, 10),
                expected,
                "slot {slot}, today {today}"
            );
        }
    }

    #[test]
    fn plain_address_round_trip() {
        let srs = srs("forwarder.example.com");
        let original = address("john@source.example.com");

        let rewritten = srs.encode_at(&original, issued());
        let local = rewritten.local_part();
        assert!(local.starts_with("SRS0="));
        assert!(local.ends_with("=2I=source.example.com=john"));
        assert_eq!(rewritten.domain(), Some(&Domain::new("forwarder.example.com")));

        assert_eq!(srs.decode_at(&rewritten, issued()), Ok(original.clone()));
        assert_eq!(
            srs.decode_at(&rewritten, issued() + Duration::from_secs(21 * SECONDS_PER_DAY)),
            Ok(original)
        );
    }

    #[test]
    fn second_hop_uses_srs1() {
        let first = srs("forwarder.example.com");
        let second = Srs::new(&SrsConfig {
            secret: hex::encode("another key"),
            domain: String::from("we.example.net"),
            local_domains: vec![],
            max_age_days: 21,
        })
        .unwrap();

        let original = address("john@source.example.com");
        let hop1 = first.encode_at(&original, issued());
        let hop2 = second.encode_at(&hop1, issued());

        let hop1_local = hop1.local_part();
        let expected_suffix = format!("=forwarder.example.com={}", &hop1_local[4..]);
        assert!(hop2.local_part().starts_with("SRS1="));
        assert!(hop2.local_part().ends_with(&expected_suffix));
        assert!(hop2.local_part().contains("==")); // separator of the SRS0 part is kept

        // A third hop re-signs but keeps the first hop
        let third = srs("third.example.org");
        let hop3 = third.encode_at(&hop2, issued());
        assert!(hop3.local_part().ends_with(&expected_suffix));
        assert_eq!(third.decode_at(&hop3, issued()), Ok(hop1.clone()));

        // The second hop recovers the first hop's address, which the first hop decodes
        let back = second.decode_at(&hop2, issued()).unwrap();
        assert_eq!(back, hop1);
        assert_eq!(first.decode_at(&back, issued()), Ok(original));
    }

    #[test]
    fn tampered_addresses_are_rejected() {
        let srs = srs("forwarder.example.com");
        let rewritten = srs.encode_at(&address("john@source.example.com"), issued());
        let local = rewritten.local_part();

        let forged = Address::new(local.replace("=john", "=jane"), "forwarder.example.com");
        assert_eq!(srs.decode_at(&forged, issued()), Err(SrsError::InvalidSignature));

        let other_key = Srs::new(&SrsConfig {
            secret: hex::encode("not the key"),
            domain: String::from("forwarder.example.com"),
            local_domains: vec![],
            max_age_days: 21,
        })
        .unwrap();
        assert_eq!(
            other_key.decode_at(&rewritten, issued()),
            Err(SrsError::InvalidSignature)
        );
    }

    #[test]
    fn case_smashed_hash_is_accepted() {
        let srs = srs("forwarder.example.com");
        let original = address("john@source.example.com");
        let rewritten = srs.encode_at(&original, issued());

        let smashed = Address::new(rewritten.local_part().to_uppercase(), "forwarder.example.com");
        assert_eq!(
            srs.decode_at(&smashed, issued()),
            Ok(Address::new("JOHN", "SOURCE.EXAMPLE.COM"))
        );
    }

    #[test]
    fn expired_addresses_are_rejected() {
        let srs = srs("forwarder.example.com");
        let rewritten = srs.encode_at(&address("john@source.example.com"), issued());

        let late = issued() + Duration::from_secs(23 * SECONDS_PER_DAY);
        assert_eq!(srs.decode_at(&rewritten, late), Err(SrsError::Expired));
        assert_eq!(SrsError::Expired.reply().to_string(), "553 5.1.0 SRS timestamp expired");
    }

    #[test]
    fn malformed_addresses() {
        let srs = srs("forwarder.example.com");

        for local in ["john", "SRS0=abcd=2I", "SRS1=abcd", "SRS0=", "SRS1=abcd=host="] {
            assert_eq!(
                srs.decode_at(&Address::new(local, "forwarder.example.com"), issued()),
                Err(SrsError::Malformed),
                "{local}"
            );
        }
    }

    #[test]
    fn forward_skips_null_and_local_reverse_paths() {
        let srs = srs("forwarder.example.com");

        assert_eq!(srs.forward(&ReversePath::Null), ReversePath::Null);

        let local = ReversePath::Mailbox(address("jane@example.com"));
        assert_eq!(srs.forward(&local), local);

        let remote = ReversePath::Mailbox(address("john@source.example.com"));
        let forwarded = srs.forward(&remote);
        assert_ne!(forwarded, remote);
        assert!(forwarded.address().unwrap().local_part().starts_with("SRS0="));
    }

    #[test]
    fn invalid_configuration() {
        let config = |secret: &str, domain: &str| SrsConfig {
            secret: secret.to_string(),
            domain: domain.to_string(),
            local_domains: vec![],
            max_age_days: 21,
        };

        assert!(Srs::new(&config("not hex", "example.com")).is_err());
        assert!(Srs::new(&config("", "example.com")).is_err());
        assert!(Srs::new(&config("abcd", "")).is_err());
    }
}
