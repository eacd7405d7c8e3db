use std::{
    fmt::{self, Display},
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use tern_common::{Address, Mail, Reply};

/// Identifier for a queue entry
///
/// A ULID, which doubles as the stem of the entry's file names. ULIDs sort by
/// creation time, so listing a store yields entries oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId {
    id: ulid::Ulid,
}

impl EntryId {
    /// Parse an entry ID from a file name like `01ARYZ6S41....bin`
    ///
    /// Only the file kinds a store writes are recognised, and anything that
    /// could escape the store directory is rejected.
    pub fn from_filename(filename: &str) -> Option<Self> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }

        let stem = filename
            .strip_suffix(".bin")
            .or_else(|| filename.strip_suffix(".eml"))
            .or_else(|| filename.strip_suffix(".inflight"))?;

        let id = ulid::Ulid::from_string(stem).ok()?;

        Some(Self { id })
    }

    pub const fn new(id: ulid::Ulid) -> Self {
        Self { id }
    }

    pub fn generate() -> Self {
        Self {
            id: ulid::Ulid::new(),
        }
    }

    pub const fn ulid(&self) -> ulid::Ulid {
        self.id
    }

    /// Milliseconds since the Unix epoch at which this ID was generated.
    pub const fn timestamp_ms(&self) -> u64 {
        self.id.timestamp_ms()
    }
}

impl Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.id, f)
    }
}

/// How an entry reaches its recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Route {
    /// Look up the MX of the recipient's domain.
    Transmit,
    /// Hand the mail to a fixed smart host.
    Relay { host: String },
}

/// One recipient's share of an accepted mail, waiting for transmission.
///
/// Entries are created when a queued destination executes, updated by the
/// retry policy after each failed attempt, and deleted when delivered,
/// bounced or abandoned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub mail: Mail,
    pub recipient: Address,
    pub route: Route,
    pub attempts: u32,
    pub next_attempt_at: SystemTime,
    pub created_at: SystemTime,
    /// Delay report points already covered by a queued notification.
    pub delay_reports: u32,
    /// Times the current attempt was put off because every host was busy.
    pub postponements: u32,
    pub last_error: Option<String>,
    /// Set when delivery has finally failed but the failure notification
    /// could not be queued yet. Such an entry is never transmitted again.
    pub undelivered: Option<FailureNotice>,
}

/// The final failure of an entry, kept until it is reported to the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNotice {
    pub reply: Reply,
    pub remote: Option<String>,
}

impl QueueEntry {
    /// A new entry, due immediately.
    pub fn new(mail: Mail, recipient: Address, route: Route) -> Self {
        let now = SystemTime::now();

        Self {
            id: EntryId::generate(),
            mail,
            recipient,
            route,
            attempts: 0,
            next_attempt_at: now,
            created_at: now,
            delay_reports: 0,
            postponements: 0,
            last_error: None,
            undelivered: None,
        }
    }

    pub fn is_due(&self, now: SystemTime) -> bool {
        self.next_attempt_at <= now
    }
}
