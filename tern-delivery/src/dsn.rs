//! Delivery Status Notifications per RFC 3464
//!
//! A DSN is a new mail with the null reverse path, addressed to the reverse
//! path of the mail it reports on:
//! ```text
//! multipart/report; report-type="delivery-status"
//! ├── text/plain              human-readable explanation
//! ├── message/delivery-status per-message and per-recipient fields
//! └── text/rfc822-headers     headers of the original mail
//! ```

use std::{
    fmt::{self, Display, Write as _},
    time::SystemTime,
};

use mailparse::MailHeaderMap;
use serde::Deserialize;
use tern_common::{Mail, ReversePath, Reply, internal};
use tern_spool::QueueEntry;

/// Header section of the original mail is cut off after this many bytes.
const MAX_ORIGINAL_HEADERS: usize = 16 * 1024;

#[derive(Debug, Clone, Deserialize)]
pub struct DsnConfig {
    /// Host name given in the Reporting-MTA field.
    pub reporting_mta: String,

    /// Shown in the `From:` header of notifications.
    #[serde(default = "defaults::postmaster")]
    pub postmaster: String,
}

mod defaults {
    pub fn postmaster() -> String {
        String::from("MAILER-DAEMON")
    }
}

impl DsnConfig {
    pub fn new(reporting_mta: impl Into<String>) -> Self {
        Self {
            reporting_mta: reporting_mta.into(),
            postmaster: defaults::postmaster(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DsnKind {
    /// Delivery was given up.
    Failure,
    /// Delivery is still being retried.
    Delayed,
}

impl DsnKind {
    const fn action(self) -> &'static str {
        match self {
            Self::Failure => "failed",
            Self::Delayed => "delayed",
        }
    }
}

impl Display for DsnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failure => f.write_str("Failure"),
            Self::Delayed => f.write_str("Delay"),
        }
    }
}

/// Build the notification for `entry`, or `None` when its mail has the null
/// reverse path (notifications are never sent about notifications).
pub fn generate_dsn(
    entry: &QueueEntry,
    kind: DsnKind,
    reply: &Reply,
    remote: Option<&str>,
    config: &DsnConfig,
) -> Option<Mail> {
    let sender = entry.mail.reverse_path.address()?;

    internal!(
        level = INFO,
        entry = %entry.id,
        recipient = %entry.recipient,
        %kind,
        "Generating delivery status notification"
    );

    let subject = original_subject(&entry.mail).map_or_else(
        || format!("Delivery Status Notification ({kind})"),
        |subject| format!("Delivery Status Notification ({kind}): {subject}"),
    );
    let boundary = format!("----=_Report_{}", ulid::Ulid::new());
    let now = rfc2822(SystemTime::now());

    let body = format!(
        "From: Mail Delivery System <{postmaster}@{reporting_mta}>\r\n\
        To: {sender}\r\n\
        Subject: {subject}\r\n\
        Date: {now}\r\n\
        Message-ID: <{id}@{reporting_mta}>\r\n\
        Auto-Submitted: auto-replied\r\n\
        MIME-Version: 1.0\r\n\
        Content-Type: multipart/report; report-type=delivery-status; boundary=\"{boundary}\"\r\n\
        \r\n\
        This is a multi-part message in MIME format.\r\n\
        \r\n\
        --{boundary}\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        Content-Transfer-Encoding: 7bit\r\n\
        \r\n\
        {human_readable}\r\n\
        --{boundary}\r\n\
        Content-Type: message/delivery-status\r\n\
        \r\n\
        {machine_readable}\r\n\
        --{boundary}\r\n\
        Content-Type: text/rfc822-headers\r\n\
        \r\n\
        {original_headers}\r\n\
        --{boundary}--\r\n",
        postmaster = config.postmaster,
        reporting_mta = config.reporting_mta,
        id = ulid::Ulid::new(),
        human_readable = human_readable_part(entry, kind, reply, config),
        machine_readable = delivery_status_part(entry, kind, reply, remote, config),
        original_headers = original_headers(&entry.mail),
    );

    Some(Mail::new(
        ReversePath::Null,
        vec![sender.clone()],
        body.into_bytes(),
    ))
}

fn human_readable_part(entry: &QueueEntry, kind: DsnKind, reply: &Reply, config: &DsnConfig) -> String {
    let summary = match kind {
        DsnKind::Failure => {
            "Your message could not be delivered to the recipient below.\r\n\
            No further attempts will be made."
        }
        DsnKind::Delayed => {
            "Your message has not yet been delivered to the recipient below.\r\n\
            Delivery will be retried; you do not need to resend it."
        }
    };

    format!(
        "This is the mail system at host {host}.\r\n\
        \r\n\
        {summary}\r\n\
        \r\n\
        <{recipient}>: {reply}\r\n\
        \r\n\
        Delivery attempts: {attempts}\r\n",
        host = config.reporting_mta,
        recipient = entry.recipient,
        attempts = entry.attempts,
    )
}

fn delivery_status_part(
    entry: &QueueEntry,
    kind: DsnKind,
    reply: &Reply,
    remote: Option<&str>,
    config: &DsnConfig,
) -> String {
    let mut dsn = format!("Reporting-MTA: dns; {}\r\n", config.reporting_mta);
    let _ = write!(dsn, "Arrival-Date: {}\r\n", rfc2822(entry.mail.arrived_at));

    dsn.push_str("\r\n");
    let _ = write!(dsn, "Final-Recipient: rfc822; {}\r\n", entry.recipient);
    let _ = write!(dsn, "Action: {}\r\n", kind.action());
    let _ = write!(dsn, "Status: {}\r\n", reply.status());
    if let Some(remote) = remote {
        let _ = write!(dsn, "Remote-MTA: dns; {remote}\r\n");
    }
    let _ = write!(dsn, "Diagnostic-Code: smtp; {reply}\r\n");
    let _ = write!(dsn, "Last-Attempt-Date: {}\r\n", rfc2822(SystemTime::now()));

    dsn
}

fn original_headers(mail: &Mail) -> String {
    let headers = mail.headers();
    if headers.is_empty() {
        return String::from("(No headers available)");
    }

    String::from_utf8_lossy(&headers[..headers.len().min(MAX_ORIGINAL_HEADERS)]).into_owned()
}

fn original_subject(mail: &Mail) -> Option<String> {
    let (headers, _) = mailparse::parse_headers(mail.headers()).ok()?;
    headers
        .get_first_value("Subject")
        .filter(|subject| !subject.trim().is_empty())
}

fn rfc2822(time: SystemTime) -> String {
    chrono::DateTime::<chrono::Utc>::from(time).to_rfc2822()
}
