use async_trait::async_trait;
use tern_common::{Reply, internal};

use crate::{
    context::MessageContext,
    pipeline::{Stage, Step},
    verdict::{MessageVerdict, Verdict},
};

mod defaults {
    pub const fn max_size() -> usize {
        25_000_000
    }

    pub const fn max_received_headers() -> usize {
        100
    }
}

pub struct RejectLargeMail {
    max_size: usize,
}

impl RejectLargeMail {
    pub const fn new(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for RejectLargeMail {
    fn default() -> Self {
        Self::new(defaults::max_size())
    }
}

#[async_trait]
impl Stage<MessageContext, MessageVerdict> for RejectLargeMail {
    fn name(&self) -> &'static str {
        "reject-large-mail"
    }

    async fn evaluate(&self, context: &mut MessageContext) -> Step<MessageVerdict> {
        if context.mail.size > self.max_size {
            Step::Decide(Verdict::Reject(Reply::new(
                552,
                "5.3.4",
                format!(
                    "Message too large, maximum is {} bytes",
                    self.max_size
                ),
            )))
        } else {
            Step::Continue
        }
    }
}

/// Rejects mail that has passed through too many hops.
pub struct StopLoop {
    max_received_headers: usize,
}

impl StopLoop {
    pub const fn new(max_received_headers: usize) -> Self {
        Self {
            max_received_headers,
        }
    }
}

impl Default for StopLoop {
    fn default() -> Self {
        Self::new(defaults::max_received_headers())
    }
}

/// Number of `Received` trace headers in a header section.
pub fn received_headers(headers: &[u8]) -> usize {
    match mailparse::parse_headers(headers) {
        Ok((headers, _)) => headers
            .iter()
            .filter(|header| header.get_key_ref().eq_ignore_ascii_case("Received"))
            .count(),
        // Malformed headers still have to be counted
        Err(_) => headers
            .split(|&b| b == b'\n')
            .filter(|line| {
                line.get(..9)
                    .is_some_and(|name| name.eq_ignore_ascii_case(b"received:"))
            })
            .count(),
    }
}

#[async_trait]
impl Stage<MessageContext, MessageVerdict> for StopLoop {
    fn name(&self) -> &'static str {
        "stop-loop"
    }

    async fn evaluate(&self, context: &mut MessageContext) -> Step<MessageVerdict> {
        let hops = received_headers(context.mail.headers());

        if hops > self.max_received_headers {
            internal!(level = INFO, mail = %context.mail.id, hops, "Routing loop detected");
            Step::Decide(Verdict::Reject(Reply::new(
                554,
                "5.4.6",
                "Routing loop detected",
            )))
        } else {
            Step::Continue
        }
    }
}
