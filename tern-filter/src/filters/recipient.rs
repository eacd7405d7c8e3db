use std::{net::IpAddr, sync::Arc};

use async_trait::async_trait;
use tern_common::{Destination, Domain, Reply, internal};

use crate::{
    context::RecipientContext,
    dnsbl::{DnsblChecker, DnsblResult},
    pipeline::{Stage, Step},
    spf::{SpfChecker, SpfResult},
    table::RecipientTable,
    verdict::{RecipientVerdict, Verdict},
};

type RecipientStep = Step<RecipientVerdict>;

/// Attaches the recipient table's destination to the context.
pub struct LookupDestination {
    table: Arc<RecipientTable>,
}

impl LookupDestination {
    pub const fn new(table: Arc<RecipientTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Stage<RecipientContext, RecipientVerdict> for LookupDestination {
    fn name(&self) -> &'static str {
        "lookup-destination"
    }

    async fn evaluate(&self, context: &mut RecipientContext) -> RecipientStep {
        context.destination = self.table.resolve(&context.recipient).await;
        internal!(
            recipient = %context.recipient,
            destination = ?context.destination,
            "Looked up destination"
        );

        Step::Continue
    }
}

/// Mail to the domainless `postmaster` is always accepted (RFC 5321 4.5.1).
pub struct AcceptGlobalPostmaster {
    fallback: Destination,
}

impl AcceptGlobalPostmaster {
    pub const fn new(fallback: Destination) -> Self {
        Self { fallback }
    }
}

#[async_trait]
impl Stage<RecipientContext, RecipientVerdict> for AcceptGlobalPostmaster {
    fn name(&self) -> &'static str {
        "accept-global-postmaster"
    }

    async fn evaluate(&self, context: &mut RecipientContext) -> RecipientStep {
        if context.recipient.is_global_postmaster() {
            let destination = context
                .destination
                .clone()
                .unwrap_or_else(|| self.fallback.clone());
            Step::Decide(Verdict::Accept(destination))
        } else {
            Step::Continue
        }
    }
}

/// Refuses recipients outside the local domains, unless the client may relay.
pub struct ProhibitRelaying {
    local_domains: Vec<Domain>,
    relay_clients: Vec<IpAddr>,
}

impl ProhibitRelaying {
    pub const fn new(local_domains: Vec<Domain>, relay_clients: Vec<IpAddr>) -> Self {
        Self {
            local_domains,
            relay_clients,
        }
    }

    fn is_local(&self, domain: &Domain) -> bool {
        self.local_domains.iter().any(|local| domain.is_within(local))
    }
}

#[async_trait]
impl Stage<RecipientContext, RecipientVerdict> for ProhibitRelaying {
    fn name(&self) -> &'static str {
        "prohibit-relaying"
    }

    async fn evaluate(&self, context: &mut RecipientContext) -> RecipientStep {
        let session = &context.session;
        if session.authenticated || self.relay_clients.contains(&session.remote_ip) {
            return Step::Continue;
        }

        match context.recipient.domain() {
            None => Step::Continue,
            Some(domain) if self.is_local(domain) => Step::Continue,
            Some(_) => Step::Decide(Verdict::Reject(Reply::new(
                550,
                "5.7.1",
                format!(
                    "Relaying prohibited, user is not local ({})",
                    context.recipient
                ),
            ))),
        }
    }
}

/// `postmaster@` a local domain is always accepted (RFC 5321 4.5.1).
pub struct AcceptDomainPostmaster {
    domains: Vec<Domain>,
    fallback: Destination,
}

impl AcceptDomainPostmaster {
    /// With no domains listed, `postmaster@` any domain reaching this filter is accepted.
    pub const fn new(domains: Vec<Domain>, fallback: Destination) -> Self {
        Self { domains, fallback }
    }
}

#[async_trait]
impl Stage<RecipientContext, RecipientVerdict> for AcceptDomainPostmaster {
    fn name(&self) -> &'static str {
        "accept-domain-postmaster"
    }

    async fn evaluate(&self, context: &mut RecipientContext) -> RecipientStep {
        let recipient = &context.recipient;
        let listed = recipient
            .domain()
            .is_some_and(|domain| self.domains.is_empty() || self.domains.contains(domain));

        if recipient.is_domain_postmaster() && listed {
            let destination = context
                .destination
                .clone()
                .unwrap_or_else(|| self.fallback.clone());
            Step::Decide(Verdict::Accept(destination))
        } else {
            Step::Continue
        }
    }
}

/// Refuses every recipient when the client address is on a DNS blocklist.
pub struct RefuseBlacklistedRecipient {
    checker: Arc<dyn DnsblChecker>,
}

impl RefuseBlacklistedRecipient {
    pub fn new(checker: Arc<dyn DnsblChecker>) -> Self {
        Self { checker }
    }
}

#[async_trait]
impl Stage<RecipientContext, RecipientVerdict> for RefuseBlacklistedRecipient {
    fn name(&self) -> &'static str {
        "refuse-blacklisted-recipient"
    }

    async fn evaluate(&self, context: &mut RecipientContext) -> RecipientStep {
        let ip = context.session.remote_ip;

        match self.checker.check(ip).await {
            DnsblResult::NotListed => Step::Continue,
            DnsblResult::Listed { zone, reason } => {
                internal!(level = INFO, %ip, zone = %zone, "Client is listed");
                let text = reason.map_or_else(
                    || {
                        format!(
                            "Rejected: unauthenticated e-mail from {ip} is restricted. \
                             Contact the postmaster for details."
                        )
                    },
                    |reason| format!("Rejected: {ip} is listed by {zone}: {reason}"),
                );
                Step::Decide(Verdict::Reject(Reply::new(554, "5.7.1", text)))
            }
            DnsblResult::LookupFailed(err) => {
                internal!(level = WARN, %ip, error = %err, "DNSBL lookup failed");
                Step::Decide(Verdict::TemporaryFailure(Reply::new(
                    451,
                    "4.4.3",
                    "Temporary DNS failure, try again later",
                )))
            }
        }
    }
}

/// Refuses recipients at the local domains that the recipient table has no
/// destination for. Remote recipients are left to the relaying filter.
pub struct RefuseUnknownRecipient {
    local_domains: Vec<Domain>,
}

impl RefuseUnknownRecipient {
    /// With no domains listed, every recipient must have a destination.
    pub const fn new(local_domains: Vec<Domain>) -> Self {
        Self { local_domains }
    }

    fn applies_to(&self, domain: Option<&Domain>) -> bool {
        self.local_domains.is_empty()
            || domain.is_some_and(|domain| {
                self.local_domains.iter().any(|local| domain.is_within(local))
            })
    }
}

#[async_trait]
impl Stage<RecipientContext, RecipientVerdict> for RefuseUnknownRecipient {
    fn name(&self) -> &'static str {
        "refuse-unknown-recipient"
    }

    async fn evaluate(&self, context: &mut RecipientContext) -> RecipientStep {
        if context.destination.is_some()
            || context.recipient.is_global_postmaster()
            || !self.applies_to(context.recipient.domain())
        {
            Step::Continue
        } else {
            Step::Decide(Verdict::Reject(Reply::unknown_recipient()))
        }
    }
}

/// Refuses mail whose sender fails SPF.
///
/// A broken SPF record of the sender's domain is let through unless
/// `reject_on_permanent_error` is set.
pub struct RejectOnFailedSpf {
    checker: Arc<dyn SpfChecker>,
    reject_on_permanent_error: bool,
}

impl RejectOnFailedSpf {
    pub fn new(checker: Arc<dyn SpfChecker>) -> Self {
        Self {
            checker,
            reject_on_permanent_error: false,
        }
    }

    #[must_use]
    pub const fn reject_on_permanent_error(mut self, reject: bool) -> Self {
        self.reject_on_permanent_error = reject;
        self
    }
}

#[async_trait]
impl Stage<RecipientContext, RecipientVerdict> for RejectOnFailedSpf {
    fn name(&self) -> &'static str {
        "reject-on-failed-spf"
    }

    async fn evaluate(&self, context: &mut RecipientContext) -> RecipientStep {
        let session = &context.session;
        let result = self
            .checker
            .check(
                session.remote_ip,
                session.helo.as_deref(),
                &session.reverse_path,
            )
            .await;

        match result {
            SpfResult::Fail => Step::Decide(Verdict::Reject(Reply::new(
                550,
                "5.7.1",
                format!(
                    "SPF check failed for {} from {}",
                    session.reverse_path, session.remote_ip
                ),
            ))),
            SpfResult::TempError => Step::Decide(Verdict::TemporaryFailure(Reply::new(
                451,
                "4.4.3",
                "Temporary SPF failure, try again later",
            ))),
            SpfResult::PermError if self.reject_on_permanent_error => {
                Step::Decide(Verdict::Reject(Reply::new(
                    550,
                    "5.7.1",
                    format!("Blocked, invalid SPF record for {}", session.reverse_path),
                )))
            }
            _ => Step::Continue,
        }
    }
}

/// Accepts whatever reaches it, with the attached destination or `Transmit`.
pub struct AcceptAllRecipient;

#[async_trait]
impl Stage<RecipientContext, RecipientVerdict> for AcceptAllRecipient {
    fn name(&self) -> &'static str {
        "accept-all-recipient"
    }

    async fn evaluate(&self, context: &mut RecipientContext) -> RecipientStep {
        Step::Decide(Verdict::Accept(
            context.destination.clone().unwrap_or(Destination::Transmit),
        ))
    }
}
