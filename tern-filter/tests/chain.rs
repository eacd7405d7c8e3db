#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tern_common::{Address, Destination, Domain, Mail, Reply, ReversePath};
use tern_filter::{
    DnsblChecker, DnsblResult, FilterChain, MessageVerdict, RecipientContext, RecipientTable,
    RecipientVerdict, SessionInfo, SpfChecker, SpfResult, Stage, Step, Verdict,
    filters::{
        AcceptAllRecipient, AcceptDomainPostmaster, AcceptGlobalPostmaster, LookupDestination,
        ProhibitRelaying, RefuseBlacklistedRecipient, RefuseUnknownRecipient, RejectLargeMail,
        RejectOnFailedSpf, StopLoop,
    },
    table::{DomainMapper, ExactMapper, PostmasterMapper},
};

fn address(s: &str) -> Address {
    s.parse().expect("valid address")
}

fn session() -> Arc<SessionInfo> {
    Arc::new(
        SessionInfo::new("198.51.100.7".parse().unwrap())
            .with_helo("client.example.net")
            .with_reverse_path(ReversePath::Mailbox(address("sender@example.net"))),
    )
}

fn maildrop(name: &str) -> Destination {
    Destination::Store {
        maildrop: name.to_string(),
    }
}

fn table() -> Arc<RecipientTable> {
    Arc::new(
        RecipientTable::new()
            .with(PostmasterMapper::new(
                vec![Domain::new("example.com")],
                maildrop("postmaster"),
            ))
            .with(ExactMapper::new().with(address("john@example.com"), maildrop("john"))),
    )
}

/// Counts how often it is reached.
struct Spy(Arc<AtomicUsize>);

#[async_trait]
impl Stage<RecipientContext, RecipientVerdict> for Spy {
    fn name(&self) -> &'static str {
        "spy"
    }

    async fn evaluate(&self, _context: &mut RecipientContext) -> Step<RecipientVerdict> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Step::Continue
    }
}

struct FixedDnsbl(DnsblResult);

#[async_trait]
impl DnsblChecker for FixedDnsbl {
    async fn check(&self, _ip: IpAddr) -> DnsblResult {
        self.0.clone()
    }
}

struct FixedSpf(SpfResult);

#[async_trait]
impl SpfChecker for FixedSpf {
    async fn check(&self, _: IpAddr, _: Option<&str>, _: &ReversePath) -> SpfResult {
        self.0
    }
}

fn mx_chain(dnsbl: DnsblResult, spf: SpfResult) -> FilterChain {
    FilterChain::builder()
        .recipient_filter(LookupDestination::new(table()))
        .recipient_filter(AcceptGlobalPostmaster::new(maildrop("postmaster")))
        .recipient_filter(ProhibitRelaying::new(
            vec![Domain::new("example.com")],
            vec![],
        ))
        .recipient_filter(AcceptDomainPostmaster::new(
            vec![Domain::new("example.com")],
            maildrop("postmaster"),
        ))
        .recipient_filter(RefuseBlacklistedRecipient::new(Arc::new(FixedDnsbl(dnsbl))))
        .recipient_filter(RefuseUnknownRecipient::new(vec![Domain::new("example.com")]))
        .recipient_filter(RejectOnFailedSpf::new(Arc::new(FixedSpf(spf))))
        .recipient_filter(AcceptAllRecipient)
        .message_filter(RejectLargeMail::new(1024))
        .message_filter(StopLoop::default())
        .build()
}

#[tokio::test]
async fn known_recipient_is_accepted_with_its_destination() {
    let chain = mx_chain(DnsblResult::NotListed, SpfResult::Pass);

    let verdict = chain
        .evaluate_recipient(session(), address("John@example.com"))
        .await;

    assert_eq!(verdict, Verdict::Accept(maildrop("john")));
}

#[tokio::test]
async fn unknown_recipient_is_rejected() {
    let chain = mx_chain(DnsblResult::NotListed, SpfResult::Pass);

    let verdict = chain
        .evaluate_recipient(session(), address("unknown@example.com"))
        .await;

    assert_eq!(verdict, Verdict::Reject(Reply::unknown_recipient()));
}

#[tokio::test]
async fn relaying_is_prohibited_for_remote_domains() {
    let chain = mx_chain(DnsblResult::NotListed, SpfResult::Pass);

    let verdict = chain
        .evaluate_recipient(session(), address("someone@example.org"))
        .await;

    let reply = verdict.reply().expect("rejected");
    assert_eq!((reply.code, reply.status()), (550, String::from("5.7.1")));

    let authenticated = Arc::new(
        SessionInfo::new("198.51.100.7".parse().unwrap()).authenticated(),
    );
    let verdict = chain
        .evaluate_recipient(authenticated, address("someone@example.org"))
        .await;
    assert_eq!(verdict, Verdict::Accept(Destination::Transmit));
}

#[tokio::test]
async fn postmasters_bypass_blocklists() {
    let listed = DnsblResult::Listed {
        zone: String::from("bl.example"),
        reason: None,
    };
    let chain = mx_chain(listed, SpfResult::Fail);

    assert_eq!(
        chain
            .evaluate_recipient(session(), Address::global_postmaster())
            .await,
        Verdict::Accept(maildrop("postmaster"))
    );
    assert_eq!(
        chain
            .evaluate_recipient(session(), address("postmaster@example.com"))
            .await,
        Verdict::Accept(maildrop("postmaster"))
    );

    let verdict = chain
        .evaluate_recipient(session(), address("john@example.com"))
        .await;
    assert_eq!(verdict.reply().map(|reply| reply.code), Some(554));
}

#[tokio::test]
async fn lookup_failures_are_temporary() {
    let chain = mx_chain(
        DnsblResult::LookupFailed(String::from("timed out")),
        SpfResult::Pass,
    );
    let verdict = chain
        .evaluate_recipient(session(), address("john@example.com"))
        .await;
    assert!(matches!(verdict, Verdict::TemporaryFailure(ref reply) if reply.code == 451));

    let chain = mx_chain(DnsblResult::NotListed, SpfResult::TempError);
    let verdict = chain
        .evaluate_recipient(session(), address("john@example.com"))
        .await;
    assert!(matches!(verdict, Verdict::TemporaryFailure(ref reply) if reply.code == 451));
}

#[tokio::test]
async fn failed_spf_is_rejected() {
    let chain = mx_chain(DnsblResult::NotListed, SpfResult::Fail);
    let verdict = chain
        .evaluate_recipient(session(), address("john@example.com"))
        .await;

    assert!(matches!(verdict, Verdict::Reject(ref reply) if reply.code == 550));
}

#[tokio::test]
async fn broken_spf_record_is_rejected_only_when_asked() {
    let chain = |reject| {
        FilterChain::builder()
            .recipient_filter(LookupDestination::new(table()))
            .recipient_filter(
                RejectOnFailedSpf::new(Arc::new(FixedSpf(SpfResult::PermError)))
                    .reject_on_permanent_error(reject),
            )
            .build()
    };

    let verdict = chain(false)
        .evaluate_recipient(session(), address("john@example.com"))
        .await;
    assert!(matches!(verdict, Verdict::Accept(_)));

    let verdict = chain(true)
        .evaluate_recipient(session(), address("john@example.com"))
        .await;
    let Verdict::Reject(reply) = verdict else {
        panic!("expected a rejection, got {verdict:?}");
    };
    assert_eq!((reply.code, reply.status()), (550, String::from("5.7.1")));
    assert!(reply.text.contains("invalid SPF record"), "{reply}");
}

#[tokio::test]
async fn filters_after_a_decision_are_not_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let chain = FilterChain::builder()
        .recipient_filter(LookupDestination::new(table()))
        .recipient_filter(Spy(Arc::clone(&calls)))
        .recipient_filter(RefuseUnknownRecipient::new(vec![Domain::new("example.com")]))
        .recipient_filter(Spy(Arc::clone(&calls)))
        .build();

    let verdict = chain
        .evaluate_recipient(session(), address("nobody@example.com"))
        .await;

    assert_eq!(verdict, Verdict::Reject(Reply::unknown_recipient()));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn undecided_recipient_uses_the_attached_destination() {
    let table = Arc::new(RecipientTable::new().with(DomainMapper::new(
        vec![Domain::new("example.com")],
        Destination::Drop,
    )));
    let chain = FilterChain::builder()
        .recipient_filter(LookupDestination::new(table))
        .build();

    assert_eq!(
        chain
            .evaluate_recipient(session(), address("any@example.com"))
            .await,
        Verdict::Accept(Destination::Drop)
    );
    assert_eq!(
        chain
            .evaluate_recipient(session(), address("any@example.org"))
            .await,
        Verdict::Reject(Reply::unknown_recipient())
    );
}

#[tokio::test]
async fn message_filters() {
    let chain = mx_chain(DnsblResult::NotListed, SpfResult::Pass);
    let recipients = vec![address("john@example.com")];
    let sender = ReversePath::Mailbox(address("sender@example.net"));

    let small = Mail::new(
        sender.clone(),
        recipients.clone(),
        b"Subject: hi\r\n\r\nhello\r\n".to_vec(),
    );
    assert_eq!(
        chain.evaluate_message(session(), &small).await,
        MessageVerdict::Accept(())
    );

    let large = Mail::new(sender.clone(), recipients.clone(), vec![b'a'; 2048]);
    let verdict = chain.evaluate_message(session(), &large).await;
    assert_eq!(verdict.reply().map(|reply| reply.code), Some(552));

    let mut looping = "Received: from relay.example.net\r\n".repeat(101);
    looping.push_str("Subject: loop\r\n\r\nbody\r\n");
    let looping = Mail::new(sender, recipients, looping.into_bytes());
    let chain = FilterChain::builder()
        .message_filter(StopLoop::default())
        .build();
    let verdict = chain.evaluate_message(session(), &looping).await;
    assert_eq!(
        verdict,
        Verdict::Reject(Reply::new(554, "5.4.6", "Routing loop detected"))
    );
}
