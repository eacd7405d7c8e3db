//! DNS blocklist lookups.

use std::{
    fmt::Write,
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use async_trait::async_trait;
use hickory_resolver::{
    TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider,
};
use tern_common::internal;
use tern_tracing::traced;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsblResult {
    Listed { zone: String, reason: Option<String> },
    NotListed,
    /// The lookup could not be completed. Never treated as not listed.
    LookupFailed(String),
}

#[async_trait]
pub trait DnsblChecker: Send + Sync {
    async fn check(&self, ip: IpAddr) -> DnsblResult;
}

/// The query name for `ip` in `zone`: reversed octets for IPv4, reversed
/// nibbles for IPv6.
pub fn query_name(ip: IpAddr, zone: &str) -> String {
    let mut name = String::new();

    match ip {
        IpAddr::V4(ip) => {
            for octet in ip.octets().iter().rev() {
                let _ = write!(name, "{octet}.");
            }
        }
        IpAddr::V6(ip) => {
            for byte in ip.octets().iter().rev() {
                let _ = write!(name, "{:x}.{:x}.", byte & 0x0f, byte >> 4);
            }
        }
    }

    name.push_str(zone.trim_end_matches('.'));
    name.push('.');
    name
}

/// Blocklist responses are in 127.0.0.0/8; anything else is a resolver artefact.
const fn is_listing(address: Ipv4Addr) -> bool {
    address.octets()[0] == 127
}

/// Checks an address against each zone in turn, stopping at the first listing.
pub struct DnsBlocklist {
    resolver: TokioResolver,
    zones: Vec<String>,
}

impl DnsBlocklist {
    pub fn new(zones: Vec<String>, timeout: Duration) -> Result<Self, hickory_resolver::ResolveError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = timeout;

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self { resolver, zones })
    }

    #[traced(instrument(level = tracing::Level::DEBUG, skip(self)), timing(precision = "ms"))]
    async fn check_zone(&self, ip: IpAddr, zone: &str) -> DnsblResult {
        let name = query_name(ip, zone);

        match self.resolver.ipv4_lookup(name.as_str()).await {
            Ok(lookup) if lookup.iter().any(|a| is_listing(a.0)) => {
                let reason = self
                    .resolver
                    .txt_lookup(name.as_str())
                    .await
                    .ok()
                    .and_then(|txt| txt.iter().next().map(ToString::to_string));

                DnsblResult::Listed {
                    zone: zone.to_string(),
                    reason,
                }
            }
            Ok(_) => DnsblResult::NotListed,
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => DnsblResult::NotListed,
            Err(err) => DnsblResult::LookupFailed(err.to_string()),
        }
    }
}

#[async_trait]
impl DnsblChecker for DnsBlocklist {
    async fn check(&self, ip: IpAddr) -> DnsblResult {
        for zone in &self.zones {
            let result = self.check_zone(ip, zone).await;
            internal!(level = DEBUG, %ip, zone = %zone, ?result, "DNSBL checked");

            if !matches!(result, DnsblResult::NotListed) {
                return result;
            }
        }

        DnsblResult::NotListed
    }
}
