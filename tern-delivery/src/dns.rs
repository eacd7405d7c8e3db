//! Mail server resolution.
//!
//! MX lookups with the implicit-MX A/AAAA fallback of RFC 5321 section 5.1,
//! cached per domain for the record TTL bounded by the configured limits.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{TokioResolver, config::ResolverOpts, name_server::TokioConnectionProvider};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Port used for MX hosts and for relay hosts given without one.
pub const SMTP_PORT: u16 = 25;

#[derive(Debug, Error)]
pub enum DnsError {
    /// No MX, A, or AAAA records found for the domain.
    #[error("No mail servers found for domain: {0}")]
    NoMailServers(String),

    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),

    /// NXDOMAIN
    #[error("Domain does not exist: {0}")]
    DomainNotFound(String),

    #[error("DNS query timed out for domain: {0}")]
    Timeout(String),
}

impl DnsError {
    /// Failures that say nothing about whether the domain accepts mail.
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::LookupFailed(_))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "defaults::timeout_secs")]
    pub timeout_secs: u64,

    /// Overrides the record TTL for every cached entry when set.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    #[serde(default = "defaults::min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    #[serde(default = "defaults::max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

mod defaults {
    pub const fn timeout_secs() -> u64 {
        5
    }

    pub const fn min_cache_ttl_secs() -> u64 {
        60
    }

    pub const fn max_cache_ttl_secs() -> u64 {
        3600
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: defaults::min_cache_ttl_secs(),
            max_cache_ttl_secs: defaults::max_cache_ttl_secs(),
        }
    }
}

/// A host that accepts mail for a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    pub host: String,
    /// MX preference, lower first. 0 for the A/AAAA fallback.
    pub priority: u16,
    pub port: u16,
}

impl MailServer {
    #[must_use]
    pub const fn new(host: String, priority: u16, port: u16) -> Self {
        Self {
            host,
            priority,
            port,
        }
    }

    /// A relay host written as `host` or `host:port`.
    #[must_use]
    pub fn relay(target: &str) -> Self {
        let (host, port) = match target.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') || host.starts_with('[') => port
                .parse()
                .map_or((target, SMTP_PORT), |port| (host, port)),
            _ => (target, SMTP_PORT),
        };

        Self::new(
            host.trim_start_matches('[').trim_end_matches(']').to_string(),
            0,
            port,
        )
    }

    /// `host:port`, bracketing IPv6 literals.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Looks up the mail servers for a domain, best first.
#[async_trait]
pub trait MxResolver: Send + Sync + std::fmt::Debug {
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError>;
}

#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

/// Resolver backed by the system DNS configuration.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<String, CachedResult>,
    config: DnsConfig,
}

impl DnsResolver {
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config,
        })
    }

    async fn resolve_uncached(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(mx_lookup) => {
                let min_ttl = mx_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(300);

                let mut servers: Vec<MailServer> = mx_lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        MailServer::new(
                            host.trim_end_matches('.').to_string(),
                            mx.preference(),
                            SMTP_PORT,
                        )
                    })
                    .collect();

                if servers.is_empty() {
                    return self.fallback_to_a_aaaa(domain).await;
                }

                servers.sort_by_key(|server| server.priority);
                Ok((servers, min_ttl))
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                debug!("No MX records found for {domain}, falling back to A/AAAA");
                self.fallback_to_a_aaaa(domain).await
            }
            Err(err) => {
                warn!("MX lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }

    async fn fallback_to_a_aaaa(&self, domain: &str) -> Result<(Vec<MailServer>, u32), DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(ip_lookup) => {
                #[allow(clippy::redundant_closure_for_method_calls)]
                let min_ttl = ip_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(|r| r.ttl())
                    .min()
                    .unwrap_or(300);

                let servers: Vec<MailServer> = ip_lookup
                    .iter()
                    .map(|ip| MailServer::new(ip.to_string(), 0, SMTP_PORT))
                    .collect();

                if servers.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Ok((servers, min_ttl))
                }
            }
            Err(err) if err.is_nx_domain() => Err(DnsError::DomainNotFound(domain.to_string())),
            Err(err) if err.is_no_records_found() => {
                Err(DnsError::NoMailServers(domain.to_string()))
            }
            Err(err) => {
                warn!("A/AAAA lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }
}

#[async_trait]
impl MxResolver for DnsResolver {
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        let key = domain.to_ascii_lowercase();

        if let Some(cached) = self.cache.get(&key)
            && cached.expires_at > Instant::now()
        {
            debug!("Cache hit for {domain}, {} server(s)", cached.servers.len());
            return Ok(Arc::clone(&cached.servers));
        }

        let timeout = Duration::from_secs(self.config.timeout_secs.saturating_mul(2));
        let (servers, dns_ttl) = tokio::time::timeout(timeout, self.resolve_uncached(&key))
            .await
            .map_err(|_| DnsError::Timeout(domain.to_string()))??;
        let servers = Arc::new(servers);

        let cache_ttl = self.config.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(dns_ttl).clamp(
                self.config.min_cache_ttl_secs,
                self.config.max_cache_ttl_secs,
            )
        });

        self.cache.insert(
            key,
            CachedResult {
                servers: Arc::clone(&servers),
                expires_at: Instant::now() + Duration::from_secs(cache_ttl),
            },
        );

        debug!(
            "Resolved {} server(s) for {domain}, cached for {cache_ttl}s",
            servers.len()
        );
        Ok(servers)
    }
}

/// Fixed domain to server mapping, for tests and closed deployments.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    domains: AHashMap<String, Arc<Vec<MailServer>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, domain: &str, servers: Vec<MailServer>) -> Self {
        self.domains
            .insert(domain.to_ascii_lowercase(), Arc::new(servers));
        self
    }
}

#[async_trait]
impl MxResolver for StaticResolver {
    async fn resolve(&self, domain: &str) -> Result<Arc<Vec<MailServer>>, DnsError> {
        self.domains
            .get(&domain.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| DnsError::DomainNotFound(domain.to_string()))
    }
}
