//! The RON configuration file.
//!
//! ```ron
//! (
//!     hostname: "mx.example.com",
//!     local_domains: ["example.com"],
//!     spool: (type: "File", path: "/var/spool/tern"),
//!     retry: (
//!         backoff: (type: "Schedule", periods: [180, 1620, 1800, 7200, 7200, 10800]),
//!         delay_report_points: [3],
//!     ),
//!     recipients: [
//!         (type: "Postmaster", domains: ["example.com"], destination: (type: "Store", maildrop: "postmaster")),
//!         (type: "Exact", entries: [("john@example.com", (type: "Store", maildrop: "john"))]),
//!     ],
//! )
//! ```

use std::{net::IpAddr, path::PathBuf, sync::Arc, time::Duration};

use serde::Deserialize;
use tern_common::{Address, Destination, Domain};
use tern_delivery::{
    DnsConfig, DsnConfig, QueueConfig, RetryPolicy, SrsConfig, TransmissionConfig,
};
use tern_filter::{
    DnsBlocklist, FilterChain, RecipientTable, SpfChecker,
    filters::{
        AcceptAllRecipient, AcceptDomainPostmaster, AcceptGlobalPostmaster, LookupDestination,
        ProhibitRelaying, RefuseBlacklistedRecipient, RefuseUnknownRecipient, RejectLargeMail,
        RejectOnFailedSpf, StopLoop,
    },
    table::{AliasMapper, DomainMapper, ExactMapper, PatternMapper, PostmasterMapper, SrsMapper, TableMapper},
};
use tern_spool::SpoolConfig;

use crate::error::BuildError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Name of this host, used in EHLO and as the Reporting-MTA unless
    /// overridden in `transmission` or `dsn`.
    pub hostname: String,

    /// Domains this MTA accepts mail for.
    #[serde(default)]
    pub local_domains: Vec<Domain>,

    /// Clients allowed to relay to any domain.
    #[serde(default)]
    pub relay_clients: Vec<IpAddr>,

    #[serde(default)]
    pub spool: SpoolConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    pub retry: RetryPolicy,

    #[serde(default)]
    pub dsn: Option<DsnConfig>,

    #[serde(default)]
    pub transmission: Option<TransmissionConfig>,

    #[serde(default)]
    pub dns: DnsConfig,

    #[serde(default)]
    pub srs: Option<SrsConfig>,

    #[serde(default)]
    pub maildrop: MaildropConfig,

    /// Recipient table mappers, consulted in order.
    #[serde(default)]
    pub recipients: Vec<MapperConfig>,

    #[serde(default)]
    pub filters: FilterConfig,
}

impl Config {
    /// Parse and validate a configuration file's contents.
    ///
    /// Optional sections may be written without `Some(..)`.
    pub fn from_ron(content: &str) -> Result<Self, BuildError> {
        let config: Self = ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        if self.hostname.is_empty() {
            return Err(BuildError::Invalid(String::from("hostname must not be empty")));
        }

        self.retry.validate()?;
        Ok(())
    }

    pub fn transmission(&self) -> TransmissionConfig {
        self.transmission
            .clone()
            .unwrap_or_else(|| TransmissionConfig::new(&self.hostname))
    }

    pub fn dsn(&self) -> DsnConfig {
        self.dsn
            .clone()
            .unwrap_or_else(|| DsnConfig::new(&self.hostname))
    }

    /// Build the recipient table from `recipients`.
    pub fn recipient_table(&self) -> Result<RecipientTable, BuildError> {
        build_table(&self.recipients, self.srs.as_ref())
    }

    /// Build the filter chain from `filters`, looking destinations up in `table`.
    pub fn filter_chain(
        &self,
        table: Arc<RecipientTable>,
        spf: Option<Arc<dyn SpfChecker>>,
    ) -> Result<FilterChain, BuildError> {
        let mut builder = FilterChain::builder();

        for filter in &self.filters.recipient {
            match filter {
                RecipientFilterConfig::LookupDestination => {
                    builder.push_recipient_filter(Arc::new(LookupDestination::new(Arc::clone(&table))));
                }
                RecipientFilterConfig::AcceptGlobalPostmaster { destination } => {
                    builder.push_recipient_filter(Arc::new(AcceptGlobalPostmaster::new(destination.clone())));
                }
                RecipientFilterConfig::ProhibitRelaying => {
                    builder.push_recipient_filter(Arc::new(ProhibitRelaying::new(
                        self.local_domains.clone(),
                        self.relay_clients.clone(),
                    )));
                }
                RecipientFilterConfig::AcceptDomainPostmaster { destination } => {
                    builder.push_recipient_filter(Arc::new(AcceptDomainPostmaster::new(
                        self.local_domains.clone(),
                        destination.clone(),
                    )));
                }
                RecipientFilterConfig::RefuseBlacklistedRecipient {
                    zones,
                    timeout_secs,
                } => {
                    let blocklist = DnsBlocklist::new(zones.clone(), Duration::from_secs(*timeout_secs))
                        .map_err(|e| BuildError::Blocklist(e.to_string()))?;
                    builder.push_recipient_filter(Arc::new(RefuseBlacklistedRecipient::new(Arc::new(blocklist))));
                }
                RecipientFilterConfig::RefuseUnknownRecipient => {
                    builder.push_recipient_filter(Arc::new(RefuseUnknownRecipient::new(
                        self.local_domains.clone(),
                    )));
                }
                RecipientFilterConfig::RejectOnFailedSpf {
                    reject_on_permanent_error,
                } => {
                    let checker = spf.clone().ok_or_else(|| {
                        BuildError::Invalid(String::from(
                            "RejectOnFailedSpf needs an SPF checker",
                        ))
                    })?;
                    builder.push_recipient_filter(Arc::new(
                        RejectOnFailedSpf::new(checker)
                            .reject_on_permanent_error(*reject_on_permanent_error),
                    ));
                }
                RecipientFilterConfig::AcceptAllRecipient => {
                    builder.push_recipient_filter(Arc::new(AcceptAllRecipient));
                }
            }
        }

        for filter in &self.filters.message {
            match filter {
                MessageFilterConfig::RejectLargeMail { max_size } => {
                    builder.push_message_filter(Arc::new(RejectLargeMail::new(*max_size)));
                }
                MessageFilterConfig::StopLoop {
                    max_received_headers,
                } => {
                    builder.push_message_filter(Arc::new(StopLoop::new(*max_received_headers)));
                }
            }
        }

        Ok(builder.build())
    }
}

fn build_table(mappers: &[MapperConfig], srs: Option<&SrsConfig>) -> Result<RecipientTable, BuildError> {
    let mut table = RecipientTable::new();

    for mapper in mappers {
        table = match mapper {
            MapperConfig::Exact { entries } => table.with(
                entries
                    .iter()
                    .cloned()
                    .fold(ExactMapper::new(), |mapper, (address, destination)| {
                        mapper.with(address, destination)
                    }),
            ),
            MapperConfig::Alias { aliases } => table.with(
                aliases
                    .iter()
                    .cloned()
                    .fold(AliasMapper::new(), |mapper, (alias, canonical)| {
                        mapper.with(alias, canonical)
                    }),
            ),
            MapperConfig::Domain {
                domains,
                destination,
            } => table.with(DomainMapper::new(domains.clone(), destination.clone())),
            MapperConfig::Postmaster {
                domains,
                destination,
            } => table.with(PostmasterMapper::new(domains.clone(), destination.clone())),
            MapperConfig::Pattern {
                pattern,
                destination,
            } => table.with(PatternMapper::new(pattern, destination.clone())?),
            MapperConfig::Srs => {
                let srs = srs.ok_or_else(|| {
                    BuildError::Invalid(String::from("the Srs mapper needs an srs section"))
                })?;
                table.with(SrsMapper::new(Domain::new(&srs.domain)))
            }
            MapperConfig::Table { mappers } => {
                table.with(TableMapper::new(Arc::new(build_table(mappers, srs)?)))
            }
        };
    }

    Ok(table)
}

/// One recipient table mapper.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum MapperConfig {
    /// Individual addresses.
    Exact { entries: Vec<(Address, Destination)> },
    /// Other names for existing recipients.
    Alias { aliases: Vec<(Address, Address)> },
    /// Every local part at the listed domains.
    Domain {
        domains: Vec<Domain>,
        destination: Destination,
    },
    /// `postmaster` and `postmaster@` each listed domain.
    Postmaster {
        domains: Vec<Domain>,
        destination: Destination,
    },
    /// Addresses matching a regular expression, case-insensitively.
    Pattern {
        pattern: String,
        destination: Destination,
    },
    /// SRS addresses at the SRS domain.
    Srs,
    /// A nested table.
    Table { mappers: Vec<MapperConfig> },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum MaildropConfig {
    /// One directory per maildrop under `path`.
    Directory { path: PathBuf },
    /// Kept in memory and lost on exit.
    Memory,
}

impl Default for MaildropConfig {
    fn default() -> Self {
        Self::Directory {
            path: PathBuf::from("/var/mail/tern"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "defaults::recipient_filters")]
    pub recipient: Vec<RecipientFilterConfig>,

    #[serde(default = "defaults::message_filters")]
    pub message: Vec<MessageFilterConfig>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            recipient: defaults::recipient_filters(),
            message: defaults::message_filters(),
        }
    }
}

/// Recipient filters, run in the order given.
///
/// Filters that need the local domains or relay clients take them from the
/// top level of the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum RecipientFilterConfig {
    LookupDestination,
    AcceptGlobalPostmaster { destination: Destination },
    ProhibitRelaying,
    AcceptDomainPostmaster { destination: Destination },
    RefuseBlacklistedRecipient {
        zones: Vec<String>,
        #[serde(default = "defaults::dnsbl_timeout_secs")]
        timeout_secs: u64,
    },
    RefuseUnknownRecipient,
    /// Needs an SPF checker supplied when building the [`crate::Mta`].
    RejectOnFailedSpf {
        #[serde(default)]
        reject_on_permanent_error: bool,
    },
    /// Accepts what is left, sending recipients without a destination to
    /// transmission. Belongs last, behind `ProhibitRelaying`.
    AcceptAllRecipient,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum MessageFilterConfig {
    RejectLargeMail {
        #[serde(default = "defaults::max_size")]
        max_size: usize,
    },
    StopLoop {
        #[serde(default = "defaults::max_received_headers")]
        max_received_headers: usize,
    },
}

mod defaults {
    use super::{MessageFilterConfig, RecipientFilterConfig};

    pub fn recipient_filters() -> Vec<RecipientFilterConfig> {
        vec![
            RecipientFilterConfig::LookupDestination,
            RecipientFilterConfig::ProhibitRelaying,
            RecipientFilterConfig::RefuseUnknownRecipient,
            RecipientFilterConfig::AcceptAllRecipient,
        ]
    }

    pub fn message_filters() -> Vec<MessageFilterConfig> {
        vec![
            MessageFilterConfig::RejectLargeMail {
                max_size: max_size(),
            },
            MessageFilterConfig::StopLoop {
                max_received_headers: max_received_headers(),
            },
        ]
    }

    pub const fn dnsbl_timeout_secs() -> u64 {
        5
    }

    pub const fn max_size() -> usize {
        25_000_000
    }

    pub const fn max_received_headers() -> usize {
        100
    }
}
