//! Recipient tables: address to destination resolution.
//!
//! A table is an ordered list of mappers. The first mapper that claims an
//! address decides its destination; later mappers are never consulted.
//! All matching is case-insensitive on both the local part and the domain.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use regex::Regex;
use tern_common::{Address, Destination, Domain};
use thiserror::Error;

use crate::pipeline::{Pipeline, Stage, Step};

#[derive(Debug, Error)]
pub enum TableError {
    #[error("Invalid recipient pattern {pattern}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Clone, Debug, Default)]
pub struct RecipientTable {
    mappers: Pipeline<Address, Destination>,
}

impl RecipientTable {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, mapper: impl Stage<Address, Destination> + 'static) -> Self {
        self.mappers.push(Arc::new(mapper));
        self
    }

    pub fn push(&mut self, mapper: Arc<dyn Stage<Address, Destination>>) {
        self.mappers.push(mapper);
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }

    /// Destination of the first mapper claiming `address`.
    pub async fn resolve(&self, address: &Address) -> Option<Destination> {
        let mut address = address.clone();
        self.mappers.run(&mut address).await
    }
}

/// Individually registered addresses.
#[derive(Debug, Default)]
pub struct ExactMapper {
    entries: HashMap<Address, Destination>,
}

impl ExactMapper {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, address: Address, destination: Destination) -> Self {
        self.entries.insert(address, destination);
        self
    }
}

#[async_trait]
impl Stage<Address, Destination> for ExactMapper {
    fn name(&self) -> &'static str {
        "exact"
    }

    async fn evaluate(&self, address: &mut Address) -> Step<Destination> {
        self.entries
            .get(address)
            .cloned()
            .map_or(Step::Continue, Step::Decide)
    }
}

/// Alternative names resolving to a canonical address.
#[derive(Debug, Default)]
pub struct AliasMapper {
    aliases: HashMap<Address, Address>,
}

impl AliasMapper {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, alias: Address, canonical: Address) -> Self {
        self.aliases.insert(alias, canonical);
        self
    }
}

#[async_trait]
impl Stage<Address, Destination> for AliasMapper {
    fn name(&self) -> &'static str {
        "alias"
    }

    async fn evaluate(&self, address: &mut Address) -> Step<Destination> {
        self.aliases
            .get(address)
            .map_or(Step::Continue, |canonical| {
                Step::Decide(Destination::AliasTo {
                    canonical: canonical.clone(),
                })
            })
    }
}

/// Every local part at the listed domains.
#[derive(Debug)]
pub struct DomainMapper {
    domains: Vec<Domain>,
    destination: Destination,
}

impl DomainMapper {
    pub const fn new(domains: Vec<Domain>, destination: Destination) -> Self {
        Self {
            domains,
            destination,
        }
    }
}

#[async_trait]
impl Stage<Address, Destination> for DomainMapper {
    fn name(&self) -> &'static str {
        "domain"
    }

    async fn evaluate(&self, address: &mut Address) -> Step<Destination> {
        match address.domain() {
            Some(domain) if self.domains.contains(domain) => Step::Decide(self.destination.clone()),
            _ => Step::Continue,
        }
    }
}

/// The global postmaster, and `postmaster@` each listed domain.
#[derive(Debug)]
pub struct PostmasterMapper {
    domains: Vec<Domain>,
    destination: Destination,
}

impl PostmasterMapper {
    pub const fn new(domains: Vec<Domain>, destination: Destination) -> Self {
        Self {
            domains,
            destination,
        }
    }
}

#[async_trait]
impl Stage<Address, Destination> for PostmasterMapper {
    fn name(&self) -> &'static str {
        "postmaster"
    }

    async fn evaluate(&self, address: &mut Address) -> Step<Destination> {
        let claimed = address.is_global_postmaster()
            || (address.is_domain_postmaster()
                && address
                    .domain()
                    .is_some_and(|domain| self.domains.contains(domain)));

        if claimed {
            Step::Decide(self.destination.clone())
        } else {
            Step::Continue
        }
    }
}

/// Addresses whose whole `local@domain` form matches a regular expression.
#[derive(Debug)]
pub struct PatternMapper {
    pattern: Regex,
    destination: Destination,
}

impl PatternMapper {
    /// The pattern must match the entire address and ignores case.
    pub fn new(pattern: &str, destination: Destination) -> Result<Self, TableError> {
        let anchored = format!("(?i)^(?:{pattern})$");
        let pattern = Regex::new(&anchored).map_err(|source| TableError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;

        Ok(Self {
            pattern,
            destination,
        })
    }
}

#[async_trait]
impl Stage<Address, Destination> for PatternMapper {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn evaluate(&self, address: &mut Address) -> Step<Destination> {
        if self.pattern.is_match(&address.to_string()) {
            Step::Decide(self.destination.clone())
        } else {
            Step::Continue
        }
    }
}

/// SRS addresses at the rewriting domain, whose original must be decoded.
#[derive(Debug)]
pub struct SrsMapper {
    domain: Domain,
}

impl SrsMapper {
    pub const fn new(domain: Domain) -> Self {
        Self { domain }
    }
}

#[async_trait]
impl Stage<Address, Destination> for SrsMapper {
    fn name(&self) -> &'static str {
        "srs"
    }

    async fn evaluate(&self, address: &mut Address) -> Step<Destination> {
        let local = address.local_part().as_bytes();
        let is_srs = local.len() > 4
            && (local[..4].eq_ignore_ascii_case(b"SRS0") || local[..4].eq_ignore_ascii_case(b"SRS1"))
            && matches!(local[4], b'=' | b'+' | b'-');

        if is_srs && address.domain() == Some(&self.domain) {
            Step::Decide(Destination::SrsRewrite)
        } else {
            Step::Continue
        }
    }
}

/// Delegates to a nested table.
#[derive(Debug)]
pub struct TableMapper {
    table: Arc<RecipientTable>,
}

impl TableMapper {
    pub const fn new(table: Arc<RecipientTable>) -> Self {
        Self { table }
    }
}

#[async_trait]
impl Stage<Address, Destination> for TableMapper {
    fn name(&self) -> &'static str {
        "table"
    }

    async fn evaluate(&self, address: &mut Address) -> Step<Destination> {
        self.table
            .resolve(address)
            .await
            .map_or(Step::Continue, Step::Decide)
    }
}
