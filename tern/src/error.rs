use thiserror::Error;

/// Why the MTA could not be assembled from its configuration.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Invalid configuration: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Delivery(#[from] tern_delivery::ConfigError),

    #[error(transparent)]
    Table(#[from] tern_filter::TableError),

    #[error("Unable to open the spool: {0}")]
    Spool(#[from] tern_spool::SpoolError),

    #[error("Unable to create the DNS resolver: {0}")]
    Dns(#[from] tern_delivery::DnsError),

    #[error("Unable to create the DNS blocklist resolver: {0}")]
    Blocklist(String),
}
