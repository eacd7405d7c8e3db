pub mod chain;
pub mod context;
pub mod dnsbl;
pub mod filters;
pub mod pipeline;
pub mod spf;
pub mod table;
pub mod verdict;

pub use chain::{FilterChain, FilterChainBuilder};
pub use context::{MessageContext, RecipientContext, SessionInfo};
pub use dnsbl::{DnsBlocklist, DnsblChecker, DnsblResult};
pub use pipeline::{Pipeline, Stage, Step};
pub use spf::{SpfChecker, SpfResult};
pub use table::{RecipientTable, TableError};
pub use verdict::{MessageVerdict, RecipientVerdict, Verdict};
