//! Assembles the filter chain, recipient table, destinations and delivery
//! queues into a running MTA.

pub mod config;
pub mod controller;
pub mod error;
pub mod mta;

pub use config::Config;
pub use error::BuildError;
pub use mta::{Mta, MtaBuilder};
