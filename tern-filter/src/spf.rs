use std::net::IpAddr;

use async_trait::async_trait;
use tern_common::ReversePath;

/// Outcome of an SPF evaluation, as named by RFC 7208.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpfResult {
    None,
    Neutral,
    Pass,
    Fail,
    SoftFail,
    TempError,
    PermError,
}

/// Sender Policy Framework evaluation, supplied by the embedding application.
#[async_trait]
pub trait SpfChecker: Send + Sync {
    async fn check(&self, ip: IpAddr, helo: Option<&str>, reverse_path: &ReversePath) -> SpfResult;
}
