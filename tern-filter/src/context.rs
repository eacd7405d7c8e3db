use std::{net::IpAddr, sync::Arc};

use tern_common::{Address, Destination, Mail, ReversePath};

/// What the session layer knows about the connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub remote_ip: IpAddr,
    pub helo: Option<String>,
    pub reverse_path: ReversePath,
    pub authenticated: bool,
}

impl SessionInfo {
    pub const fn new(remote_ip: IpAddr) -> Self {
        Self {
            remote_ip,
            helo: None,
            reverse_path: ReversePath::Null,
            authenticated: false,
        }
    }

    #[must_use]
    pub fn with_helo(mut self, helo: impl Into<String>) -> Self {
        self.helo = Some(helo.into());
        self
    }

    #[must_use]
    pub fn with_reverse_path(mut self, reverse_path: ReversePath) -> Self {
        self.reverse_path = reverse_path;
        self
    }

    #[must_use]
    pub const fn authenticated(mut self) -> Self {
        self.authenticated = true;
        self
    }
}

/// Context threaded through the recipient filters.
#[derive(Debug, Clone)]
pub struct RecipientContext {
    pub session: Arc<SessionInfo>,
    pub recipient: Address,
    /// Attached by the destination lookup, read by later filters.
    pub destination: Option<Destination>,
}

impl RecipientContext {
    pub const fn new(session: Arc<SessionInfo>, recipient: Address) -> Self {
        Self {
            session,
            recipient,
            destination: None,
        }
    }
}

/// Context threaded through the message filters.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub session: Arc<SessionInfo>,
    pub mail: Mail,
}
