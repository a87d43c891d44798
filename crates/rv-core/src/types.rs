//! Core domain types

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a virtual connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Local connect in progress
    Connecting,
    /// Local socket is connected
    Open,
    /// Teardown started
    Closing,
    /// Gone; never stored in the connection table
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closing => write!(f, "closing"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Result of registering this host with the directory service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Control-channel endpoint of the assigned rendezvous proxy
    pub endpoint: String,
    /// Public hostname routed to this agent
    pub hostname: String,
    /// Directory-assigned identifier
    pub uid: String,
}

/// TLS server credentials, opaque to the tunnel core
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// PEM certificate chain
    pub cert_pem: Bytes,
    /// PEM private key
    pub key_pem: Bytes,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}
