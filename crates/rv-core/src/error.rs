//! Core error types for the rendezvous agent

use rv_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type
#[derive(Error, Debug)]
pub enum RvError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Tunnel error
    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Directory service error
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    /// Credential provider error
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure kinds of the multiplexing core.
///
/// Only `TransportDisconnected` is agent-scoped; every other kind concerns a
/// single virtual connection and never outlives it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
    /// Control channel is down; all virtual connections are torn down
    #[error("Control channel disconnected")]
    TransportDisconnected,

    /// Local bridge could not reach the target service
    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    /// Local socket failed mid-stream
    #[error("Local socket error: {0}")]
    LocalSocketError(String),

    /// `create_connection` for an id that is already tracked
    #[error("Duplicate create for {0}")]
    DuplicateCreate(String),

    /// Event for an id that is no longer tracked
    #[error("Unknown socket {0}")]
    UnknownId(String),
}

impl TunnelError {
    /// Whether this failure is ignored rather than reported upstream
    pub fn is_silent(&self) -> bool {
        matches!(
            self,
            TunnelError::DuplicateCreate(_) | TunnelError::UnknownId(_)
        )
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Directory service errors
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// Request could not be sent or decoded
    #[error("Request failed: {0}")]
    Request(String),

    /// Service answered with a non-success status
    #[error("Unexpected status {0}")]
    Status(u16),

    /// Service answered without an endpoint
    #[error("Empty endpoint received from directory")]
    EmptyEndpoint,
}

/// Credential provider errors
#[derive(Error, Debug)]
pub enum CredentialError {
    /// No credentials exist for the hostname
    #[error("No credentials for {0}")]
    Missing(String),

    /// Credentials could not be read
    #[error("Failed to read credentials: {0}")]
    Io(#[from] std::io::Error),
}
