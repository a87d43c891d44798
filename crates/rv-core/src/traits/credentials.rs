//! Credential provider trait

use async_trait::async_trait;

use crate::error::CredentialError;
use crate::types::Credentials;

/// Supplies TLS server credentials for a hostname
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fetch credentials for `hostname`
    async fn credentials(&self, hostname: &str) -> Result<Credentials, CredentialError>;
}
