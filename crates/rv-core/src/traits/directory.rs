//! Directory service trait

use async_trait::async_trait;

use crate::error::DirectoryError;
use crate::types::Registration;

/// Endpoint selection and host registration against a provisioning service
#[async_trait]
pub trait DirectoryService: Send + Sync {
    /// Ask a load balancer for a preferred host.
    ///
    /// Returns `Ok(None)` when the balancer has no suggestion.
    async fn lookup_host(&self, load_balancer_url: &str) -> Result<Option<String>, DirectoryError>;

    /// Register this host and obtain its control endpoint and public hostname
    async fn register_host(
        &self,
        api_url: &str,
        host: Option<&str>,
        zone: &str,
    ) -> Result<Registration, DirectoryError>;
}
