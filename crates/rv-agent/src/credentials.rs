//! File-based credential provider

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;

use rv_core::error::CredentialError;
use rv_core::traits::CredentialProvider;
use rv_core::Credentials;

/// Reads `<dir>/<hostname>/cert.pem` and `<dir>/<hostname>/key.pem`
#[derive(Debug, Clone)]
pub struct FileCredentialProvider {
    dir: PathBuf,
}

impl FileCredentialProvider {
    /// Create a provider rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn credentials(&self, hostname: &str) -> Result<Credentials, CredentialError> {
        let host_dir = self.dir.join(hostname);
        if !host_dir.is_dir() {
            return Err(CredentialError::Missing(hostname.to_string()));
        }

        let cert_pem = tokio::fs::read(host_dir.join("cert.pem")).await?;
        let key_pem = tokio::fs::read(host_dir.join("key.pem")).await?;
        tracing::debug!("Loaded credentials for {} from {:?}", hostname, host_dir);

        Ok(Credentials {
            cert_pem: Bytes::from(cert_pem),
            key_pem: Bytes::from(key_pem),
        })
    }
}
