//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::backoff::BackoffConfig;
use super::serde_utils::{duration_millis, duration_secs};

/// Configuration for the tunnel agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Public hostname assigned to this agent; announced in `register_server`
    pub proxy_hostname: String,

    /// Address (`host:port`) of the rendezvous proxy control channel
    pub control_endpoint: String,

    /// Directory-assigned identifier for this host
    pub endpoint_uid: Option<String>,

    /// Host of the local service that virtual connections are bridged to
    pub target_host: String,

    /// Port of the local service that virtual connections are bridged to
    pub target_port: u16,

    /// Port the local health listener binds to
    pub default_port: u16,

    /// Connect timeout for each local bridge
    #[serde(with = "duration_millis")]
    pub bridge_connect_timeout: Duration,

    /// Connect timeout for the control channel
    #[serde(with = "duration_secs")]
    pub control_connect_timeout: Duration,

    /// Fetch TLS credentials before reporting ready
    pub secure: bool,

    /// Directory holding `<hostname>/cert.pem` and `<hostname>/key.pem`
    pub credentials_dir: PathBuf,

    /// Backoff configuration for control-channel reconnects
    pub backoff: BackoffConfig,

    /// Directory service settings, used when no endpoint is configured
    pub directory: DirectoryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            proxy_hostname: String::new(),
            control_endpoint: String::new(),
            endpoint_uid: None,
            target_host: "localhost".to_string(),
            target_port: 8080,
            default_port: 8080,
            bridge_connect_timeout: Duration::from_millis(5000),
            control_connect_timeout: Duration::from_secs(30),
            secure: false,
            credentials_dir: super::default_config_dir().join("certs"),
            backoff: BackoffConfig::default(),
            directory: DirectoryConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Whether an endpoint and hostname are already known
    pub fn has_endpoint(&self) -> bool {
        !self.control_endpoint.is_empty() && !self.proxy_hostname.is_empty()
    }

    /// Identity announced to the proxy, falling back to the machine hostname
    pub fn identity(&self) -> String {
        if self.proxy_hostname.is_empty() {
            gethostname::gethostname().to_string_lossy().into_owned()
        } else {
            self.proxy_hostname.clone()
        }
    }

    /// `host:port` of the local target service
    pub fn target_address(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }
}

/// Directory service settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Base URL of the provisioning API
    pub api_url: String,

    /// Optional load-balancer URL that suggests a preferred host
    pub load_balancer_url: Option<String>,

    /// Availability zone reported on registration
    pub zone: String,
}
