//! Local-facing listener
//!
//! Resolves the control endpoint (from stored config or the directory
//! service), serves a static health page on the default port, and owns the
//! one [`TunnelAgent`] that bridges remote clients to the target service.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ConnectInfo;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use rv_core::config::{AgentConfig, ConfigStore};
use rv_core::traits::{CredentialProvider, DirectoryService};
use rv_core::Credentials;

use crate::agent::TunnelAgent;
use crate::bridge::TcpBridgeConnector;
use crate::tunnel::TcpTunnelSession;

/// How long `destroy` waits for background tasks
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Health page router
pub fn health_router() -> Router {
    Router::new().route("/index.html", get(health))
}

async fn health(ConnectInfo(peer): ConnectInfo<SocketAddr>) -> impl IntoResponse {
    tracing::debug!("Health check from {}", peer);
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        format!("host okay source ip {} port {}", peer.ip(), peer.port()),
    )
}

/// Owns the health listener and the tunnel agent
pub struct TunnelListener {
    config: AgentConfig,
    store: Arc<dyn ConfigStore>,
    directory: Arc<dyn DirectoryService>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    server_credentials: Option<Credentials>,
    ready_tx: watch::Sender<bool>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TunnelListener {
    /// Create a listener. Call [`prepare`](Self::prepare) before starting.
    pub fn new(
        config: AgentConfig,
        store: Arc<dyn ConfigStore>,
        directory: Arc<dyn DirectoryService>,
    ) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            config,
            store,
            directory,
            credentials: None,
            server_credentials: None,
            ready_tx,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            local_addr: None,
        }
    }

    /// Use `provider` to fetch server credentials in secure mode
    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    /// Current configuration
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Credentials fetched during `prepare`, if running in secure mode
    pub fn server_credentials(&self) -> Option<&Credentials> {
        self.server_credentials.as_ref()
    }

    /// Address the health listener is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Override the health port, persisting the change if it differs
    pub fn set_port(&mut self, port: u16) -> Result<()> {
        if port == self.config.default_port {
            return Ok(());
        }

        tracing::info!("Default port changed from {} to {}", self.config.default_port, port);
        self.config.default_port = port;
        self.store
            .save(&self.config)
            .context("Failed to persist port change")?;
        Ok(())
    }

    /// Whether endpoint (and credentials, in secure mode) are available
    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Resolves once the listener is ready
    pub async fn ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Resolve the control endpoint and credentials, then signal readiness
    pub async fn prepare(&mut self) -> Result<()> {
        if self.config.has_endpoint() {
            tracing::info!(
                "Using configured endpoint {} for {}",
                self.config.control_endpoint,
                self.config.proxy_hostname
            );
        } else {
            self.register().await?;
        }

        if self.config.secure {
            let provider = self
                .credentials
                .as_ref()
                .context("Secure mode requires a credential provider")?;
            let credentials = provider
                .credentials(&self.config.proxy_hostname)
                .await
                .with_context(|| {
                    format!("Failed to read credentials for {}", self.config.proxy_hostname)
                })?;
            self.server_credentials = Some(credentials);
        }

        self.ready_tx.send_replace(true);
        tracing::info!("Listener ready");
        Ok(())
    }

    /// Ask the directory service for an endpoint and persist it
    async fn register(&mut self) -> Result<()> {
        let directory = &self.config.directory;
        if directory.api_url.is_empty() {
            anyhow::bail!("No control endpoint configured and no directory api_url to register with");
        }

        let host = match directory.load_balancer_url.as_deref() {
            Some(url) => match self.directory.lookup_host(url).await {
                Ok(Some(host)) => Some(host),
                Ok(None) => {
                    tracing::warn!("Load balancer at {} returned no instance", url);
                    None
                }
                Err(e) => {
                    tracing::warn!("Load balancer lookup at {} failed: {}", url, e);
                    None
                }
            },
            None => None,
        };

        tracing::info!("Requesting endpoint from directory at {}", directory.api_url);
        let registration = self
            .directory
            .register_host(&directory.api_url, host.as_deref(), &directory.zone)
            .await
            .context("Directory registration failed")?;

        tracing::info!(
            "Assigned endpoint {} with hostname {}",
            registration.endpoint,
            registration.hostname
        );
        self.config.control_endpoint = registration.endpoint;
        self.config.proxy_hostname = registration.hostname;
        self.config.endpoint_uid = Some(registration.uid);

        self.store
            .save(&self.config)
            .context("Failed to persist registration")?;
        Ok(())
    }

    /// Wait for readiness, then bind the health listener and start the
    /// tunnel agent
    pub async fn start(&mut self) -> Result<SocketAddr> {
        self.ready().await;
        if self.local_addr.is_some() {
            anyhow::bail!("Listener already started");
        }

        let bind = format!("0.0.0.0:{}", self.config.default_port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("Failed to bind to {}", bind))?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Health listener on {}", local_addr);

        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            let app = health_router().into_make_service_with_connect_info::<SocketAddr>();
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!("Health listener failed: {}", e);
            }
        }));

        tracing::info!(
            "Bridging {} to {}",
            self.config.proxy_hostname,
            self.config.target_address()
        );
        let agent = TunnelAgent::new(
            self.config.identity(),
            TcpTunnelSession::from_config(&self.config),
            TcpBridgeConnector::from_config(&self.config),
        );
        self.tasks
            .push(tokio::spawn(agent.run(self.shutdown.child_token())));

        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Stop the agent and the health listener
    pub async fn destroy(&mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::debug!("Background task did not stop in time");
            }
        }
        self.local_addr = None;
        tracing::info!("Listener destroyed");
    }
}
