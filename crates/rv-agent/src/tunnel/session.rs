//! Control-channel transport
//!
//! A [`TunnelSession`] owns at most one live transport to the rendezvous
//! proxy. It reconnects on its own and only surfaces liveness changes and
//! inbound events to the agent.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use rv_core::config::{AgentConfig, BackoffConfig};
use rv_protocol::{Event, EventCodec};

use super::reconnect::ExponentialBackoff;

/// Capacity of the queue between the transport and the agent loop.
///
/// The driver awaits on this queue, so a slow agent stalls reads from the
/// control connection rather than growing memory.
const SESSION_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the outbound queue. `send` never waits on it; events that
/// do not fit are dropped.
const OUTBOUND_CHANNEL_CAPACITY: usize = 1024;

/// What the session reports to the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A transport became live
    Connected,
    /// The live transport is gone
    Disconnected,
    /// The transport failed; `Disconnected` follows
    TransportError(String),
    /// A named event from the proxy
    Event(Event),
}

/// Abstraction over the rendezvous transport
#[async_trait]
pub trait TunnelSession: Send {
    /// Start the transport. Idempotent; failures are logged and retried
    /// internally rather than returned.
    fn connect(&mut self);

    /// Best-effort send. Dropped when the transport is down.
    fn send(&self, event: Event);

    /// Next event for the agent, or `None` once the session has shut down
    async fn next_event(&mut self) -> Option<SessionEvent>;

    /// Current transport liveness
    fn is_connected(&self) -> bool;

    /// Stop the transport and any reconnect attempts
    fn shutdown(&mut self);
}

/// [`TunnelSession`] over a framed TCP connection
pub struct TcpTunnelSession {
    endpoint: String,
    connect_timeout: Duration,
    backoff: BackoffConfig,
    connected: Arc<AtomicBool>,
    outbound_tx: mpsc::Sender<Event>,
    /// Handed to the driver task on first connect
    pending: Option<(mpsc::Receiver<Event>, mpsc::Sender<SessionEvent>)>,
    events_rx: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl TcpTunnelSession {
    /// Create a session for `endpoint` (`host:port`)
    pub fn new(endpoint: impl Into<String>, connect_timeout: Duration, backoff: BackoffConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(SESSION_EVENT_CHANNEL_CAPACITY);

        Self {
            endpoint: endpoint.into(),
            connect_timeout,
            backoff,
            connected: Arc::new(AtomicBool::new(false)),
            outbound_tx,
            pending: Some((outbound_rx, events_tx)),
            events_rx,
            cancel: CancellationToken::new(),
            driver: None,
        }
    }

    /// Create a session for the control endpoint in the configuration
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config.control_endpoint.clone(),
            config.control_connect_timeout,
            config.backoff.clone(),
        )
    }
}

#[async_trait]
impl TunnelSession for TcpTunnelSession {
    fn connect(&mut self) {
        let Some((outbound_rx, events_tx)) = self.pending.take() else {
            return;
        };

        tracing::info!("Tunnel session connecting to {}", self.endpoint);
        let driver = Driver {
            endpoint: self.endpoint.clone(),
            connect_timeout: self.connect_timeout,
            backoff: ExponentialBackoff::from_config(&self.backoff),
            connected: Arc::clone(&self.connected),
            outbound_rx,
            events_tx,
            cancel: self.cancel.clone(),
        };
        self.driver = Some(tokio::spawn(driver.run()));
    }

    fn send(&self, event: Event) {
        if !self.connected.load(Ordering::SeqCst) {
            tracing::trace!("Dropping {} event while disconnected", event.name());
            return;
        }

        match self.outbound_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!("Outbound queue full, dropping {} event", event.name());
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!("Session stopped, dropping {} event", event.name());
            }
        }
    }

    async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events_rx.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for TcpTunnelSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// How one transport ended
enum TransportEnd {
    /// Peer closed the connection
    Closed,
    /// I/O or protocol failure
    Failed(String),
    /// Session shut down, or the agent stopped listening
    Stopped,
}

/// Background task owning the transport and its reconnect loop
struct Driver {
    endpoint: String,
    connect_timeout: Duration,
    backoff: ExponentialBackoff,
    connected: Arc<AtomicBool>,
    outbound_rx: mpsc::Receiver<Event>,
    events_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                attempt = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.endpoint)) => attempt,
            };

            match attempt {
                Ok(Ok(stream)) => {
                    self.backoff.reset();
                    let _ = stream.set_nodelay(true);
                    tracing::info!("Connected to rendezvous proxy at {}", self.endpoint);

                    if let TransportEnd::Stopped = self.serve(Framed::new(stream, EventCodec::new())).await {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!("Could not connect to proxy {}: {}", self.endpoint, e);
                }
                Err(_) => {
                    tracing::warn!(
                        "Connecting to proxy {} timed out after {:?}",
                        self.endpoint,
                        self.connect_timeout
                    );
                }
            }

            let delay = self.backoff.next_delay();
            tracing::debug!("Reconnecting to {} in {:?}", self.endpoint, delay);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.connected.store(false, Ordering::SeqCst);
        tracing::debug!("Tunnel session driver for {} stopped", self.endpoint);
    }

    /// Run one live transport from `Connected` to `Disconnected`
    async fn serve(&mut self, framed: Framed<TcpStream, EventCodec>) -> TransportEnd {
        self.discard_outbound();
        self.connected.store(true, Ordering::SeqCst);
        if self.events_tx.send(SessionEvent::Connected).await.is_err() {
            self.connected.store(false, Ordering::SeqCst);
            return TransportEnd::Stopped;
        }

        let end = self.pump(framed).await;

        self.connected.store(false, Ordering::SeqCst);
        // Anything still queued was meant for the transport that just died
        self.discard_outbound();

        match &end {
            TransportEnd::Failed(reason) => {
                tracing::warn!("Control channel to {} failed: {}", self.endpoint, reason);
                let _ = self
                    .events_tx
                    .send(SessionEvent::TransportError(reason.clone()))
                    .await;
            }
            TransportEnd::Closed => {
                tracing::info!("Control channel to {} closed by proxy", self.endpoint);
            }
            TransportEnd::Stopped => {}
        }

        if self.events_tx.send(SessionEvent::Disconnected).await.is_err() {
            return TransportEnd::Stopped;
        }
        end
    }

    async fn pump(&mut self, framed: Framed<TcpStream, EventCodec>) -> TransportEnd {
        let (mut sink, mut stream) = framed.split();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.close().await;
                    return TransportEnd::Stopped;
                }

                Some(event) = self.outbound_rx.recv() => {
                    tracing::trace!("Sending {} event", event.name());
                    if let Err(e) = sink.send(event).await {
                        return TransportEnd::Failed(e.to_string());
                    }
                }

                frame = stream.next() => {
                    match frame {
                        Some(Ok(event)) => {
                            tracing::trace!("Received {} event", event.name());
                            if self.events_tx.send(SessionEvent::Event(event)).await.is_err() {
                                return TransportEnd::Stopped;
                            }
                        }
                        Some(Err(e)) => return TransportEnd::Failed(e.to_string()),
                        None => return TransportEnd::Closed,
                    }
                }
            }
        }
    }

    fn discard_outbound(&mut self) {
        let mut dropped = 0usize;
        while self.outbound_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!("Discarded {} stale outbound events", dropped);
        }
    }
}
