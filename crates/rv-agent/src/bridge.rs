//! Local bridges to the target service
//!
//! Each virtual connection is backed by one real TCP connection against the
//! configured target. A bridge runs as its own task and reports everything
//! that happens on the socket as a [`BridgeEvent`] on the agent's bridge
//! channel; it never touches the connection table itself.
//!
//! The two halves of the socket are pumped independently: a writer task
//! drains the write queue while the bridge task reads, so a target that
//! only reads after it has written can never stall the other direction.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use rv_core::config::AgentConfig;
use rv_core::TunnelError;
use rv_protocol::SocketId;

/// Read buffer size for local sockets
const BRIDGE_READ_BUFFER: usize = 16 * 1024;

/// Chunks a bridge may hold for a target that is not reading.
///
/// Overflowing it fails the connection instead of dropping bytes mid-stream.
pub const WRITE_QUEUE_CAPACITY: usize = 1024;

/// How long a closed bridge keeps flushing queued writes
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that happened on a local bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    /// Local connect completed
    Opened { socket_id: SocketId },
    /// Local connect failed or timed out; no further events follow
    OpenFailed {
        socket_id: SocketId,
        error: TunnelError,
    },
    /// Bytes sent by the local target
    Data { socket_id: SocketId, payload: Bytes },
    /// Local socket failed mid-stream; `Closed` follows
    Error {
        socket_id: SocketId,
        error: TunnelError,
    },
    /// Local target ended the connection
    Closed { socket_id: SocketId },
}

impl BridgeEvent {
    /// Socket this event belongs to
    pub fn socket_id(&self) -> &SocketId {
        match self {
            BridgeEvent::Opened { socket_id }
            | BridgeEvent::OpenFailed { socket_id, .. }
            | BridgeEvent::Data { socket_id, .. }
            | BridgeEvent::Error { socket_id, .. }
            | BridgeEvent::Closed { socket_id } => socket_id,
        }
    }
}

/// A [`BridgeEvent`] tagged with the bridge instance that raised it.
///
/// Socket ids can be reused once a connection is gone; stamps never are, so
/// events still in flight from an old bridge cannot be mistaken for the new
/// one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeReport {
    pub stamp: u64,
    pub event: BridgeEvent,
}

/// Handle to one open (or opening) bridge
pub trait Bridge: Send {
    /// Forward bytes to the local target.
    ///
    /// Writes issued before the connect completes are delivered once it
    /// does; writes after the bridge has closed are dropped.
    fn write(&self, payload: Bytes);

    /// Half-close then terminate the local socket. Idempotent.
    fn close(&self);
}

/// Opens bridges to the local target
pub trait LocalBridge: Send + Sync {
    /// Start connecting a bridge for `socket_id`.
    ///
    /// Every event the bridge raises is reported on `events` under `stamp`,
    /// starting with `Opened` or `OpenFailed`.
    fn open(
        &self,
        socket_id: SocketId,
        stamp: u64,
        events: mpsc::Sender<BridgeReport>,
    ) -> Box<dyn Bridge>;
}

/// [`LocalBridge`] backed by real TCP connections
#[derive(Debug, Clone)]
pub struct TcpBridgeConnector {
    target: String,
    connect_timeout: Duration,
}

impl TcpBridgeConnector {
    /// Create a connector for `target` (`host:port`)
    pub fn new(target: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            target: target.into(),
            connect_timeout,
        }
    }

    /// Create a connector for the target described by the configuration
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.target_address(), config.bridge_connect_timeout)
    }
}

impl LocalBridge for TcpBridgeConnector {
    fn open(
        &self,
        socket_id: SocketId,
        stamp: u64,
        events: mpsc::Sender<BridgeReport>,
    ) -> Box<dyn Bridge> {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let overflow = CancellationToken::new();

        let task = BridgeTask {
            socket_id: socket_id.clone(),
            stamp,
            target: self.target.clone(),
            connect_timeout: self.connect_timeout,
            events,
            cancel: cancel.clone(),
            overflow: overflow.clone(),
        };
        tokio::spawn(task.run(write_rx));

        Box::new(TcpBridge {
            socket_id,
            write_tx,
            cancel,
            overflow,
        })
    }
}

/// Handle to a bridge task
struct TcpBridge {
    socket_id: SocketId,
    write_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    overflow: CancellationToken,
}

impl Bridge for TcpBridge {
    fn write(&self, payload: Bytes) {
        match self.write_tx.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if !self.overflow.is_cancelled() {
                    tracing::warn!("Write queue for {} is full, failing connection", self.socket_id);
                    self.overflow.cancel();
                }
            }
            // Task has exited
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// State owned by one bridge task
struct BridgeTask {
    socket_id: SocketId,
    stamp: u64,
    target: String,
    connect_timeout: Duration,
    events: mpsc::Sender<BridgeReport>,
    /// Agent closed the connection
    cancel: CancellationToken,
    /// Write queue overflowed
    overflow: CancellationToken,
}

/// Why the read side stopped
enum ReadEnd {
    Eof,
    Failed(std::io::Error),
    /// Agent is no longer listening
    Detached,
}

impl BridgeTask {
    async fn run(self, write_rx: mpsc::Receiver<Bytes>) {
        let Some(stream) = self.connect().await else {
            return;
        };
        let _ = stream.set_nodelay(true);

        let (mut reader, writer) = stream.into_split();
        // Stops the writer on its own; also fired by an agent close
        let stop = self.cancel.child_token();

        // Closed while connecting: deliver what was queued, then hang up
        if self.cancel.is_cancelled() {
            write_pump(writer, write_rx, stop).await.ok();
            tracing::debug!("Bridge for {} closed before it opened", self.socket_id);
            return;
        }

        if self
            .emit(BridgeEvent::Opened {
                socket_id: self.socket_id.clone(),
            })
            .await
            .is_err()
        {
            return;
        }

        let mut writes: JoinHandle<std::io::Result<()>> =
            tokio::spawn(write_pump(writer, write_rx, stop.clone()));

        let failure = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => {
                // The writer flushes and shuts down by itself
                tracing::debug!("Bridge for {} closed by agent", self.socket_id);
                return;
            }

            _ = self.overflow.cancelled() => {
                writes.abort();
                TunnelError::LocalSocketError("write queue full".to_string())
            }

            result = &mut writes => match result {
                // Write queue closed: the handle is gone
                Ok(Ok(())) => return,
                Ok(Err(e)) => TunnelError::LocalSocketError(e.to_string()),
                Err(e) => TunnelError::LocalSocketError(e.to_string()),
            },

            end = self.read_pump(&mut reader) => match end {
                ReadEnd::Eof => {
                    tracing::debug!("Local target ended {}", self.socket_id);
                    stop.cancel();
                    let _ = self.emit(BridgeEvent::Closed { socket_id: self.socket_id.clone() }).await;
                    return;
                }
                ReadEnd::Failed(e) => {
                    writes.abort();
                    TunnelError::LocalSocketError(e.to_string())
                }
                ReadEnd::Detached => {
                    stop.cancel();
                    return;
                }
            },
        };

        self.fail(failure).await;
    }

    /// Connect to the target, reporting `OpenFailed` on refusal or timeout.
    ///
    /// A close issued meanwhile does not abort the attempt, so queued writes
    /// still reach the target; a failed attempt after a close is silent.
    async fn connect(&self) -> Option<TcpStream> {
        let attempt =
            tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.target)).await;

        let error = match attempt {
            Ok(Ok(stream)) => {
                tracing::debug!("Bridge for {} connected to {}", self.socket_id, self.target);
                return Some(stream);
            }
            Ok(Err(e)) => TunnelError::TargetUnreachable(format!("{}: {}", self.target, e)),
            Err(_) => TunnelError::TargetUnreachable(format!(
                "{}: connect timed out after {:?}",
                self.target, self.connect_timeout
            )),
        };

        tracing::debug!("Bridge for {} failed to open: {}", self.socket_id, error);
        if self.cancel.is_cancelled() {
            return None;
        }
        let _ = self
            .emit(BridgeEvent::OpenFailed {
                socket_id: self.socket_id.clone(),
                error,
            })
            .await;
        None
    }

    /// Relay everything the target sends until EOF or an error
    async fn read_pump(&self, reader: &mut OwnedReadHalf) -> ReadEnd {
        let mut buf = vec![0u8; BRIDGE_READ_BUFFER];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => return ReadEnd::Eof,
                Ok(n) => {
                    tracing::trace!("{} bytes from local target for {}", n, self.socket_id);
                    let event = BridgeEvent::Data {
                        socket_id: self.socket_id.clone(),
                        payload: Bytes::copy_from_slice(&buf[..n]),
                    };
                    if self.emit(event).await.is_err() {
                        return ReadEnd::Detached;
                    }
                }
                Err(e) => return ReadEnd::Failed(e),
            }
        }
    }

    async fn fail(&self, error: TunnelError) {
        tracing::debug!("Local socket error on {}: {}", self.socket_id, error);
        let _ = self
            .emit(BridgeEvent::Error {
                socket_id: self.socket_id.clone(),
                error,
            })
            .await;
        let _ = self
            .emit(BridgeEvent::Closed {
                socket_id: self.socket_id.clone(),
            })
            .await;
    }

    async fn emit(&self, event: BridgeEvent) -> Result<(), mpsc::error::SendError<BridgeReport>> {
        self.events
            .send(BridgeReport {
                stamp: self.stamp,
                event,
            })
            .await
    }
}

/// Write queued chunks to the target in order.
///
/// Once `stop` fires, whatever is already queued is still delivered (within
/// [`CLOSE_FLUSH_TIMEOUT`]) before the write half is shut down, so `data`
/// followed by `_end` reaches the target intact.
async fn write_pump(
    mut writer: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<Bytes>,
    stop: CancellationToken,
) -> std::io::Result<()> {
    let forward = async {
        while let Some(payload) = next_write(&mut write_rx, &stop).await {
            writer.write_all(&payload).await?;
        }
        Ok::<(), std::io::Error>(())
    };
    let deadline = async {
        stop.cancelled().await;
        tokio::time::sleep(CLOSE_FLUSH_TIMEOUT).await;
    };

    let result = tokio::select! {
        result = forward => result,
        _ = deadline => Ok(()),
    };
    let _ = writer.shutdown().await;
    result
}

/// Next queued chunk; after `stop`, only chunks that are already queued
async fn next_write(write_rx: &mut mpsc::Receiver<Bytes>, stop: &CancellationToken) -> Option<Bytes> {
    tokio::select! {
        biased;
        payload = write_rx.recv() => payload,
        _ = stop.cancelled() => write_rx.try_recv().ok(),
    }
}
