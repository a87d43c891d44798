//! Virtual connection state

use bytes::Bytes;

use rv_core::ConnectionState;
use rv_protocol::SocketId;

use crate::bridge::Bridge;

/// One remote-originated logical connection and the local bridge backing it.
///
/// The bridge handle is owned exclusively by this value.
pub struct VirtualConnection {
    id: SocketId,
    /// Bridge instance backing this connection
    stamp: u64,
    state: ConnectionState,
    bridge: Box<dyn Bridge>,
}

impl VirtualConnection {
    /// Track a bridge that has started connecting
    pub fn new(id: SocketId, stamp: u64, bridge: Box<dyn Bridge>) -> Self {
        Self {
            id,
            stamp,
            state: ConnectionState::Connecting,
            bridge,
        }
    }

    /// Correlation id
    pub fn id(&self) -> &SocketId {
        &self.id
    }

    /// Stamp of the bridge backing this connection
    pub fn stamp(&self) -> u64 {
        self.stamp
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Local connect finished. Returns false if the connection was not
    /// waiting for it.
    pub fn mark_open(&mut self) -> bool {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Open;
            true
        } else {
            false
        }
    }

    /// Whether remote bytes should be forwarded to the bridge
    pub fn accepts_data(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Open
        )
    }

    /// Forward remote bytes to the local target
    pub fn write(&self, payload: Bytes) {
        self.bridge.write(payload);
    }

    /// Tear down the local socket
    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closing;
        self.bridge.close();
        self.state = ConnectionState::Closed;
    }

    /// The local socket is already gone; record that without touching it
    pub fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }
}

impl std::fmt::Debug for VirtualConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualConnection")
            .field("id", &self.id)
            .field("stamp", &self.stamp)
            .field("state", &self.state)
            .finish()
    }
}
