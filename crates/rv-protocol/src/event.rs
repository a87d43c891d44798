//! Control-channel events
//!
//! Every message on the control channel is a named event with a small body.
//! The names are the wire contract shared with the rendezvous proxy and must
//! not change.
//!
//! # Event Flow
//!
//! 1. Agent connects and sends `register_server` with its hostname
//! 2. For every public client, the proxy sends `create_connection`
//! 3. Client bytes flow as `data` in both directions, tagged by socket id
//! 4. The proxy ends a connection with `_end` (or `socket_error`)
//! 5. The agent reports local failures with `_error` and local closes with
//!    `disconnect_client`

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::socket::SocketId;

/// Event name as carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    /// Agent announces its hostname (agent → proxy)
    RegisterServer,
    /// A new public client arrived (proxy → agent)
    CreateConnection,
    /// Client bytes (both directions)
    Data,
    /// Remote side of a connection failed (proxy → agent)
    SocketError,
    /// Local side of a connection failed (agent → proxy)
    Error,
    /// Remote side ended a connection (proxy → agent)
    End,
    /// Local target closed a connection (agent → proxy)
    DisconnectClient,
}

impl EventName {
    /// All event names, in wire-table order
    pub const ALL: [EventName; 7] = [
        EventName::RegisterServer,
        EventName::CreateConnection,
        EventName::Data,
        EventName::SocketError,
        EventName::Error,
        EventName::End,
        EventName::DisconnectClient,
    ];

    /// Wire representation of this name
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::RegisterServer => "register_server",
            EventName::CreateConnection => "create_connection",
            EventName::Data => "data",
            EventName::SocketError => "socket_error",
            EventName::Error => "_error",
            EventName::End => "_end",
            EventName::DisconnectClient => "disconnect_client",
        }
    }

    /// Parse a wire name
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.as_str() == name)
    }
}

impl std::fmt::Display for EventName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A control-channel event with its body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `register_server { hostname }`
    RegisterServer { hostname: String },

    /// `create_connection { socketId }`
    CreateConnection { socket_id: SocketId },

    /// `data { socketId, payload }`
    Data { socket_id: SocketId, payload: Bytes },

    /// `socket_error { socketId }`
    SocketError { socket_id: SocketId },

    /// `_error { socketId, error }`
    Error { socket_id: SocketId, error: String },

    /// `_end { socketId }`
    End { socket_id: SocketId },

    /// `disconnect_client { socketId }`
    DisconnectClient { socket_id: SocketId },
}

impl Event {
    /// Get the wire name for this event
    pub fn name(&self) -> EventName {
        match self {
            Event::RegisterServer { .. } => EventName::RegisterServer,
            Event::CreateConnection { .. } => EventName::CreateConnection,
            Event::Data { .. } => EventName::Data,
            Event::SocketError { .. } => EventName::SocketError,
            Event::Error { .. } => EventName::Error,
            Event::End { .. } => EventName::End,
            Event::DisconnectClient { .. } => EventName::DisconnectClient,
        }
    }

    /// Socket this event refers to, if any
    pub fn socket_id(&self) -> Option<&SocketId> {
        match self {
            Event::RegisterServer { .. } => None,
            Event::CreateConnection { socket_id }
            | Event::Data { socket_id, .. }
            | Event::SocketError { socket_id }
            | Event::Error { socket_id, .. }
            | Event::End { socket_id }
            | Event::DisconnectClient { socket_id } => Some(socket_id),
        }
    }

    /// Serialize the body (fields in declaration order)
    pub(crate) fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = match self {
            Event::RegisterServer { hostname } => bincode::serialize(hostname)?,
            Event::CreateConnection { socket_id }
            | Event::SocketError { socket_id }
            | Event::End { socket_id }
            | Event::DisconnectClient { socket_id } => bincode::serialize(socket_id)?,
            Event::Data { socket_id, payload } => bincode::serialize(&(socket_id, payload))?,
            Event::Error { socket_id, error } => bincode::serialize(&(socket_id, error))?,
        };
        Ok(body)
    }

    /// Deserialize a body for the given name
    pub(crate) fn decode_body(name: EventName, body: &[u8]) -> Result<Self, ProtocolError> {
        let event = match name {
            EventName::RegisterServer => Event::RegisterServer {
                hostname: bincode::deserialize(body)?,
            },
            EventName::CreateConnection => Event::CreateConnection {
                socket_id: bincode::deserialize(body)?,
            },
            EventName::Data => {
                let (socket_id, payload): (SocketId, Bytes) = bincode::deserialize(body)?;
                Event::Data { socket_id, payload }
            }
            EventName::SocketError => Event::SocketError {
                socket_id: bincode::deserialize(body)?,
            },
            EventName::Error => {
                let (socket_id, error): (SocketId, String) = bincode::deserialize(body)?;
                Event::Error { socket_id, error }
            }
            EventName::End => Event::End {
                socket_id: bincode::deserialize(body)?,
            },
            EventName::DisconnectClient => Event::DisconnectClient {
                socket_id: bincode::deserialize(body)?,
            },
        };
        Ok(event)
    }
}
