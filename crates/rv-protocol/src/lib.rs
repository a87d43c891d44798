//! rv-protocol: Control-channel protocol for rendezvous tunnels
//!
//! This crate defines the named events exchanged between a local agent and
//! the rendezvous proxy, and the framing used to carry them over a single
//! long-lived control connection.

pub mod codec;
pub mod error;
pub mod event;
pub mod frame;
pub mod socket;

pub use codec::EventCodec;
pub use error::ProtocolError;
pub use event::{Event, EventName};
pub use frame::{FrameHeader, HEADER_SIZE, MAX_BODY_SIZE};
pub use socket::SocketId;
