//! rv-agent: Local tunnel agent for rendezvous proxies
//!
//! The agent runs next to a service that has no public inbound
//! connectivity. It opens one outbound control connection to a rendezvous
//! proxy and bridges every remote client the proxy relays back to it onto a
//! real local TCP connection against the target service.

pub mod agent;
pub mod bridge;
pub mod connection;
pub mod credentials;
pub mod directory;
pub mod listener;
pub mod table;
pub mod tunnel;

pub use agent::TunnelAgent;
pub use bridge::{Bridge, BridgeEvent, BridgeReport, LocalBridge, TcpBridgeConnector};
pub use connection::VirtualConnection;
pub use listener::TunnelListener;
pub use table::ConnectionTable;
pub use tunnel::{SessionEvent, TcpTunnelSession, TunnelSession};
