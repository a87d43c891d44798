//! Control-channel session with the rendezvous proxy

mod reconnect;
mod session;

pub use reconnect::ExponentialBackoff;
pub use session::{SessionEvent, TcpTunnelSession, TunnelSession};
