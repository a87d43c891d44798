//! Socket correlation identifier

use serde::{Deserialize, Serialize};
use std::fmt;

/// Correlation id for one remote-originated virtual connection.
///
/// Ids are minted by the proxy and are opaque to the agent: they are only
/// compared, hashed and echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketId(pub String);

impl SocketId {
    /// Create a new socket ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket-{}", self.0)
    }
}

impl From<String> for SocketId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SocketId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_id_display() {
        let id = SocketId::new("a1b2");
        assert_eq!(format!("{}", id), "socket-a1b2");
        assert_eq!(id.as_str(), "a1b2");
    }

    #[test]
    fn test_socket_id_equality() {
        assert_eq!(SocketId::from("x"), SocketId::new(String::from("x")));
        assert_ne!(SocketId::from("x"), SocketId::from("y"));
    }
}
