//! Registry of live virtual connections

use std::collections::HashMap;

use rv_protocol::SocketId;

use crate::connection::VirtualConnection;

/// Maps correlation ids to live virtual connections.
///
/// Owned by a single agent and only mutated from its dispatch loop, so no
/// locking is needed. Closed connections are removed, never retained, and a
/// lookup miss always means "already gone".
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: HashMap<SocketId, VirtualConnection>,
}

impl ConnectionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection. Returns false, leaving the table untouched, if
    /// the id is already tracked.
    pub fn insert(&mut self, connection: VirtualConnection) -> bool {
        if self.connections.contains_key(connection.id()) {
            return false;
        }
        self.connections.insert(connection.id().clone(), connection);
        true
    }

    /// Whether the id is tracked
    pub fn contains(&self, id: &SocketId) -> bool {
        self.connections.contains_key(id)
    }

    /// Whether `id` is tracked and backed by the bridge stamped `stamp`
    pub fn is_current(&self, id: &SocketId, stamp: u64) -> bool {
        self.connections
            .get(id)
            .is_some_and(|connection| connection.stamp() == stamp)
    }

    /// Look up a connection
    pub fn get(&self, id: &SocketId) -> Option<&VirtualConnection> {
        self.connections.get(id)
    }

    /// Look up a connection for a state change
    pub fn get_mut(&mut self, id: &SocketId) -> Option<&mut VirtualConnection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection
    pub fn remove(&mut self, id: &SocketId) -> Option<VirtualConnection> {
        self.connections.remove(id)
    }

    /// Remove every connection
    pub fn drain(&mut self) -> impl Iterator<Item = VirtualConnection> + '_ {
        self.connections.drain().map(|(_, connection)| connection)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are live
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
