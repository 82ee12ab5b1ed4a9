//! Store notification types

use std::fmt;

/// Node creation mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// Lives until explicitly deleted
    Persistent,
    /// Deleted when the creating session ends
    Ephemeral,
}

/// Kind of change observed on a watched node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeEventKind {
    Created,
    Updated,
    Deleted,
}

/// A change to a node under a watched subtree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEvent {
    pub kind: NodeEventKind,
    /// Full path of the changed node
    pub path: String,
    /// Last path segment
    pub name: String,
    /// Node data after the change; `None` for deletions
    pub data: Option<Vec<u8>>,
}

impl NodeEvent {
    pub fn created(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(NodeEventKind::Created, path.into(), Some(data))
    }

    pub fn updated(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(NodeEventKind::Updated, path.into(), Some(data))
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self::new(NodeEventKind::Deleted, path.into(), None)
    }

    fn new(kind: NodeEventKind, path: String, data: Option<Vec<u8>>) -> Self {
        let name = roster_api::path::node_name(&path).to_string();
        Self {
            kind,
            path,
            name,
            data,
        }
    }
}

/// Session state reported on a connection's state channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Session established
    Connected,
    /// Transient loss; the session may still come back
    Suspended,
    /// Session destroyed, ephemeral nodes are gone
    Lost,
    /// Session came back after a suspension
    Reconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Suspended => "SUSPENDED",
            ConnectionState::Lost => "LOST",
            ConnectionState::Reconnected => "RECONNECTED",
        };
        f.write_str(s)
    }
}

/// Everything a subtree watch delivers: node changes and the owning
/// session's state changes, in one ordered stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    Node(NodeEvent),
    ConnectionStateChanged(ConnectionState),
}

impl StoreEvent {
    pub fn as_node(&self) -> Option<&NodeEvent> {
        match self {
            StoreEvent::Node(event) => Some(event),
            StoreEvent::ConnectionStateChanged(_) => None,
        }
    }
}

impl From<NodeEvent> for StoreEvent {
    fn from(event: NodeEvent) -> Self {
        StoreEvent::Node(event)
    }
}

impl From<ConnectionState> for StoreEvent {
    fn from(state: ConnectionState) -> Self {
        StoreEvent::ConnectionStateChanged(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_event_name() {
        let event = NodeEvent::created("/services/orders/id-1", b"{}".to_vec());
        assert_eq!(event.kind, NodeEventKind::Created);
        assert_eq!(event.name, "id-1");
        assert_eq!(event.data.as_deref(), Some(&b"{}"[..]));

        let event = NodeEvent::deleted("/services/orders/id-1");
        assert_eq!(event.kind, NodeEventKind::Deleted);
        assert!(event.data.is_none());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Lost.to_string(), "LOST");
        assert_eq!(ConnectionState::Reconnected.to_string(), "RECONNECTED");
    }

    #[test]
    fn test_store_event_tags() {
        let node = NodeEvent::deleted("/services/orders/id-1");
        let event = StoreEvent::from(node.clone());
        assert_eq!(event.as_node(), Some(&node));

        let event = StoreEvent::from(ConnectionState::Suspended);
        assert_eq!(event, StoreEvent::ConnectionStateChanged(ConnectionState::Suspended));
        assert!(event.as_node().is_none());
    }
}
