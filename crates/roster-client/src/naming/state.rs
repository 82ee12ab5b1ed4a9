//! Discovery client connection state machine

use std::fmt;

use roster_store::ConnectionState;

/// Connection state of a discovery client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// No session; the next read connects lazily
    Disconnected,
    /// A session is being established
    Connecting,
    Connected,
    /// The session is suspended; caches serve possibly stale data
    Suspended,
}

/// What a client does in response to a store state notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateAction {
    Ignore,
    Enter(ClientState),
    /// Discard the session and build a new one
    Rebuild,
}

impl ClientState {
    /// Transition for a state notification from the current session.
    pub fn on_store_event(self, event: ConnectionState) -> StateAction {
        match (self, event) {
            (_, ConnectionState::Lost) => StateAction::Rebuild,
            (ClientState::Connected, ConnectionState::Suspended) => {
                StateAction::Enter(ClientState::Suspended)
            }
            (ClientState::Suspended, ConnectionState::Reconnected | ConnectionState::Connected) => {
                StateAction::Enter(ClientState::Connected)
            }
            (ClientState::Connecting, ConnectionState::Connected | ConnectionState::Reconnected) => {
                StateAction::Enter(ClientState::Connected)
            }
            _ => StateAction::Ignore,
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Disconnected => "DISCONNECTED",
            ClientState::Connecting => "CONNECTING",
            ClientState::Connected => "CONNECTED",
            ClientState::Suspended => "SUSPENDED",
        };
        f.write_str(s)
    }
}
