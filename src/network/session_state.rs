use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// No sockets, nothing in progress. Initial and terminal state.
    Closed,
    /// Passively waiting for the peer to dial in through the listener
    WaitingForConnection,
    /// Handshake in progress (outbound dial or inbound dial-back)
    Connecting,
    Connected,
    /// An internal invariant broke; only `close` leaves this state
    Error,
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    /// Sockets may only be held in these states.
    pub fn holds_sockets(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Connected)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            // Any state may fail or be closed
            (_, Error) => true,
            (_, Closed) => true,

            (Closed, WaitingForConnection) => true,
            // Re-arming the wait
            (WaitingForConnection, WaitingForConnection) => true,
            (Closed, Connecting) => true,
            (WaitingForConnection, Connecting) => true,
            (Connecting, Connected) => true,

            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Closed => "CLOSED",
            SessionState::WaitingForConnection => "WAITING_FOR_CONNECTION",
            SessionState::Connecting => "CONNECTING",
            SessionState::Connected => "CONNECTED",
            SessionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        use SessionState::*;
        assert!(Closed.can_transition(WaitingForConnection));
        assert!(Closed.can_transition(Connecting));
        assert!(WaitingForConnection.can_transition(Connecting));
        assert!(Connecting.can_transition(Connected));
        assert!(Connected.can_transition(Closed));
        assert!(Connecting.can_transition(Closed));
        assert!(Error.can_transition(Closed));
    }

    #[test]
    fn test_invalid_transitions() {
        use SessionState::*;
        // No skipping the handshake
        assert!(!Closed.can_transition(Connected));
        assert!(!WaitingForConnection.can_transition(Connected));
        // A connected session never re-enters the handshake
        assert!(!Connected.can_transition(Connecting));
        assert!(!Error.can_transition(Connecting));
    }

    #[test]
    fn test_socket_states() {
        assert!(SessionState::Connecting.holds_sockets());
        assert!(SessionState::Connected.holds_sockets());
        assert!(!SessionState::Closed.holds_sockets());
        assert!(!SessionState::Error.holds_sockets());
        assert_eq!(SessionState::WaitingForConnection.to_string(), "WAITING_FOR_CONNECTION");
    }
}
