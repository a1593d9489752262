//! Connection state machine
//!
//! Lifecycle of one link to a charge point:
//!
//! ```text
//! Disconnected ──Connect──► Connecting ──Opened──► Connected
//!                              ▲    │                 │
//!                       Connect│    │Lost             │Lost
//!                              │    ▼                 │
//!                           Reconnecting ◄────────────┘
//!
//! any ──Disconnect──► Disconnected
//! Connecting ──OpenFailed──► Error      any ──RetriesExhausted──► Error
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// State of a charge point connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No transport, no automatic activity
    Disconnected,
    /// Transport is being opened
    Connecting,
    /// Transport open, heartbeat running
    Connected,
    /// Transport lost, waiting out the backoff before the next attempt
    Reconnecting,
    /// Open failed or reconnect budget exhausted; needs an explicit connect
    Error,
}

impl ConnectionState {
    /// Apply a transition, returning the next state if it is legal from here
    pub fn apply(self, transition: Transition) -> Option<ConnectionState> {
        use ConnectionState::*;

        match (self, transition) {
            (_, Transition::Disconnect) => Some(Disconnected),
            (_, Transition::RetriesExhausted) => Some(Error),

            (Disconnected | Error | Reconnecting, Transition::Connect) => Some(Connecting),
            (Connecting, Transition::Opened) => Some(Connected),
            (Connecting, Transition::OpenFailed) => Some(Error),
            (Connecting | Connected, Transition::Lost) => Some(Reconnecting),

            _ => None,
        }
    }

    /// Connecting or connected: a new `connect()` must not open another transport
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

/// Inputs that drive the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Caller or reconnect loop starts opening a transport
    Connect,
    /// Transport handshake completed
    Opened,
    /// Caller-initiated open failed
    OpenFailed,
    /// Transport closed or errored without a disconnect request
    Lost,
    /// Reconnect budget used up
    RetriesExhausted,
    /// Caller-initiated disconnect
    Disconnect,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_connect_lifecycle() {
        let state = Disconnected;
        let state = state.apply(Transition::Connect).unwrap();
        assert_eq!(state, Connecting);

        let state = state.apply(Transition::Opened).unwrap();
        assert_eq!(state, Connected);

        let state = state.apply(Transition::Disconnect).unwrap();
        assert_eq!(state, Disconnected);
    }

    #[test]
    fn test_reconnect_cycle() {
        let state = Connected.apply(Transition::Lost).unwrap();
        assert_eq!(state, Reconnecting);

        let state = state.apply(Transition::Connect).unwrap();
        assert_eq!(state, Connecting);

        // A failed attempt goes back to waiting
        assert_eq!(state.apply(Transition::Lost), Some(Reconnecting));
        assert_eq!(Reconnecting.apply(Transition::RetriesExhausted), Some(Error));
    }

    #[test]
    fn test_illegal_transitions() {
        assert_eq!(Connected.apply(Transition::Connect), None);
        assert_eq!(Connecting.apply(Transition::Connect), None);
        assert_eq!(Disconnected.apply(Transition::Opened), None);
        assert_eq!(Disconnected.apply(Transition::Lost), None);
        assert_eq!(Connected.apply(Transition::OpenFailed), None);
    }

    #[test]
    fn test_disconnect_from_anywhere() {
        for state in [Disconnected, Connecting, Connected, Reconnecting, Error] {
            assert_eq!(state.apply(Transition::Disconnect), Some(Disconnected));
        }
    }

    #[test]
    fn test_error_recovers_only_through_connect() {
        assert_eq!(Error.apply(Transition::Connect), Some(Connecting));
        assert_eq!(Error.apply(Transition::Opened), None);
        assert_eq!(Error.apply(Transition::Lost), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Reconnecting.to_string(), "reconnecting");
        assert_eq!(serde_json::to_string(&Connected).unwrap(), "\"connected\"");
    }
}
