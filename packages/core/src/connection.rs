// ABOUTME: Connection state machine for the sandbox transport
// ABOUTME: Tracks disconnected/connecting/connected/reconnecting/failed transitions

use serde::{Deserialize, Serialize};

/// Connection state of the sandbox transport.
///
/// Legal transitions:
/// `Disconnected -> Connecting -> Connected <-> Reconnecting -> (Connected | Failed)`;
/// the live states can drop to `Disconnected` at any time, a dropped
/// transport may start `Reconnecting` on its own, and `Failed` leaves via
/// `Connecting` when the sandbox is recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Whether `next` is a legal successor of `self`. The supervisor's
    /// event observer drops handle-reported transitions that fail this
    /// check (duplicates from a flapping transport included).
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Disconnected, Reconnecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Reconnecting, Disconnected)
                | (Failed, Connecting)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
