//! Connection lifecycle state

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// Lifecycle state of the push connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Whether outbound invocations may be sent in this state
    pub fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
        }
    }
}

impl std::str::FromStr for ConnectionState {
    type Err = HubError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Disconnected" => Ok(ConnectionState::Disconnected),
            "Connecting" => Ok(ConnectionState::Connecting),
            "Connected" => Ok(ConnectionState::Connected),
            "Reconnecting" => Ok(ConnectionState::Reconnecting),
            _ => Err(HubError::InvalidState(format!(
                "Unknown connection state: {}",
                s
            ))),
        }
    }
}
