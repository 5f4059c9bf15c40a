//! Error types for the hub notifier

use crate::auth::AuthError;

/// Errors that can occur in the notification pipeline
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Transport dropped: {0}")]
    TransportDrop(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Invalid state for operation: {0}")]
    InvalidState(String),

    #[error("Connection attempt cancelled by stop()")]
    Cancelled,

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Failed to send message: {0}")]
    SendError(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;
