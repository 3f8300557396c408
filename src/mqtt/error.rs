//! Error types for the MQTT transport boundary
//!
//! None of these ever reach the command interface of the session manager. They
//! are produced by the transport adapter and turned into either a state
//! transition or a log line by the manager.

use thiserror::Error;

/// Failures reported by a [`Transport`](super::transport::Transport) or one of
/// its session handles
#[derive(Debug, Error)]
pub enum TransportError {
    /// The session configuration cannot be turned into a connection
    #[error("Invalid session configuration: {0}")]
    InvalidConfig(String),

    /// The publish request could not be queued
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The subscribe request could not be queued
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// The close request could not be delivered
    #[error("Close failed: {0}")]
    Close(String),
}
