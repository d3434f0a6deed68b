//! Error types for the transport contract, the link pipeline and the bridge loop.

use std::time::Duration;

/// Failure reported by a `Transport` call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peripheral side says it is not connected. Forces a full reconnect.
    #[error("peripheral not connected")]
    NotConnected,
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Failed(String),
}

impl TransportError {
    pub fn failed(msg: impl Into<String>) -> Self {
        TransportError::Failed(msg.into())
    }
}

/// Failure of the connect / acquire-notify pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("transport unavailable: {0}")]
    TransportUnavailable(TransportError),
    #[error("notify acquire failed: {0}")]
    AcquireFailed(TransportError),
    #[error("reconnect cancelled by shutdown")]
    Cancelled,
}

/// Fatal bridge failure. Recoverable conditions (client hang-up, link drop) never surface here.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("i/o failure: {0}")]
    IoFatal(#[from] std::io::Error),
    #[error("peripheral write failed: {0}")]
    WriteFailed(TransportError),
    #[error("peripheral link unavailable: {0}")]
    Link(#[from] LinkError),
    #[error("invalid configuration: {0}")]
    Config(String),
}
