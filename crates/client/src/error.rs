// crates/client/src/error.rs
//! Client-side error types.

use thiserror::Error;

/// A failure of the push connection or the snapshot request.
///
/// Handled inside the reconnect loop; consumers only see it through the
/// connection state once the retry budget is spent.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("snapshot request failed: {0}")]
    Snapshot(String),

    #[error("connection lost: {0}")]
    Disconnected(String),

    #[error("{0} timed out after {1:?}")]
    Timeout(&'static str, std::time::Duration),

    /// The server dropped this subscriber after a gap and wants a fresh snapshot.
    #[error("server requested resync")]
    Resync,
}

impl TransportError {
    pub fn is_resync(&self) -> bool {
        matches!(self, Self::Resync)
    }
}

/// A frame that could not be decoded into a `JobEvent`. Logged and skipped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed job event: {0}")]
    Malformed(#[from] serde_json::Error),
}
