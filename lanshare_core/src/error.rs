use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by a send or receive session.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Source file is missing or cannot be opened for reading
    #[error("File not found: {path} ({source})")]
    NotFound {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Connect/accept failed, or the peer closed or misbehaved mid-session
    #[error("Connection error: {0}")]
    Connection(String),

    /// Header (or beacon) payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Local disk I/O failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?} while {1}")]
    Timeout(Duration, &'static str),

    #[error("Transfer cancelled")]
    Cancelled,
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::Decode(e.to_string())
    }
}

impl TransferError {
    /// Wrap a socket-level failure, keeping the operation that failed in the message.
    pub fn connection(context: &str, e: std::io::Error) -> Self {
        TransferError::Connection(format!("{}: {}", context, e))
    }

    /// True if the error was caused by the peer or the network rather than local state.
    pub fn is_connection(&self) -> bool {
        matches!(self, TransferError::Connection(_))
    }
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;
