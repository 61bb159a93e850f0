//! TCP file transfer.
//!
//! One connection carries one file:
//! `[u32 BE header_len][header JSON][file_size raw bytes]`.
//! The receiver treats the transfer as complete once `file_size` bytes have
//! arrived; there is no trailing acknowledgement.

pub mod constants;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod session;
pub mod utils;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

// Re-export public API
pub use constants::TRANSFER_PORT;
pub use receiver::{ReceiveState, Receiver, receive_file};
pub use sender::send_file;
pub use session::TransferSession;

/// Progress observer: `(bytes_done, total_bytes)`. Called after every chunk.
pub type ProgressFn = dyn Fn(u64, u64) + Send + Sync;

/// Per-session knobs shared by sender and receiver
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub port: u16,
    /// Deadline for each connect, accept, read and write. `None` blocks indefinitely.
    pub io_timeout: Option<Duration>,
    pub cancel: CancellationToken,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            port: TRANSFER_PORT,
            io_timeout: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl TransferOptions {
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
