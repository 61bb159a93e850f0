use std::time::Duration;

/// Default TCP port for file transfer
pub const TRANSFER_PORT: u16 = 9999;

/// Chunk size for file transfer (4KB)
pub const BUFFER_SIZE: usize = 4096;

/// Largest header accepted from a peer (64KB)
pub const MAX_HEADER_SIZE: usize = 64 * 1024;

/// Longest file name kept after sanitising, in bytes
pub const MAX_FILENAME_LENGTH: usize = 255;

/// How long the receiver waits after the body for bytes beyond the declared size
pub const TRAILING_PROBE: Duration = Duration::from_millis(200);
