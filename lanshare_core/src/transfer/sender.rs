use crate::TransferHeader;
use crate::error::{Result, TransferError};
use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::constants::BUFFER_SIZE;
use super::protocol::write_header;
use super::session::TransferSession;
use super::utils::{guarded, report_progress};
use super::{ProgressFn, TransferOptions};

/// Send one file to `target` on `opts.port`.
///
/// Connects first, then opens the file, writes the framed header and streams
/// the contents in `BUFFER_SIZE` chunks. Returns the number of body bytes sent.
pub async fn send_file(
    path: &Path,
    target: &str,
    opts: &TransferOptions,
    on_progress: Option<&ProgressFn>,
) -> Result<u64> {
    info!("Connecting to {}:{}", target, opts.port);
    let stream = guarded(opts, "connecting", async {
        TcpStream::connect((target, opts.port))
            .await
            .map_err(|e| TransferError::connection(&format!("Cannot connect to {}", target), e))
    })
    .await?;

    let (mut file, header) = open_source(path).await?;
    info!("Sending: {} ({} bytes)", header.file_name, header.file_size);

    let mut session = TransferSession::new(stream, header.file_size);
    let header_len = guarded(opts, "sending header", write_header(session.stream_mut(), &header)).await?;
    debug!("Header sent ({} bytes)", header_len);

    let mut buffer = vec![0u8; BUFFER_SIZE];
    while !session.is_complete() {
        let to_read = session.next_chunk_len(BUFFER_SIZE);
        let chunk = &mut buffer[..to_read];
        let n = guarded(opts, "reading source file", async {
            file.read(chunk).await.map_err(TransferError::Io)
        })
        .await?;
        if n == 0 {
            return Err(TransferError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "{} shrank during transfer ({}/{} bytes sent)",
                    path.display(),
                    session.bytes_moved(),
                    session.file_size()
                ),
            )));
        }

        let stream = session.stream_mut();
        let data = &buffer[..n];
        guarded(opts, "sending file data", async move {
            stream
                .write_all(data)
                .await
                .map_err(|e| TransferError::connection("Send failed", e))
        })
        .await?;

        let sent = session
            .record(n)
            .ok_or_else(|| TransferError::Connection("Sent past declared size".to_string()))?;
        report_progress(on_progress, sent, session.file_size());
    }

    let stream = session.stream_mut();
    guarded(opts, "closing connection", async move {
        stream
            .shutdown()
            .await
            .map_err(|e| TransferError::connection("Failed to close connection", e))
    })
    .await?;

    info!("File sent: {} ({} bytes)", header.file_name, session.bytes_moved());
    Ok(session.bytes_moved())
}

/// Open the source file and build its header from the base name and length
async fn open_source(path: &Path) -> Result<(File, TransferHeader)> {
    let not_found = |source: io::Error| TransferError::NotFound {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).await.map_err(not_found)?;
    let metadata = file.metadata().await.map_err(not_found)?;
    if !metadata.is_file() {
        return Err(not_found(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a regular file",
        )));
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| not_found(io::Error::new(io::ErrorKind::InvalidInput, "no file name")))?;

    let header = TransferHeader {
        file_name,
        file_size: metadata.len(),
        file_path: path.to_path_buf(),
    };
    Ok((file, header))
}
