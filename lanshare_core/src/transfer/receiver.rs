use crate::error::{Result, TransferError};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::constants::{BUFFER_SIZE, TRAILING_PROBE};
use super::protocol::{read_header, read_header_len};
use super::session::TransferSession;
use super::utils::{guarded, open_secure_file, report_progress, sanitize_file_name};
use super::{ProgressFn, TransferOptions};

/// Receive-side session states. Any failure jumps straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    Listening,
    Accepted,
    ReadingHeaderLength,
    ReadingHeader,
    ReadingBody,
    Closed,
}

impl ReceiveState {
    /// Successor on the success path
    pub fn next(self) -> Self {
        match self {
            ReceiveState::Listening => ReceiveState::Accepted,
            ReceiveState::Accepted => ReceiveState::ReadingHeaderLength,
            ReceiveState::ReadingHeaderLength => ReceiveState::ReadingHeader,
            ReceiveState::ReadingHeader => ReceiveState::ReadingBody,
            ReceiveState::ReadingBody | ReceiveState::Closed => ReceiveState::Closed,
        }
    }
}

/// A bound, single-shot transfer listener.
///
/// Binding is separate from receiving so the caller learns the local port
/// before a sender connects.
pub struct Receiver {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Receiver {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransferError::connection(&format!("Cannot listen on {}", addr), e))?;
        let local_addr = listener.local_addr()?;
        info!("Waiting for a transfer on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept exactly one connection, stop listening, and save the incoming
    /// file under `save_dir`. Returns the absolute path of the saved file.
    pub async fn receive_file(
        self,
        save_dir: &Path,
        opts: &TransferOptions,
        on_progress: Option<&ProgressFn>,
    ) -> Result<PathBuf> {
        let mut state = ReceiveState::Listening;
        let listener = self.listener;
        let accepted = guarded(opts, "waiting for a sender", async {
            listener
                .accept()
                .await
                .map_err(|e| TransferError::connection("Accept failed", e))
        })
        .await;
        drop(listener);

        let result = match accepted {
            Ok((stream, peer)) => {
                info!("Connection from: {}", peer);
                advance(&mut state);
                receive_session(stream, save_dir, opts, on_progress, &mut state).await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            warn!("Receive failed in {:?}: {}", state, e);
        }
        debug!("Receive session {:?} -> {:?}", state, ReceiveState::Closed);
        result
    }
}

/// Bind on all interfaces at `opts.port` and receive one file
pub async fn receive_file(
    save_dir: &Path,
    opts: &TransferOptions,
    on_progress: Option<&ProgressFn>,
) -> Result<PathBuf> {
    let receiver = Receiver::bind(SocketAddr::from(([0, 0, 0, 0], opts.port))).await?;
    receiver.receive_file(save_dir, opts, on_progress).await
}

fn advance(state: &mut ReceiveState) {
    let next = state.next();
    debug!("Receive session {:?} -> {:?}", state, next);
    *state = next;
}

async fn receive_session(
    mut stream: TcpStream,
    save_dir: &Path,
    opts: &TransferOptions,
    on_progress: Option<&ProgressFn>,
    state: &mut ReceiveState,
) -> Result<PathBuf> {
    advance(state);
    let header_len = guarded(opts, "reading header length", read_header_len(&mut stream)).await?;

    advance(state);
    let header = guarded(opts, "reading header", read_header(&mut stream, header_len)).await?;
    info!("Receiving file: {}, Size: {} bytes", header.file_name, header.file_size);

    let file_name = sanitize_file_name(&header.file_name);
    if file_name != header.file_name {
        warn!("Renamed incoming file {:?} to {:?}", header.file_name, file_name);
    }

    tokio::fs::create_dir_all(save_dir).await?;
    let file_path = save_dir.join(&file_name);
    let mut file = open_secure_file(&file_path).await?;

    advance(state);
    let mut session = TransferSession::new(stream, header.file_size);
    let mut buffer = vec![0u8; BUFFER_SIZE];

    while !session.is_complete() {
        let to_read = session.next_chunk_len(BUFFER_SIZE);
        let stream = session.stream_mut();
        let chunk = &mut buffer[..to_read];
        let n = guarded(opts, "receiving file data", async move {
            stream
                .read(chunk)
                .await
                .map_err(|e| TransferError::connection("Receive failed", e))
        })
        .await?;

        if n == 0 {
            return Err(TransferError::Connection(format!(
                "Connection interrupted ({}/{} bytes received)",
                session.bytes_moved(),
                session.file_size()
            )));
        }

        file.write_all(&buffer[..n]).await?;
        let received = session
            .record(n)
            .ok_or_else(|| TransferError::Connection("Received past declared size".to_string()))?;
        report_progress(on_progress, received, session.file_size());
    }

    file.flush().await?;
    drop(file);

    let file_size = session.file_size();
    reject_trailing_bytes(session.stream_mut(), file_size).await?;

    let saved = std::path::absolute(&file_path)?;
    info!("File saved to: {}", saved.display());
    Ok(saved)
}

/// The body ends at the declared size. Anything after it is a protocol violation.
async fn reject_trailing_bytes(stream: &mut TcpStream, file_size: u64) -> Result<()> {
    let mut probe = [0u8; 1];
    match tokio::time::timeout(TRAILING_PROBE, stream.read(&mut probe)).await {
        Ok(Ok(0)) | Err(_) => Ok(()),
        Ok(Ok(_)) => Err(TransferError::Connection(format!(
            "Peer sent more than the declared {} bytes",
            file_size
        ))),
        Ok(Err(e)) => {
            debug!("Ignoring socket error after complete body: {}", e);
            Ok(())
        }
    }
}
