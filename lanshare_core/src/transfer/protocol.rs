use crate::TransferHeader;
use crate::error::{Result, TransferError};
use serde::Serialize;
use serde_json::ser::Formatter;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::MAX_HEADER_SIZE;

/// JSON formatter emitting `", "` and `": "` separators, so headers and beacons
/// are byte-identical to those produced by common JSON defaults on other peers.
pub struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

/// Encode any message with the wire separator style
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64);
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, SpacedFormatter);
    value.serialize(&mut ser)?;
    Ok(buf)
}

/// Decode a header payload. Unknown fields are ignored.
pub fn decode_header(bytes: &[u8]) -> Result<TransferHeader> {
    serde_json::from_slice(bytes)
        .map_err(|e| TransferError::Decode(format!("Invalid transfer header: {}", e)))
}

/// Write the length prefix followed by the encoded header.
/// Returns the header length that was announced.
pub async fn write_header<W>(writer: &mut W, header: &TransferHeader) -> Result<usize>
where
    W: AsyncWrite + Unpin,
{
    let json = encode_json(header)?;
    let len = u32::try_from(json.len())
        .map_err(|_| TransferError::Decode(format!("Header too large: {} bytes", json.len())))?;

    writer
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| TransferError::connection("Failed to send header length", e))?;
    writer
        .write_all(&json)
        .await
        .map_err(|e| TransferError::connection("Failed to send header", e))?;
    Ok(json.len())
}

/// Read the 4-byte big-endian header length. Oversized headers are refused
/// before anything is allocated.
pub async fn read_header_len<R>(reader: &mut R) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    read_exact_or_closed(reader, &mut len_buf, "header length").await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_HEADER_SIZE {
        return Err(TransferError::Decode(format!(
            "Header too large: {} bytes (max {})",
            len, MAX_HEADER_SIZE
        )));
    }
    Ok(len)
}

/// Read exactly `len` header bytes and decode them
pub async fn read_header<R>(reader: &mut R, len: usize) -> Result<TransferHeader>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    read_exact_or_closed(reader, &mut buf, "header").await?;
    decode_header(&buf)
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransferError::Connection(
            format!("Connection closed while reading {}", what),
        )),
        Err(e) => Err(TransferError::connection(&format!("Failed to read {}", what), e)),
    }
}
