//! Wire framing.
//!
//! Every message travels as a 4-byte big-endian length prefix followed by
//! that many bytes of UTF-8 JSON. One frame is one message, regardless of
//! how the bytes arrive off the socket; partial reads and coalesced
//! writes are handled here so the rest of the core never sees them.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CommError, Result};

/// Upper bound on a single frame. Anything larger is treated as a
/// protocol violation rather than an allocation request.
pub(crate) const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Writes one length-prefixed frame.
pub(crate) async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(CommError::WriteError(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    let len = (payload.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(|e| CommError::WriteError(e.to_string()))?;
    writer
        .write_all(payload)
        .await
        .map_err(|e| CommError::WriteError(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| CommError::WriteError(e.to_string()))?;
    Ok(())
}

/// Reads one length-prefixed frame and decodes it as UTF-8.
///
/// A clean EOF before the first header byte maps to
/// [`CommError::PeerClosed`]; a truncated frame is a read error.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    reader.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            CommError::PeerClosed
        } else {
            CommError::ReadError(e.to_string())
        }
    })?;

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CommError::ReadError(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| CommError::ReadError(e.to_string()))?;

    String::from_utf8(payload).map_err(|e| CommError::ReadError(e.to_string()))
}
