//! Bounded line framing.
//!
//! Messages are newline-terminated text with a hard cap on the payload
//! length; a peer closing the connection also ends the message. The cap is
//! an enforced protocol limit: an over-long frame is a
//! [`TierwayError::FrameTooLarge`] error, never a truncated read.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::error::{Result, TierwayError};

/// Maximum payload length of a single frame, excluding the terminator.
pub const MAX_FRAME_LEN: usize = 80;

/// Reads one frame from the stream.
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// anything. A frame that reaches the cap without a terminator fails with
/// [`TierwayError::FrameTooLarge`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(MAX_FRAME_LEN);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        if buf.len() == MAX_FRAME_LEN {
            return Err(TierwayError::FrameTooLarge(buf.len() + 1));
        }
        buf.push(byte[0]);
    }

    if buf.last() == Some(&b'\r') {
        buf.pop();
    }

    String::from_utf8(buf).map(Some).map_err(|e| TierwayError::Parse(format!("frame is not UTF-8: {e}")))
}

/// Writes one frame to the stream, appending the terminator and flushing.
pub async fn write_frame<W>(writer: &mut W, payload: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(TierwayError::FrameTooLarge(payload.len()));
    }
    writer.write_all(payload.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
