//! Envelope framing for the connection fabric.
//!
//! Wire format: 4-byte big-endian length prefix followed by a UTF-8 JSON
//! encoding of the [`Envelope`].
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! The underlying transport is assumed reliable, ordered, and full-duplex;
//! the byte-level guarantees beyond this frame shape are out of scope.

use crate::config::FabricConfig;
use crate::envelope::Envelope;
use crate::{CourierError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > FabricConfig::MAX_FRAME_SIZE {
        return Err(CourierError::Protocol {
            message: format!(
                "frame size {} exceeds maximum {}",
                len,
                FabricConfig::MAX_FRAME_SIZE
            ),
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize an envelope and write it as one frame.
pub async fn write_envelope<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> Result<()> {
    let bytes = serde_json::to_vec(envelope)?;
    write_frame(writer, &bytes).await
}

/// Read one frame and decode it as an envelope.
///
/// Returns `None` on clean EOF. A frame that is not a valid envelope is a
/// protocol error, not EOF.
pub async fn read_envelope<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Envelope>> {
    match read_frame(reader).await? {
        Some(bytes) => {
            let envelope = serde_json::from_slice(&bytes).map_err(|e| CourierError::Protocol {
                message: format!("bad envelope frame: {}", e),
            })?;
            Ok(Some(envelope))
        }
        None => Ok(None),
    }
}
