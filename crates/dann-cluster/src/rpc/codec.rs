//! Frame codec: `u32` big-endian length prefix, bincode body.

use dann_core::{DannError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upper bound on a single frame; anything larger is treated as a protocol
/// error rather than an allocation request.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Writes one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(message)
        .map_err(|e| DannError::Internal(format!("encode failed: {e}")))?;
    if body.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(DannError::Internal(format!(
            "frame of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_FRAME_BYTES
        )));
    }
    writer
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .map_err(|e| DannError::Transient(e.to_string()))?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| DannError::Transient(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| DannError::Transient(e.to_string()))?;
    Ok(())
}

/// Reads one length-prefixed frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| DannError::Transient(e.to_string()))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(DannError::Transient(format!(
            "peer announced a {len} byte frame, over the {MAX_FRAME_BYTES} byte limit"
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| DannError::Transient(e.to_string()))?;
    bincode::deserialize(&body).map_err(|e| DannError::Transient(format!("decode failed: {e}")))
}

// =============================================================================
// Tests
// =============================================================================
