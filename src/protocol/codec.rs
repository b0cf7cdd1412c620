//! Length-Prefixed Frame Codec
//!
//! TCP is a byte stream; a read may deliver half a message or three
//! at once. Each message is therefore framed as a 4-byte big-endian
//! length followed by its JSON body. The decoder is incremental:
//!
//! - `Ok(Some((msg, consumed)))` - a complete frame was decoded,
//!   advance the buffer by `consumed`
//! - `Ok(None)` - the frame is incomplete, read more bytes
//! - `Err(_)` - the peer sent garbage, drop the connection
//!
//! The same framing carries AOF records on disk; here it carries
//! [`Request`](super::Request)/[`Response`](super::Response) pairs.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Frame header size: one big-endian u32 length.
pub const HEADER_BYTES: usize = 4;

/// Ceiling on a frame body, against hostile or corrupt lengths.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("malformed frame body: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Serializes `msg` and appends a framed copy to `buf`.
pub fn encode<T: Serialize>(msg: &T, buf: &mut Vec<u8>) -> Result<(), FrameError> {
    let body = serde_json::to_vec(msg).map_err(FrameError::Malformed)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            size: body.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(())
}

/// Convenience for one-shot encoding.
pub fn encode_to_vec<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::new();
    encode(msg, &mut buf)?;
    Ok(buf)
}

/// Attempts to decode one frame from the front of `buf`.
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<Option<(T, usize)>, FrameError> {
    if buf.len() < HEADER_BYTES {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            size: len,
            max: MAX_FRAME_BYTES,
        });
    }
    if buf.len() < HEADER_BYTES + len {
        return Ok(None);
    }

    let msg = serde_json::from_slice(&buf[HEADER_BYTES..HEADER_BYTES + len])
        .map_err(FrameError::Malformed)?;
    Ok(Some((msg, HEADER_BYTES + len)))
}
