//! Line framing: one compact JSON document per `\n`-terminated line.
//!
//! Frames are always UTF-8 regardless of the host locale. `serde_json`
//! escapes control characters inside strings, so an encoded frame never
//! contains a raw newline before its terminator.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors decoding a frame read from the wire.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("frame is not a valid message: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message as a newline-terminated frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = serde_json::to_vec(message)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Decode one raw line (with or without its terminator).
///
/// Returns `Ok(None)` for blank lines, which are ignored.
pub fn decode_frame<T: DeserializeOwned>(line: &[u8]) -> Result<Option<T>, FrameError> {
    let text = std::str::from_utf8(line)?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(trimmed)?))
}
