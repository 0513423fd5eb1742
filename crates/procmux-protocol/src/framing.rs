//! Length-prefixed framing for stream transports.
//!
//! Each frame is a 4-byte big-endian length prefix followed by one JSON
//! document (a request, an array of requests, or a response):
//!
//! ```text
//! +----------------+------------------+
//! | length (4 BE)  |  JSON payload    |
//! +----------------+------------------+
//! ```

use crate::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, ProtocolResult};

/// Prefixes a payload with its length.
///
/// # Example
///
/// ```rust
/// use procmux_protocol::{MAX_MESSAGE_SIZE, encode_frame, frame_len};
///
/// let frame = encode_frame(br#"{"id":1}"#).unwrap();
/// let header: [u8; 4] = frame[..4].try_into().unwrap();
/// assert_eq!(frame_len(header, MAX_MESSAGE_SIZE).unwrap(), 8);
/// ```
pub fn encode_frame(payload: &[u8]) -> ProtocolResult<Vec<u8>> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buffer = Vec::with_capacity(4 + payload.len());
    buffer.extend_from_slice(&len.to_be_bytes());
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

/// Validates a length prefix and returns the payload length it announces.
pub fn frame_len(header: [u8; 4], max: u32) -> ProtocolResult<usize> {
    let len = u32::from_be_bytes(header);
    if len > max {
        return Err(ProtocolError::MessageTooLarge { size: len, max });
    }
    if len == 0 {
        return Err(ProtocolError::EmptyMessage);
    }
    Ok(len as usize)
}
