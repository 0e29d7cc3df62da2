//! JSON codec for channel envelopes

use crate::error::{CoreError, Result};
use crate::types::Envelope;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame codec for serialization/deserialization
///
/// One envelope per WebSocket text frame, encoded as a JSON object.
pub struct FrameCodec;

impl FrameCodec {
    /// Encode envelope to a JSON text frame
    pub fn encode(envelope: &Envelope) -> Result<String> {
        let frame = serde_json::to_string(envelope)?;

        if frame.len() > MAX_FRAME_SIZE {
            return Err(CoreError::MessageTooLarge {
                size: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        Ok(frame)
    }

    /// Decode envelope from a text frame
    pub fn decode(frame: &str) -> Result<Envelope> {
        Self::decode_bytes(frame.as_bytes())
    }

    /// Decode envelope from raw bytes (binary frames)
    pub fn decode_bytes(buf: &[u8]) -> Result<Envelope> {
        if buf.len() > MAX_FRAME_SIZE {
            return Err(CoreError::MessageTooLarge {
                size: buf.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        if buf.iter().all(u8::is_ascii_whitespace) {
            return Err(CoreError::InvalidMessageFormat("Empty frame".into()));
        }

        serde_json::from_slice(buf).map_err(CoreError::from)
    }
}
