//! Wire protocol: envelope framing

pub mod codec;

pub use codec::{FrameCodec, MAX_FRAME_SIZE};
