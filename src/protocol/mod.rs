//! Binary protocol layer: frame buffers and the wire codec.
//!
//! - [`buffer`] holds the cursor-based [`FrameBuffer`](buffer::FrameBuffer)
//!   that every message is encoded into and decoded from.
//! - [`wire`] defines the protocol constants and the stateless
//!   encode/decode functions that operate on frame buffers.

pub mod buffer;
pub mod wire;

pub use buffer::FrameBuffer;
pub use wire::ResponseCode;
