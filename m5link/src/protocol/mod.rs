//! Binary protocol implementation.

pub mod crc;
pub mod frame;

// Re-export common types
pub use frame::{
    Command, Frame, FrameError, RxBuffer, StatusError, encode_frame, extract_payload, is_complete,
    parse_frame,
};
