//! StormLoader wire protocol: framing and checksums.

pub mod crc;
pub mod frame;

// Re-export common types
pub use crc::{CrcAlgorithm, crc32};
pub use frame::{Command, CommandFrame, DeviceStatus, ESCAPE, FrameDecoder, Response, SYNC_PREAMBLE};
