//! Error types for stormflash.

use crate::protocol::frame::DeviceStatus;
use crate::session::SessionState;
use std::io;
use thiserror::Error;

/// Result type for stormflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for stormflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Fewer bytes than expected arrived before the read timeout.
    #[error("Transport timeout: expected {expected} bytes, received {received}")]
    TransportTimeout {
        /// Number of bytes requested.
        expected: usize,
        /// Number of bytes actually received.
        received: usize,
    },

    /// A response did not start with the escape marker; the stream is out of sync.
    #[error("Framing error: expected escape byte {expected:#04x}, got {found:#04x}")]
    Framing {
        /// The escape marker.
        expected: u8,
        /// The byte found in its place.
        found: u8,
    },

    /// The device answered a command with a non-OK status.
    #[error("Device rejected command at address {address:#010x}: {status}")]
    DeviceRejected {
        /// Address the command targeted.
        address: u32,
        /// Status reported by the device.
        status: DeviceStatus,
    },

    /// No pong after every ping attempt.
    #[error("Bootloader did not answer ping after {attempts} attempts")]
    LivenessTimeout {
        /// Number of ping attempts made.
        attempts: u32,
    },

    /// Device CRC over the written range differs from the local CRC.
    #[error("CRC verification failed: expected {expected:#010x}, device reported {actual:#010x}")]
    VerificationFailed {
        /// CRC computed locally over the transferred bytes.
        expected: u32,
        /// CRC reported by the device.
        actual: u32,
    },

    /// The firmware image cannot be flashed as given.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// A page buffer does not match the configured page size.
    #[error("Invalid page at {address:#010x}: {len} bytes, expected {expected}")]
    InvalidPage {
        /// Page address.
        address: u32,
        /// Supplied length.
        len: usize,
        /// Configured page size.
        expected: usize,
    },

    /// An operation was attempted in the wrong session state.
    #[error("Cannot {operation} while session is {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: &'static str,
        /// State the session was in.
        state: SessionState,
    },

    /// The embedding application requested cancellation between pages.
    #[error("Operation interrupted")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
