//! # stormflash
//!
//! A library for flashing firmware through the StormLoader serial bootloader.
//!
//! This crate provides the host side of the protocol:
//!
//! - Escape-based command/response framing
//! - Serial transport with DTR/RTS reset and bootloader-select sequencing
//! - Page-by-page flashing with a device-side CRC check
//! - Firmware image preparation (trailer and page padding)
//!
//! ## Features
//!
//! - `native` (default): Native serial port support via the `serialport` crate
//! - `serde`: Serialization support for result types
//!
//! ## Example
//!
//! ```rust,no_run
//! use stormflash::{BootloaderSession, FirmwareImage, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::prepare(&std::fs::read("app.bin")?)?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let port = stormflash::NativePort::open_simple("/dev/ttyUSB0", 115_200)?;
//!         let mut session = BootloaderSession::new(port, SessionConfig::default())?;
//!         session.flash_with_progress(&image, 0x30000, |done, total| {
//!             println!("page {done}/{total}");
//!         })?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod image;
pub mod port;
pub mod protocol;
pub mod session;
pub mod transport;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker polled between flash pages.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    error::{Error, Result},
    image::{FirmwareImage, PAGE_SIZE, Page},
    port::{DEFAULT_BAUD, Port, SerialConfig},
    protocol::{Command, CommandFrame, CrcAlgorithm, DeviceStatus, Response, crc32},
    session::{
        BootloaderSession, DEFAULT_BASE_ADDRESS, DEFAULT_PING_ATTEMPTS, FlashStats,
        SessionConfig, SessionState,
    },
    transport::{ControlLine, ControlLines, Transport},
};
