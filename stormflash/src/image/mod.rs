//! Firmware image preparation.

pub mod firmware;

pub use firmware::{FILL_BYTE, FirmwareImage, PAGE_SIZE, Page, TRAILER_LEN};
