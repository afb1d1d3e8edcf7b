//! Offline image inspection.

use anyhow::Result;
use console::style;
use std::path::Path;

use crate::{Settings, load_image};

/// CRC command implementation.
///
/// Prints the CRC the device would report after flashing this image, so a
/// build can be checked against a board without a serial connection.
pub(crate) fn cmd_crc(settings: &Settings<'_>, firmware: &Path, no_trailer: bool) -> Result<()> {
    let algorithm = settings.crc()?;
    let image = load_image(firmware, settings.no_trailer(no_trailer))?;
    let crc = algorithm.checksum(image.as_bytes());

    if !settings.quiet() {
        eprintln!(
            "{} {}: {} bytes prepared as {} bytes ({} pages), {}",
            style("ℹ").blue(),
            firmware.display(),
            image.raw_len(),
            image.len(),
            image.page_count(),
            algorithm
        );
    }
    println!("0x{crc:08X}");
    Ok(())
}
