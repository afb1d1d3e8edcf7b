//! Flash and verify command implementations.

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;

use stormflash::Port;

use crate::{Settings, load_image, use_fancy_output};

fn progress_bar(quiet: bool, pages: usize) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(pages as u64);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pages {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    settings: &Settings<'_>,
    firmware: &Path,
    address: Option<u32>,
    no_trailer: bool,
    json: bool,
) -> Result<()> {
    let quiet = settings.quiet() || json;
    let address = settings.address(address);

    if !quiet {
        eprintln!(
            "{} Loading firmware: {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let image = load_image(firmware, settings.no_trailer(no_trailer))?;
    if !quiet {
        eprintln!(
            "    {} {} bytes ({} after padding, {} pages) @ 0x{:08X}",
            style("•").dim(),
            image.raw_len(),
            image.len(),
            image.page_count(),
            address
        );
    }

    let mut session = settings.open_session()?;
    if !quiet {
        eprintln!(
            "{} Using port {} at {} baud",
            style("🔌").cyan(),
            session.port().name(),
            session.port().baud_rate()
        );
    }

    let pb = progress_bar(quiet, image.page_count());
    let result = session.flash_with_progress(&image, address, |done, _| {
        pb.set_position(done as u64);
    });
    if let Err(e) = session.close() {
        log::debug!("Error closing port: {e}");
    }

    let stats = match result {
        Ok(stats) => {
            pb.finish_with_message("done");
            stats
        },
        Err(e) => {
            pb.abandon();
            return Err(e).with_context(|| format!("Failed to flash {}", firmware.display()));
        },
    };

    if json {
        let output = serde_json::json!({
            "ok": true,
            "data": {
                "firmware": firmware.display().to_string(),
                "crc_hex": format!("0x{:08X}", stats.crc),
                "elapsed_ms": stats.elapsed.as_millis(),
                "stats": serde_json::to_value(&stats)?,
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if !quiet {
        eprintln!(
            "\n{} Flashed {} bytes in {:.3} s, CRC 0x{:08X} verified",
            style("🎉").green().bold(),
            stats.bytes_written,
            stats.elapsed.as_secs_f64(),
            stats.crc
        );
    }

    Ok(())
}

/// Verify command implementation.
pub(crate) fn cmd_verify(
    settings: &Settings<'_>,
    firmware: &Path,
    address: Option<u32>,
    no_trailer: bool,
) -> Result<()> {
    let address = settings.address(address);
    let image = load_image(firmware, settings.no_trailer(no_trailer))?;

    let mut session = settings.open_session()?;
    if !settings.quiet() {
        eprintln!(
            "{} Comparing {} bytes at 0x{:08X} on {}",
            style("🔍").cyan(),
            image.len(),
            address,
            session.port().name()
        );
    }

    let result = session.verify_image(&image, address);
    if let Err(e) = session.close() {
        log::debug!("Error closing port: {e}");
    }
    let crc = result.with_context(|| format!("Failed to verify {}", firmware.display()))?;

    if !settings.quiet() {
        eprintln!(
            "{} Flash matches {} (CRC 0x{:08X})",
            style("✓").green(),
            firmware.display(),
            crc
        );
    }
    Ok(())
}
