//! Device liveness command.

use anyhow::{Context, Result};
use console::style;

use stormflash::Port;

use crate::Settings;

/// Ping command implementation.
pub(crate) fn cmd_ping(settings: &Settings<'_>) -> Result<()> {
    let mut session = settings.open_session()?;
    if !settings.quiet() {
        eprintln!(
            "{} Waiting for bootloader on {}...",
            style("⏳").yellow(),
            session.port().name()
        );
    }

    let result = session.check_alive();
    if let Err(e) = session.close() {
        log::debug!("Error closing port: {e}");
    }
    result.context("Bootloader is not responding")?;

    if !settings.quiet() {
        eprintln!("{} Bootloader is alive", style("✓").green());
    }
    Ok(())
}
