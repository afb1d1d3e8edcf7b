//! stormflash CLI - Command-line tool for the StormLoader serial bootloader.
//!
//! ## Features
//!
//! - Flash raw application images with page padding and CRC verification
//! - Check that the bootloader answers
//! - Verify flash contents against an image without writing
//! - Compute the CRC of a prepared image offline
//! - Environment variable and config file support

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::debug;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use stormflash::{
    BootloaderSession, CrcAlgorithm, DEFAULT_BASE_ADDRESS, DEFAULT_BAUD, FirmwareImage,
    NativePort, SerialConfig, SessionConfig,
};
use thiserror::Error;

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Errors raised by the CLI itself rather than the library.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Required setting missing or malformed.
    #[error("{0}")]
    Usage(String),
}

/// stormflash - Flash firmware through the StormLoader serial bootloader.
///
/// Environment variables:
///   STORMFLASH_PORT     - Default serial port
///   STORMFLASH_BAUD     - Default baud rate (default: 115200)
///   STORMFLASH_ADDRESS  - Default flash base address (default: 0x30000)
#[derive(Parser)]
#[command(name = "stormflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub(crate) struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "STORMFLASH_PORT")]
    pub port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "STORMFLASH_BAUD")]
    pub baud: Option<u32>,

    /// CRC algorithm the bootloader uses (iso-hdlc, cksum).
    #[arg(long, global = true, value_parser = parse_crc)]
    pub crc: Option<CrcAlgorithm>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Flash a raw firmware image and verify it.
    Flash {
        /// Path to the firmware image.
        firmware: PathBuf,

        /// Flash base address.
        #[arg(short, long, value_parser = parse_hex_u32, env = "STORMFLASH_ADDRESS")]
        address: Option<u32>,

        /// Do not append the zero trailer before padding.
        #[arg(long)]
        no_trailer: bool,

        /// Print the result as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Check that the bootloader answers.
    Ping,

    /// Compare flash contents with a firmware image without writing.
    Verify {
        /// Path to the firmware image.
        firmware: PathBuf,

        /// Flash base address.
        #[arg(short, long, value_parser = parse_hex_u32, env = "STORMFLASH_ADDRESS")]
        address: Option<u32>,

        /// Do not append the zero trailer before padding.
        #[arg(long)]
        no_trailer: bool,
    },

    /// Print the CRC of a prepared image (no device needed).
    Crc {
        /// Path to the firmware image.
        firmware: PathBuf,

        /// Do not append the zero trailer before padding.
        #[arg(long)]
        no_trailer: bool,
    },
}

/// Parse hexadecimal address (supports 0x prefix and underscores).
fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim();
    let s = s.trim_start_matches("0x").trim_start_matches("0X");
    // Support underscore separators like 0x00_03_00_00
    let s: String = s.chars().filter(|c| *c != '_').collect();
    u32::from_str_radix(&s, 16).map_err(|e| format!("Invalid hex address: {e}"))
}

fn parse_crc(s: &str) -> Result<CrcAlgorithm, String> {
    s.parse().map_err(|e: stormflash::Error| e.to_string())
}

/// Settings resolved from the command line, environment and config files.
pub(crate) struct Settings<'a> {
    cli: &'a Cli,
    config: Config,
}

impl<'a> Settings<'a> {
    fn new(cli: &'a Cli, config: Config) -> Self {
        Self { cli, config }
    }

    pub fn quiet(&self) -> bool {
        self.cli.quiet
    }

    pub fn port(&self) -> Result<String> {
        self.cli
            .port
            .clone()
            .or_else(|| self.config.connection.serial.clone())
            .ok_or_else(|| {
                CliError::Usage(
                    "No serial port specified; use --port or set STORMFLASH_PORT".to_string(),
                )
                .into()
            })
    }

    pub fn baud(&self) -> u32 {
        self.cli
            .baud
            .or(self.config.connection.baud)
            .unwrap_or(DEFAULT_BAUD)
    }

    pub fn address(&self, arg: Option<u32>) -> u32 {
        arg.or(self.config.flash.address)
            .unwrap_or(DEFAULT_BASE_ADDRESS)
    }

    pub fn no_trailer(&self, arg: bool) -> bool {
        arg || self.config.flash.no_trailer
    }

    pub fn crc(&self) -> Result<CrcAlgorithm> {
        if let Some(crc) = self.cli.crc {
            return Ok(crc);
        }
        match &self.config.flash.crc {
            Some(name) => name
                .parse()
                .with_context(|| format!("Invalid crc setting in config: {name}")),
            None => Ok(CrcAlgorithm::default()),
        }
    }

    /// Open the configured port and wrap it in a session.
    pub fn open_session(&self) -> Result<BootloaderSession<NativePort>> {
        let port_name = self.port()?;
        let baud = self.baud();
        let session_config = SessionConfig::default().with_crc(self.crc()?);

        let serial = SerialConfig::new(&port_name, baud).with_timeout(session_config.read_timeout);
        let port = NativePort::open(&serial)
            .with_context(|| format!("Failed to open serial port {port_name}"))?;
        debug!("Opened {port_name} at {baud} baud");

        BootloaderSession::new(port, session_config).context("Failed to configure session")
    }
}

/// Read a firmware file and prepare it for flashing.
pub(crate) fn load_image(path: &Path, no_trailer: bool) -> Result<FirmwareImage> {
    let raw = std::fs::read(path)
        .with_context(|| format!("Failed to read firmware file {}", path.display()))?;
    let image = if no_trailer {
        FirmwareImage::padded(&raw)
    } else {
        FirmwareImage::prepare(&raw)
    };
    image.with_context(|| format!("Cannot prepare {}", path.display()))
}

fn main() -> Result<()> {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "stormflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::SeqCst)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    stormflash::set_interrupt_checker(|| INTERRUPTED.load(Ordering::SeqCst));

    // Load configuration
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };
    let settings = Settings::new(&cli, config);

    match &cli.command {
        Commands::Flash {
            firmware,
            address,
            no_trailer,
            json,
        } => commands::flash::cmd_flash(&settings, firmware, *address, *no_trailer, *json),
        Commands::Ping => commands::device::cmd_ping(&settings),
        Commands::Verify {
            firmware,
            address,
            no_trailer,
        } => commands::flash::cmd_verify(&settings, firmware, *address, *no_trailer),
        Commands::Crc {
            firmware,
            no_trailer,
        } => commands::image::cmd_crc(&settings, firmware, *no_trailer),
    }
}
