//! Bootloader session: the flashing state machine.
//!
//! ```text
//! Disconnected -> ModeEntered -> Alive -> Flashing -> Verifying -> ModeExited
//!                     |            |          |            |           ^
//!                     +------------+----------+------------+-----------+
//!                               (any failure still exits the mode)
//! ```
//!
//! Pages are written strictly in ascending order, one command at a time; a
//! rejected page aborts the transfer with no retry. After the last page the
//! device computes a CRC over the whole range, which is compared with a local
//! CRC instead of reading flash back.
//!
//! ## Example
//!
//! ```rust,no_run
//! use stormflash::{BootloaderSession, FirmwareImage, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let raw = std::fs::read("app.bin")?;
//!     let image = FirmwareImage::prepare(&raw)?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let port = stormflash::NativePort::open_simple("/dev/ttyUSB0", 115_200)?;
//!         let mut session = BootloaderSession::new(port, SessionConfig::default())?;
//!         let stats = session.flash(&image, 0x30000)?;
//!         println!("{} bytes in {:?}", stats.bytes_written, stats.elapsed);
//!         session.close()?;
//!     }
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::image::{FirmwareImage, PAGE_SIZE};
use crate::port::{DEFAULT_TIMEOUT, Port};
use crate::protocol::crc::CrcAlgorithm;
use crate::protocol::frame::{
    CommandFrame, DeviceStatus, ESCAPE, RESPONSE_HEADER_LEN, Response, decode_header,
};
use crate::transport::{ControlLines, Transport};
use log::{debug, info, trace, warn};
use std::fmt;
use std::time::{Duration, Instant};

/// Number of pings sent before giving up on the bootloader.
pub const DEFAULT_PING_ATTEMPTS: u32 = 30;

/// Default flash base address for applications.
pub const DEFAULT_BASE_ADDRESS: u32 = 0x30000;

/// Session parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Internal-flash page size.
    pub page_size: usize,
    /// Per-call read timeout.
    pub read_timeout: Duration,
    /// Ping attempts before declaring the device dead.
    pub ping_attempts: u32,
    /// CRC algorithm the device uses.
    pub crc: CrcAlgorithm,
    /// Reset / mode-select wiring.
    pub lines: ControlLines,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            page_size: PAGE_SIZE,
            read_timeout: DEFAULT_TIMEOUT,
            ping_attempts: DEFAULT_PING_ATTEMPTS,
            crc: CrcAlgorithm::default(),
            lines: ControlLines::default(),
        }
    }
}

impl SessionConfig {
    /// Set the page size.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Set the per-call read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the number of ping attempts.
    #[must_use]
    pub fn with_ping_attempts(mut self, attempts: u32) -> Self {
        self.ping_attempts = attempts;
        self
    }

    /// Set the CRC algorithm.
    #[must_use]
    pub fn with_crc(mut self, crc: CrcAlgorithm) -> Self {
        self.crc = crc;
        self
    }

    /// Set the control-line wiring.
    #[must_use]
    pub fn with_lines(mut self, lines: ControlLines) -> Self {
        self.lines = lines;
        self
    }
}

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Port open, bootloader mode not requested.
    Disconnected,
    /// Reset sequence done, liveness unknown.
    ModeEntered,
    /// Device answered a ping.
    Alive,
    /// Page loop in progress.
    Flashing,
    /// All pages written, CRC check in progress.
    Verifying,
    /// Device reset back into the application.
    ModeExited,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::ModeEntered => "in bootloader mode",
            Self::Alive => "alive",
            Self::Flashing => "flashing",
            Self::Verifying => "verifying",
            Self::ModeExited => "out of bootloader mode",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful flash.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FlashStats {
    /// First address written.
    pub base_address: u32,
    /// Bytes written, including trailer and padding.
    pub bytes_written: usize,
    /// Pages written.
    pub pages: usize,
    /// Wall-clock time of the page loop.
    pub elapsed: Duration,
    /// CRC confirmed by the device.
    pub crc: u32,
}

type InterruptChecker = Box<dyn Fn() -> bool + Send>;

/// A single flashing session over an exclusively owned port.
pub struct BootloaderSession<P: Port> {
    transport: Transport<P>,
    config: SessionConfig,
    state: SessionState,
    interrupted: InterruptChecker,
}

impl<P: Port> BootloaderSession<P> {
    /// Take ownership of `port` and configure it for the session.
    pub fn new(port: P, config: SessionConfig) -> Result<Self> {
        if config.page_size == 0 {
            return Err(Error::Config("page size must be non-zero".into()));
        }
        if config.ping_attempts == 0 {
            return Err(Error::Config("ping attempts must be non-zero".into()));
        }
        let transport = Transport::with_config(port, config.lines, config.read_timeout)?;
        Ok(Self {
            transport,
            config,
            state: SessionState::Disconnected,
            interrupted: Box::new(crate::is_interrupted_requested),
        })
    }

    /// Replace the cancellation check polled between pings and between pages.
    #[must_use]
    pub fn with_interrupt_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn() -> bool + Send + 'static,
    {
        self.interrupted = Box::new(checker);
        self
    }

    /// Current protocol state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Session parameters.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Get a reference to the transport.
    pub fn transport(&self) -> &Transport<P> {
        &self.transport
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        self.transport.port()
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.transport.into_port()
    }

    /// Close the connection.
    pub fn close(&mut self) -> Result<()> {
        self.transport.close()?;
        self.transition(SessionState::Disconnected);
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("Session: {} -> {}", self.state, next);
            self.state = next;
        }
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Reset the device into its bootloader.
    pub fn enter_bootloader_mode(&mut self) -> Result<()> {
        self.transport.enter_bootloader_mode()?;
        self.transition(SessionState::ModeEntered);
        Ok(())
    }

    /// Reset the device into its application.
    pub fn exit_bootloader_mode(&mut self) -> Result<()> {
        self.transport.exit_bootloader_mode()?;
        self.transition(SessionState::ModeExited);
        Ok(())
    }

    /// Probe the bootloader until it answers or attempts run out.
    ///
    /// Each attempt waits at most one read timeout. A missing pong is
    /// reported as `Ok(false)`; only transport failures and a cancellation
    /// request, checked before every attempt, are errors.
    pub fn ping(&mut self) -> Result<bool> {
        let frame = CommandFrame::ping().build();
        let pong = [ESCAPE, DeviceStatus::Pong.code()];

        for attempt in 1..=self.config.ping_attempts {
            if (self.interrupted)() {
                warn!("Interrupted before ping {attempt}");
                return Err(Error::Interrupted);
            }
            self.transport.discard_input()?;
            self.transport.send(&frame)?;
            match self.transport.read_exact(pong.len()) {
                Ok(response) if response == pong => {
                    debug!("Pong after {attempt} attempt(s)");
                    self.transition(SessionState::Alive);
                    return Ok(true);
                },
                Ok(response) => trace!("Ping {attempt}: unexpected response {response:02X?}"),
                Err(Error::TransportTimeout { .. }) => trace!("Ping {attempt}: no response"),
                Err(e) => return Err(e),
            }
        }

        warn!(
            "No pong after {} ping attempts",
            self.config.ping_attempts
        );
        Ok(false)
    }

    fn ensure_alive(&mut self) -> Result<()> {
        if self.ping()? {
            Ok(())
        } else {
            Err(Error::LivenessTimeout {
                attempts: self.config.ping_attempts,
            })
        }
    }

    /// Sync, send one command, read its response.
    fn command(&mut self, frame: &CommandFrame) -> Result<Response> {
        self.transport.discard_input()?;

        let mut wire = CommandFrame::sync().build();
        wire.extend_from_slice(&frame.build());
        self.transport.send(&wire)?;

        let header = self.transport.read_exact(RESPONSE_HEADER_LEN)?;
        let status = decode_header([header[0], header[1]])?;
        let args = self.transport.read_unstuffed(status.args_len())?;
        trace!("{:?} -> {status}", frame.command());
        Ok(Response { status, args })
    }

    /// Write one page at `address`.
    pub fn write_page(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.require(
            "write a page",
            &[SessionState::Alive, SessionState::Flashing],
        )?;
        if data.len() != self.config.page_size {
            return Err(Error::InvalidPage {
                address,
                len: data.len(),
                expected: self.config.page_size,
            });
        }

        let response = self.command(&CommandFrame::write_page(address, data))?;
        match response.status {
            DeviceStatus::Ok => {
                trace!("Page {address:#010x} written");
                Ok(())
            },
            status => Err(Error::DeviceRejected { address, status }),
        }
    }

    /// Ask the device for the CRC of `[address, address + length)`.
    pub fn read_crc(&mut self, address: u32, length: u32) -> Result<u32> {
        self.require(
            "request a CRC",
            &[
                SessionState::Alive,
                SessionState::Flashing,
                SessionState::Verifying,
            ],
        )?;

        let response = self.command(&CommandFrame::crc_internal_flash(address, length))?;
        if response.status != DeviceStatus::CrcInternalFlash {
            return Err(Error::DeviceRejected {
                address,
                status: response.status,
            });
        }
        response.crc().ok_or(Error::TransportTimeout {
            expected: 4,
            received: response.args.len(),
        })
    }

    /// Compare the device CRC over `data.len()` bytes at `address` with a local CRC.
    pub fn verify_crc(&mut self, address: u32, data: &[u8]) -> Result<u32> {
        let length = u32::try_from(data.len()).map_err(|_| {
            Error::InvalidImage(format!("{} bytes exceeds a 32-bit length", data.len()))
        })?;
        let expected = self.config.crc.checksum(data);
        let actual = self.read_crc(address, length)?;
        if expected != actual {
            return Err(Error::VerificationFailed { expected, actual });
        }
        info!("CRC verified: {actual:#010x} over {length} bytes at {address:#010x}");
        Ok(actual)
    }

    /// Run `op` inside bootloader mode, always resetting back out afterwards.
    fn with_bootloader_mode<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let result = match self.enter_bootloader_mode() {
            Ok(()) => op(self),
            Err(e) => Err(e),
        };

        match (result, self.exit_bootloader_mode()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(exit_err)) => Err(exit_err),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(exit_err)) => {
                warn!("Failed to exit bootloader mode: {exit_err}");
                Err(e)
            },
        }
    }

    fn check_image(&self, image: &FirmwareImage, base: u32) -> Result<()> {
        if image.page_size() != self.config.page_size {
            return Err(Error::InvalidImage(format!(
                "image is aligned to {}-byte pages, session uses {}",
                image.page_size(),
                self.config.page_size
            )));
        }
        image.span(base)?;
        Ok(())
    }

    /// Enter bootloader mode, confirm the device answers, and exit again.
    pub fn check_alive(&mut self) -> Result<()> {
        self.with_bootloader_mode(Self::ensure_alive)
    }

    /// Flash `image` at `base` and verify it.
    pub fn flash(&mut self, image: &FirmwareImage, base: u32) -> Result<FlashStats> {
        self.flash_with_progress(image, base, |_, _| {})
    }

    /// Flash `image` at `base`, reporting `(pages_done, pages_total)` after each page.
    pub fn flash_with_progress<F>(
        &mut self,
        image: &FirmwareImage,
        base: u32,
        mut progress: F,
    ) -> Result<FlashStats>
    where
        F: FnMut(usize, usize),
    {
        self.check_image(image, base)?;
        self.with_bootloader_mode(|session| {
            session.ensure_alive()?;
            session.program(image, base, &mut progress)
        })
    }

    /// Compare the device's flash against `image` without writing.
    pub fn verify_image(&mut self, image: &FirmwareImage, base: u32) -> Result<u32> {
        self.check_image(image, base)?;
        self.with_bootloader_mode(|session| {
            session.ensure_alive()?;
            session.transition(SessionState::Verifying);
            session.verify_crc(base, image.as_bytes())
        })
    }

    fn program<F>(&mut self, image: &FirmwareImage, base: u32, progress: &mut F) -> Result<FlashStats>
    where
        F: FnMut(usize, usize),
    {
        let total = image.page_count();
        info!(
            "Flashing {} bytes ({total} pages) at {base:#010x}",
            image.len()
        );
        self.transition(SessionState::Flashing);

        let start = Instant::now();
        for page in image.pages(base) {
            if (self.interrupted)() {
                warn!("Interrupted before page {} of {total}", page.index + 1);
                return Err(Error::Interrupted);
            }
            self.write_page(page.address, page.data)?;
            progress(page.index + 1, total);
        }
        let elapsed = start.elapsed();
        info!(
            "Wrote {} bytes in {:.3} seconds",
            image.len(),
            elapsed.as_secs_f64()
        );

        self.transition(SessionState::Verifying);
        let crc = self.verify_crc(base, image.as_bytes())?;

        Ok(FlashStats {
            base_address: base,
            bytes_written: image.len(),
            pages: total,
            elapsed,
            crc,
        })
    }
}
