//! Serial transport with bootloader control lines.
//!
//! Owns the port for the lifetime of a session. Besides bounded reads and
//! writes it drives the two modem-control outputs wired to the MCU:
//!
//! - **reset**: held asserted to keep the chip in reset
//! - **mode select**: sampled at reset release; asserted boots the bootloader
//!
//! The hold and startup delays below follow the chip's reset timing and are
//! not configurable.

use crate::error::{Error, Result};
use crate::port::{DEFAULT_TIMEOUT, Port};
use crate::protocol::frame::ESCAPE;
use log::{debug, trace};
use std::fmt;
use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

/// How long reset is held before release.
pub const RESET_HOLD: Duration = Duration::from_millis(100);

/// How long the bootloader needs after reset release to sample the select pin.
pub const BOOTLOADER_STARTUP: Duration = Duration::from_millis(500);

/// A modem-control output of the serial adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLine {
    /// Data Terminal Ready.
    Dtr,
    /// Request To Send.
    Rts,
}

impl fmt::Display for ControlLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dtr => write!(f, "DTR"),
            Self::Rts => write!(f, "RTS"),
        }
    }
}

/// Which output drives which MCU pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlLines {
    /// Line wired to the reset pin.
    pub reset: ControlLine,
    /// Line wired to the bootloader-select pin.
    pub mode_select: ControlLine,
}

impl Default for ControlLines {
    fn default() -> Self {
        Self {
            reset: ControlLine::Dtr,
            mode_select: ControlLine::Rts,
        }
    }
}

impl ControlLines {
    /// Swap the two lines, for adapters wired the other way round.
    #[must_use]
    pub fn swapped(self) -> Self {
        Self {
            reset: self.mode_select,
            mode_select: self.reset,
        }
    }
}

/// Port plus control-line mapping and per-call read deadline.
pub struct Transport<P: Port> {
    port: P,
    lines: ControlLines,
    read_timeout: Duration,
}

impl<P: Port> Transport<P> {
    /// Wrap a port with the default line mapping and read timeout.
    pub fn new(port: P) -> Result<Self> {
        Self::with_config(port, ControlLines::default(), DEFAULT_TIMEOUT)
    }

    /// Wrap a port with an explicit line mapping and read timeout.
    pub fn with_config(mut port: P, lines: ControlLines, read_timeout: Duration) -> Result<Self> {
        if lines.reset == lines.mode_select {
            return Err(Error::Config(format!(
                "reset and mode-select cannot share {}",
                lines.reset
            )));
        }
        port.set_timeout(read_timeout)?;
        Ok(Self {
            port,
            lines,
            read_timeout,
        })
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Consume the transport and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Per-call read timeout.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    fn set_line(&mut self, line: ControlLine, level: bool) -> Result<()> {
        match line {
            ControlLine::Dtr => self.port.set_dtr(level),
            ControlLine::Rts => self.port.set_rts(level),
        }
    }

    /// Drive the reset pin.
    pub fn assert_reset(&mut self, asserted: bool) -> Result<()> {
        trace!("reset ({}) -> {asserted}", self.lines.reset);
        self.set_line(self.lines.reset, asserted)
    }

    /// Drive the bootloader-select pin.
    pub fn assert_mode_select(&mut self, asserted: bool) -> Result<()> {
        trace!("mode select ({}) -> {asserted}", self.lines.mode_select);
        self.set_line(self.lines.mode_select, asserted)
    }

    /// Reset the chip with the select pin asserted so it stays in the bootloader.
    pub fn enter_bootloader_mode(&mut self) -> Result<()> {
        debug!("Entering bootloader mode on {}", self.port.name());
        self.assert_reset(true)?;
        self.assert_mode_select(true)?;
        thread::sleep(RESET_HOLD);
        self.assert_reset(false)?;
        thread::sleep(BOOTLOADER_STARTUP);
        self.assert_mode_select(false)?;
        Ok(())
    }

    /// Reset the chip with the select pin released so the application boots.
    pub fn exit_bootloader_mode(&mut self) -> Result<()> {
        debug!("Exiting bootloader mode on {}", self.port.name());
        self.assert_reset(true)?;
        self.assert_mode_select(false)?;
        thread::sleep(RESET_HOLD);
        self.assert_reset(false)?;
        Ok(())
    }

    /// Write and flush.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        trace!("TX {} bytes: {:02X?}", bytes.len(), &bytes[..bytes.len().min(16)]);
        self.port.write_all_bytes(bytes)
    }

    /// Drop bytes left over from an earlier response.
    pub fn discard_input(&mut self) -> Result<()> {
        self.port.clear_buffers()
    }

    /// Read exactly `n` bytes before the per-call deadline.
    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.read_timeout;
        self.read_until(n, deadline)
    }

    fn read_until(&mut self, n: usize, deadline: Instant) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;

        while filled < n {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(k) => filled += k,
                Err(e) if e.kind() == ErrorKind::Interrupted => {},
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => break,
                Err(e) => return Err(Error::Io(e)),
            }
            if filled < n && Instant::now() >= deadline {
                break;
            }
        }

        if filled < n {
            trace!("RX short read: {filled}/{n} bytes");
            return Err(Error::TransportTimeout {
                expected: n,
                received: filled,
            });
        }
        trace!("RX {n} bytes: {:02X?}", &buf[..n.min(16)]);
        Ok(buf)
    }

    /// Read `n` logical bytes, collapsing doubled escapes.
    ///
    /// The whole read shares one deadline, however the bytes trickle in.
    pub fn read_unstuffed(&mut self, n: usize) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.read_timeout;
        let mut out = Vec::with_capacity(n);
        while out.len() < n {
            let b = self.read_byte(deadline, n, out.len())?;
            if b == ESCAPE {
                let next = self.read_byte(deadline, n, out.len())?;
                if next != ESCAPE {
                    return Err(Error::Framing {
                        expected: ESCAPE,
                        found: next,
                    });
                }
            }
            out.push(b);
        }
        Ok(out)
    }

    fn read_byte(&mut self, deadline: Instant, expected: usize, received: usize) -> Result<u8> {
        if Instant::now() >= deadline {
            return Err(Error::TransportTimeout { expected, received });
        }
        match self.read_until(1, deadline) {
            Ok(b) => Ok(b[0]),
            Err(Error::TransportTimeout { .. }) => Err(Error::TransportTimeout { expected, received }),
            Err(e) => Err(e),
        }
    }

    /// Close the underlying port.
    pub fn close(&mut self) -> Result<()> {
        self.port.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockBootloader;

    fn transport(mock: MockBootloader) -> Transport<MockBootloader> {
        Transport::new(mock).unwrap()
    }

    #[test]
    fn test_enter_bootloader_sequence() {
        let mut t = transport(MockBootloader::new());
        let start = Instant::now();
        t.enter_bootloader_mode().unwrap();
        assert!(start.elapsed() >= RESET_HOLD + BOOTLOADER_STARTUP);

        assert_eq!(
            t.port().lines,
            vec![
                (ControlLine::Dtr, true),
                (ControlLine::Rts, true),
                (ControlLine::Dtr, false),
                (ControlLine::Rts, false),
            ]
        );
        assert!(t.port().is_in_bootloader());
    }

    #[test]
    fn test_exit_bootloader_sequence() {
        let mut t = transport(MockBootloader::new().in_bootloader());
        t.exit_bootloader_mode().unwrap();

        assert_eq!(
            t.port().lines,
            vec![
                (ControlLine::Dtr, true),
                (ControlLine::Rts, false),
                (ControlLine::Dtr, false),
            ]
        );
        assert!(!t.port().is_in_bootloader());
    }

    #[test]
    fn test_swapped_lines() {
        let lines = ControlLines::default().swapped();
        let mut t =
            Transport::with_config(MockBootloader::new(), lines, Duration::from_millis(50)).unwrap();
        t.assert_reset(true).unwrap();
        t.assert_mode_select(true).unwrap();
        assert_eq!(
            t.port().lines,
            vec![(ControlLine::Rts, true), (ControlLine::Dtr, true)]
        );
    }

    #[test]
    fn test_same_line_rejected() {
        let lines = ControlLines {
            reset: ControlLine::Dtr,
            mode_select: ControlLine::Dtr,
        };
        let result = Transport::with_config(MockBootloader::new(), lines, DEFAULT_TIMEOUT);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_read_timeout_sets_port() {
        let t = Transport::with_config(
            MockBootloader::new(),
            ControlLines::default(),
            Duration::from_millis(42),
        )
        .unwrap();
        assert_eq!(t.port().timeout(), Duration::from_millis(42));
        assert_eq!(t.read_timeout(), Duration::from_millis(42));
    }

    #[test]
    fn test_short_read_is_timeout() {
        let mut mock = MockBootloader::new();
        mock.push_raw(&[0xFC]);
        let mut t = transport(mock);
        let err = t.read_exact(2).unwrap_err();
        assert!(matches!(
            err,
            Error::TransportTimeout {
                expected: 2,
                received: 1
            }
        ));
    }

    #[test]
    fn test_read_unstuffed_collapses_escapes() {
        let mut mock = MockBootloader::new();
        mock.push_raw(&[0x01, 0xFC, 0xFC, 0x02, 0x03]);
        let mut t = transport(mock);
        assert_eq!(t.read_unstuffed(3).unwrap(), vec![0x01, 0xFC, 0x02]);
        assert_eq!(t.read_exact(1).unwrap(), vec![0x03]);
    }

    #[test]
    fn test_read_unstuffed_rejects_lone_escape() {
        let mut mock = MockBootloader::new();
        mock.push_raw(&[0xFC, 0x15]);
        let mut t = transport(mock);
        assert!(matches!(
            t.read_unstuffed(1),
            Err(Error::Framing { found: 0x15, .. })
        ));
    }

    #[test]
    fn test_read_unstuffed_shares_one_deadline() {
        let mut mock = MockBootloader::new();
        mock.faults.read_delay = Some(Duration::from_millis(30));
        mock.push_raw(&[0x78, 0x56, 0x34, 0x12]);
        let mut t =
            Transport::with_config(mock, ControlLines::default(), Duration::from_millis(50))
                .unwrap();

        match t.read_unstuffed(4) {
            Err(Error::TransportTimeout { expected, received }) => {
                assert_eq!(expected, 4);
                assert!(received < 4);
            },
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_read_unstuffed_with_slow_bytes_inside_deadline() {
        let mut mock = MockBootloader::new();
        mock.faults.read_delay = Some(Duration::from_millis(5));
        mock.push_raw(&[0x78, 0xFC, 0xFC, 0x12]);
        let mut t =
            Transport::with_config(mock, ControlLines::default(), Duration::from_millis(500))
                .unwrap();
        assert_eq!(t.read_unstuffed(3).unwrap(), vec![0x78, 0xFC, 0x12]);
    }

    #[test]
    fn test_discard_input() {
        let mut mock = MockBootloader::new();
        mock.push_raw(&[0xAA, 0xBB]);
        let mut t = transport(mock);
        t.discard_input().unwrap();
        assert!(t.read_exact(1).is_err());
    }

    #[test]
    fn test_close() {
        let mut t = transport(MockBootloader::new());
        t.close().unwrap();
        assert!(t.into_port().closed);
    }
}
