//! Simulated StormLoader device for tests.
//!
//! Parses host bytes with the same escape state machine as the firmware,
//! keeps an in-memory internal flash, and queues responses for the host to
//! read. Control lines follow the board wiring: DTR drives reset, RTS drives
//! the bootloader-select pin, and the select level is sampled when reset is
//! released.

use crate::error::Result;
use crate::port::Port;
use crate::protocol::crc::CrcAlgorithm;
use crate::protocol::frame::{Command, DeviceStatus, FrameDecoder, encode_response};
use crate::transport::ControlLine;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

pub(crate) const FLASH_SIZE: usize = 0x8_0000;
pub(crate) const PAGE: usize = 512;

/// How the simulated device misbehaves.
#[derive(Debug, Clone, Default)]
pub(crate) struct Faults {
    /// Ignore pings entirely.
    pub silent: bool,
    /// Ignore this many pings before answering.
    pub ignored_pings: usize,
    /// Answer a write to this address with this status.
    pub reject_write: Option<(u32, u8)>,
    /// Report this CRC instead of the real one.
    pub crc_override: Option<u32>,
    /// Emit this byte instead of the escape marker on page-write responses.
    pub corrupt_write_header: Option<u8>,
    /// Append junk after CRC responses, as the firmware does.
    pub crc_trailing_junk: bool,
    /// Deliver one byte per read, after this delay.
    pub read_delay: Option<Duration>,
    /// Fail the mode-select line while reset is held, which only the exit
    /// sequence does.
    pub fail_exit_lines: bool,
}

pub(crate) struct MockBootloader {
    rx: VecDeque<u8>,
    decoder: FrameDecoder,
    pub flash: Vec<u8>,
    pub faults: Faults,
    pub crc: CrcAlgorithm,
    pub commands: Vec<(u8, Vec<u8>)>,
    pub lines: Vec<(ControlLine, bool)>,
    pub pings_seen: usize,
    pub closed: bool,
    dtr: bool,
    rts: bool,
    in_bootloader: bool,
    timeout: Duration,
    baud: u32,
}

impl MockBootloader {
    pub fn new() -> Self {
        Self {
            rx: VecDeque::new(),
            decoder: FrameDecoder::new(),
            flash: vec![0xFF; FLASH_SIZE],
            faults: Faults::default(),
            crc: CrcAlgorithm::default(),
            commands: Vec::new(),
            lines: Vec::new(),
            pings_seen: 0,
            closed: false,
            dtr: false,
            rts: false,
            in_bootloader: false,
            timeout: Duration::from_millis(10),
            baud: crate::port::DEFAULT_BAUD,
        }
    }

    pub fn with_faults(faults: Faults) -> Self {
        Self {
            faults,
            ..Self::new()
        }
    }

    /// Device starts already sitting in bootloader mode.
    pub fn in_bootloader(mut self) -> Self {
        self.in_bootloader = true;
        self
    }

    pub fn is_in_bootloader(&self) -> bool {
        self.in_bootloader
    }

    /// Commands of the given opcode, in arrival order.
    pub fn commands_of(&self, command: Command) -> Vec<&[u8]> {
        self.commands
            .iter()
            .filter(|(op, _)| *op == command as u8)
            .map(|(_, args)| args.as_slice())
            .collect()
    }

    /// Queue raw bytes for the host, bypassing the protocol.
    pub fn push_raw(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    fn respond(&mut self, status: DeviceStatus, args: &[u8]) {
        self.rx.extend(encode_response(status, args));
    }

    fn handle(&mut self, opcode: u8, args: Vec<u8>) {
        self.commands.push((opcode, args.clone()));
        if !self.in_bootloader {
            return;
        }
        match Command::from_opcode(opcode) {
            Some(Command::Reset) => {},
            Some(Command::Ping) => {
                self.pings_seen += 1;
                if !self.faults.silent && self.pings_seen > self.faults.ignored_pings {
                    self.respond(DeviceStatus::Pong, &[]);
                }
            },
            Some(Command::WritePage) => self.write_page(&args),
            Some(Command::CrcInternalFlash) => self.crc_internal_flash(&args),
            None => self.respond(DeviceStatus::Unknown, &[]),
        }
    }

    fn write_page(&mut self, args: &[u8]) {
        if let Some(found) = self.faults.corrupt_write_header {
            self.rx.extend([found, DeviceStatus::Ok.code()]);
            return;
        }
        if args.len() != 4 + PAGE {
            self.respond(DeviceStatus::BadArguments, &[]);
            return;
        }
        let address = u32::from_le_bytes([args[0], args[1], args[2], args[3]]);
        if let Some((bad, status)) = self.faults.reject_write {
            if bad == address {
                self.respond(DeviceStatus::from(status), &[]);
                return;
            }
        }
        let start = address as usize;
        if start % PAGE != 0 || start + PAGE > FLASH_SIZE {
            self.respond(DeviceStatus::BadAddress, &[]);
            return;
        }
        self.flash[start..start + PAGE].copy_from_slice(&args[4..]);
        self.respond(DeviceStatus::Ok, &[]);
    }

    fn crc_internal_flash(&mut self, args: &[u8]) {
        if args.len() != 8 {
            self.respond(DeviceStatus::BadArguments, &[]);
            return;
        }
        let base = u32::from_le_bytes([args[0], args[1], args[2], args[3]]) as usize;
        let len = u32::from_le_bytes([args[4], args[5], args[6], args[7]]) as usize;
        if base + len > FLASH_SIZE {
            self.respond(DeviceStatus::BadAddress, &[]);
            return;
        }
        let crc = self
            .faults
            .crc_override
            .unwrap_or_else(|| self.crc.checksum(&self.flash[base..base + len]));
        self.respond(DeviceStatus::CrcInternalFlash, &crc.to_le_bytes());
        if self.faults.crc_trailing_junk {
            self.rx.extend([0x5A, 0xA5]);
        }
    }
}

impl Read for MockBootloader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let mut n = buf.len().min(self.rx.len());
        if let Some(delay) = self.faults.read_delay {
            std::thread::sleep(delay);
            n = n.min(1);
        }
        for (slot, b) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = b;
        }
        Ok(n)
    }
}

impl Write for MockBootloader {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for (opcode, args) in self.decoder.feed(buf) {
            self.handle(opcode, args);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockBootloader {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.rx.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.lines.push((ControlLine::Dtr, level));
        if self.dtr && !level {
            // Leaving reset: the select pin decides which image boots.
            self.in_bootloader = self.rts;
            self.decoder = FrameDecoder::new();
            self.rx.clear();
        }
        self.dtr = level;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        if self.faults.fail_exit_lines && self.dtr && !level {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "adapter unplugged").into());
        }
        self.lines.push((ControlLine::Rts, level));
        self.rts = level;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
