//! StormLoader framing: escape-based byte stuffing.
//!
//! Commands travel as their argument bytes followed by a two-byte
//! terminator. Any literal escape byte inside the arguments is doubled.
//!
//! ```text
//! Command:
//! +--------------------------+--------+--------+
//! |   Args (escaped)         | 0xFC   | opcode |
//! +--------------------------+--------+--------+
//!
//! Response:
//! +--------+--------+--------------------------+
//! | 0xFC   | status |   Args (escaped)         |
//! +--------+--------+--------------------------+
//! ```
//!
//! The device parser only acts on `0xFC <opcode>` pairs, so a sync preamble
//! (`0x00 0xFC 0x05`) puts it back on a frame boundary whatever state a
//! previous malformed frame left it in.

use crate::error::{Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fmt;

/// Escape byte that introduces an opcode or status, doubled when literal.
pub const ESCAPE: u8 = 0xFC;

/// Bytes that reset the device's receive buffer.
pub const SYNC_PREAMBLE: [u8; 3] = [0x00, ESCAPE, Command::Reset as u8];

/// Length of a response header (escape + status).
pub const RESPONSE_HEADER_LEN: usize = 2;

/// Length of the CRC argument in a CRC response.
pub const CRC_RESPONSE_ARGS_LEN: usize = 4;

/// Bootloader command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Liveness probe, answered with pong.
    Ping = 0x01,
    /// Reset the receive buffer.
    Reset = 0x05,
    /// Write one page of internal flash.
    WritePage = 0x07,
    /// CRC over a range of internal flash.
    CrcInternalFlash = 0x15,
}

impl Command {
    /// Map a raw opcode back to a known command.
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x01 => Some(Self::Ping),
            0x05 => Some(Self::Reset),
            0x07 => Some(Self::WritePage),
            0x15 => Some(Self::CrcInternalFlash),
            _ => None,
        }
    }
}

/// Status byte reported by the device in a response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    /// Receive buffer overflowed.
    Overflow,
    /// Answer to a ping.
    Pong,
    /// Address out of range or misaligned.
    BadAddress,
    /// Flash controller reported an error.
    InternalError,
    /// Wrong argument length for the command.
    BadArguments,
    /// Command succeeded.
    Ok,
    /// Opcode not understood.
    Unknown,
    /// External flash transfer timed out.
    Timeout,
    /// CRC over internal flash follows.
    CrcInternalFlash,
    /// Status code this host does not know.
    Unrecognized(u8),
}

impl DeviceStatus {
    /// Raw status code.
    pub fn code(self) -> u8 {
        match self {
            Self::Overflow => 0x10,
            Self::Pong => 0x11,
            Self::BadAddress => 0x12,
            Self::InternalError => 0x13,
            Self::BadArguments => 0x14,
            Self::Ok => 0x15,
            Self::Unknown => 0x16,
            Self::Timeout => 0x17,
            Self::CrcInternalFlash => 0x23,
            Self::Unrecognized(code) => code,
        }
    }

    /// Number of argument bytes that follow this status.
    pub fn args_len(self) -> usize {
        match self {
            Self::CrcInternalFlash => CRC_RESPONSE_ARGS_LEN,
            _ => 0,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Overflow => "OVERFLOW",
            Self::Pong => "PONG",
            Self::BadAddress => "BADADDR",
            Self::InternalError => "INTERROR",
            Self::BadArguments => "BADARGS",
            Self::Ok => "OK",
            Self::Unknown => "UNKNOWN",
            Self::Timeout => "XFTIMEOUT",
            Self::CrcInternalFlash => "CRCIF",
            Self::Unrecognized(_) => "UNRECOGNIZED",
        }
    }
}

impl From<u8> for DeviceStatus {
    fn from(code: u8) -> Self {
        match code {
            0x10 => Self::Overflow,
            0x11 => Self::Pong,
            0x12 => Self::BadAddress,
            0x13 => Self::InternalError,
            0x14 => Self::BadArguments,
            0x15 => Self::Ok,
            0x16 => Self::Unknown,
            0x17 => Self::Timeout,
            0x23 => Self::CrcInternalFlash,
            other => Self::Unrecognized(other),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.name(), self.code())
    }
}

/// Append `bytes` to `out`, doubling every escape byte.
pub fn stuff_into(out: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(b);
    }
}

/// Encode a command: stuffed arguments followed by `[ESCAPE, opcode]`.
pub fn encode(command: Command, args: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(args.len() + args.len() / 64 + 2);
    stuff_into(&mut buf, args);
    buf.push(ESCAPE);
    buf.push(command as u8);
    buf
}

/// Encode a response the way the device does: `[ESCAPE, status]` then stuffed arguments.
pub fn encode_response(status: DeviceStatus, args: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(RESPONSE_HEADER_LEN + args.len());
    buf.push(ESCAPE);
    buf.push(status.code());
    stuff_into(&mut buf, args);
    buf
}

/// A decoded device response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Status from the header.
    pub status: DeviceStatus,
    /// Unstuffed arguments.
    pub args: Vec<u8>,
}

impl Response {
    /// Interpret the arguments as a little-endian CRC32.
    pub fn crc(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.args.get(..CRC_RESPONSE_ARGS_LEN)?.try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }
}

/// Check a response header and return its status.
pub fn decode_header(header: [u8; RESPONSE_HEADER_LEN]) -> Result<DeviceStatus> {
    if header[0] != ESCAPE {
        return Err(Error::Framing {
            expected: ESCAPE,
            found: header[0],
        });
    }
    Ok(DeviceStatus::from(header[1]))
}

/// Decode a complete response buffer.
///
/// Arguments after the header are unstuffed; a dangling single escape at the
/// end is treated as a truncated frame.
pub fn decode(bytes: &[u8]) -> Result<Response> {
    if bytes.len() < RESPONSE_HEADER_LEN {
        return Err(Error::TransportTimeout {
            expected: RESPONSE_HEADER_LEN,
            received: bytes.len(),
        });
    }
    let status = decode_header([bytes[0], bytes[1]])?;

    let mut args = Vec::with_capacity(bytes.len() - RESPONSE_HEADER_LEN);
    let mut rest = bytes[RESPONSE_HEADER_LEN..].iter().copied();
    while let Some(b) = rest.next() {
        if b == ESCAPE {
            match rest.next() {
                Some(ESCAPE) => args.push(ESCAPE),
                Some(other) => {
                    return Err(Error::Framing {
                        expected: ESCAPE,
                        found: other,
                    });
                },
                None => {
                    return Err(Error::TransportTimeout {
                        expected: bytes.len() + 1,
                        received: bytes.len(),
                    });
                },
            }
        } else {
            args.push(b);
        }
    }

    Ok(Response { status, args })
}

/// Incremental command parser, the receiving half of [`encode`].
///
/// Feeds on raw bytes and yields `(opcode, args)` whenever an escape is
/// followed by anything other than a second escape.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    args: Vec<u8>,
    escaped: bool,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one byte; returns a completed frame when a terminator is seen.
    pub fn push(&mut self, b: u8) -> Option<(u8, Vec<u8>)> {
        if self.escaped {
            self.escaped = false;
            if b == ESCAPE {
                self.args.push(ESCAPE);
                return None;
            }
            return Some((b, std::mem::take(&mut self.args)));
        }
        if b == ESCAPE {
            self.escaped = true;
        } else {
            self.args.push(b);
        }
        None
    }

    /// Push a slice; returns every frame completed along the way.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }

    /// Bytes received since the last terminator.
    pub fn pending(&self) -> &[u8] {
        &self.args
    }
}

/// Command frame builder.
#[derive(Debug)]
pub struct CommandFrame {
    command: Command,
    args: Vec<u8>,
}

impl CommandFrame {
    /// Create a frame with no arguments.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            args: Vec::new(),
        }
    }

    /// Two-byte ping: `[0xFC, 0x01]`.
    pub fn ping() -> Self {
        Self::new(Command::Ping)
    }

    /// Sync preamble as a frame: a throwaway argument byte, then reset.
    pub fn sync() -> Self {
        Self {
            command: Command::Reset,
            args: vec![0x00],
        }
    }

    /// Write one page.
    ///
    /// Layout: 4-byte LE address, then the page data.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn write_page(address: u32, data: &[u8]) -> Self {
        let mut frame = Self::new(Command::WritePage);
        frame.args.reserve(4 + data.len());
        frame.args.write_u32::<LittleEndian>(address).unwrap();
        frame.args.extend_from_slice(data);
        frame
    }

    /// CRC over `[address, address + length)` of internal flash.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn crc_internal_flash(address: u32, length: u32) -> Self {
        let mut frame = Self::new(Command::CrcInternalFlash);
        frame.args.write_u32::<LittleEndian>(address).unwrap();
        frame.args.write_u32::<LittleEndian>(length).unwrap();
        frame
    }

    /// Build the wire bytes.
    pub fn build(&self) -> Vec<u8> {
        encode(self.command, &self.args)
    }

    /// Get the command.
    pub fn command(&self) -> Command {
        self.command
    }
}
