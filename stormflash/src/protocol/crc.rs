//! CRC32 over firmware images, matching the bootloader's internal-flash CRC.

use crc::{CRC_32_CKSUM, CRC_32_ISO_HDLC, Crc};
use std::fmt;
use std::str::FromStr;

const ISO_HDLC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CKSUM: Crc<u32> = Crc::<u32>::new(&CRC_32_CKSUM);

/// CRC32 parameterisation used to check a transfer.
///
/// Both variants use polynomial `0x04C11DB7` and a final XOR of `0xFFFFFFFF`.
/// They differ in bit order and in the effective register seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum CrcAlgorithm {
    /// Reflected CRC-32 as computed by the bootloader's `crc32(0, ..)`.
    #[default]
    IsoHdlc,
    /// Non-reflected CRC-32, register seeded with zero.
    Cksum,
}

impl CrcAlgorithm {
    /// Compute the checksum of `data`.
    pub fn checksum(self, data: &[u8]) -> u32 {
        match self {
            Self::IsoHdlc => ISO_HDLC.checksum(data),
            Self::Cksum => CKSUM.checksum(data),
        }
    }

    /// Name accepted by [`FromStr`].
    pub fn name(self) -> &'static str {
        match self {
            Self::IsoHdlc => "iso-hdlc",
            Self::Cksum => "cksum",
        }
    }
}

impl fmt::Display for CrcAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CrcAlgorithm {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "iso-hdlc" | "crc32" | "zlib" => Ok(Self::IsoHdlc),
            "cksum" | "posix" => Ok(Self::Cksum),
            other => Err(crate::Error::Config(format!(
                "unknown CRC algorithm '{other}' (expected iso-hdlc or cksum)"
            ))),
        }
    }
}

/// CRC32 with the bootloader's default algorithm.
pub fn crc32(data: &[u8]) -> u32 {
    CrcAlgorithm::default().checksum(data)
}
