//! Page-aligned application images.
//!
//! The bootloader writes internal flash one page at a time, so an image is
//! padded up to a whole number of pages before transfer:
//!
//! ```text
//! +---------------------+-----------+-------------------+
//! |   application       | 8 x 0x00  |  0xFF ... 0xFF    |
//! +---------------------+-----------+-------------------+
//! |   raw input         |  trailer  |  fill to page     |
//! +---------------------+-----------+-------------------+
//! ```
//!
//! The zero trailer marks the end of valid application data for tools that
//! scan flash. Fill uses the erased-flash value.

use crate::error::{Error, Result};
use log::debug;

/// Default internal-flash page size in bytes.
pub const PAGE_SIZE: usize = 512;

/// Value of erased flash, used for padding.
pub const FILL_BYTE: u8 = 0xFF;

/// Number of zero bytes appended after the application.
pub const TRAILER_LEN: usize = 8;

/// An application image padded to a whole number of pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    page_size: usize,
    raw_len: usize,
}

impl FirmwareImage {
    /// Append the zero trailer and pad to the default page size.
    pub fn prepare(raw: &[u8]) -> Result<Self> {
        Self::prepare_with_page_size(raw, PAGE_SIZE)
    }

    /// Append the zero trailer and pad to `page_size`.
    pub fn prepare_with_page_size(raw: &[u8], page_size: usize) -> Result<Self> {
        let mut data = Vec::with_capacity(raw.len() + TRAILER_LEN + page_size);
        data.extend_from_slice(raw);
        data.extend_from_slice(&[0u8; TRAILER_LEN]);
        Self::build(data, raw.len(), page_size)
    }

    /// Pad to the default page size without adding a trailer.
    pub fn padded(raw: &[u8]) -> Result<Self> {
        Self::padded_with_page_size(raw, PAGE_SIZE)
    }

    /// Pad to `page_size` without adding a trailer.
    pub fn padded_with_page_size(raw: &[u8], page_size: usize) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidImage("image is empty".into()));
        }
        Self::build(raw.to_vec(), raw.len(), page_size)
    }

    fn build(mut data: Vec<u8>, raw_len: usize, page_size: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(Error::InvalidImage("page size must be non-zero".into()));
        }
        if u32::try_from(data.len()).is_err() {
            return Err(Error::InvalidImage(format!(
                "image of {} bytes does not fit a 32-bit address space",
                data.len()
            )));
        }

        let remainder = data.len() % page_size;
        if remainder != 0 {
            data.resize(data.len() + page_size - remainder, FILL_BYTE);
        }

        debug!(
            "Prepared image: {raw_len} bytes -> {} bytes ({} pages of {page_size})",
            data.len(),
            data.len() / page_size
        );

        Ok(Self {
            data,
            page_size,
            raw_len,
        })
    }

    /// Padded image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Padded length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always false; preparation never yields an empty image.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Length of the application before trailer and padding.
    pub fn raw_len(&self) -> usize {
        self.raw_len
    }

    /// Page size the image is aligned to.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages.
    pub fn page_count(&self) -> usize {
        self.data.len() / self.page_size
    }

    /// Padded length as a 32-bit value, checked against `base`.
    pub fn span(&self, base: u32) -> Result<u32> {
        #[allow(clippy::cast_possible_truncation)] // Checked in build()
        let len = self.data.len() as u32;
        base.checked_add(len)
            .map(|_| len)
            .ok_or_else(|| {
                Error::InvalidImage(format!(
                    "{} bytes at {base:#010x} runs past the end of the address space",
                    self.data.len()
                ))
            })
    }

    /// Pages in ascending address order starting at `base`.
    ///
    /// Call [`span`](Self::span) first; addresses wrap otherwise.
    pub fn pages(&self, base: u32) -> impl Iterator<Item = Page<'_>> {
        let page_size = self.page_size;
        self.data
            .chunks(page_size)
            .enumerate()
            .map(move |(index, data)| {
                #[allow(clippy::cast_possible_truncation)]
                let offset = (index * page_size) as u32;
                Page {
                    index,
                    address: base.wrapping_add(offset),
                    data,
                }
            })
    }
}

/// One page of an image and its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page<'a> {
    /// Zero-based page index.
    pub index: usize,
    /// Absolute flash address.
    pub address: u32,
    /// Exactly one page of bytes.
    pub data: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_appends_trailer_and_pads() {
        let raw = vec![0x11u8; 1000];
        let image = FirmwareImage::prepare(&raw).unwrap();

        assert_eq!(image.len(), 1024);
        assert_eq!(&image.as_bytes()[..1000], raw.as_slice());
        assert_eq!(&image.as_bytes()[1000..1008], &[0u8; 8]);
        assert!(image.as_bytes()[1008..].iter().all(|&b| b == FILL_BYTE));
        assert_eq!(image.raw_len(), 1000);
        assert_eq!(image.page_count(), 2);
    }

    #[test]
    fn test_prepare_lengths_are_page_multiples() {
        for len in [0usize, 1, 7, 503, 504, 505, 511, 512, 1016, 4097] {
            let raw: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let image = FirmwareImage::prepare(&raw).unwrap();
            assert_eq!(image.len() % PAGE_SIZE, 0, "len {len}");
            assert_eq!(&image.as_bytes()[..len], raw.as_slice());
            assert_eq!(&image.as_bytes()[len..len + TRAILER_LEN], &[0u8; TRAILER_LEN]);
        }
    }

    #[test]
    fn test_no_padding_when_already_aligned() {
        let raw = vec![0xABu8; PAGE_SIZE - TRAILER_LEN];
        let image = FirmwareImage::prepare(&raw).unwrap();
        assert_eq!(image.len(), PAGE_SIZE);
        assert_eq!(image.as_bytes()[PAGE_SIZE - 1], 0x00);
    }

    #[test]
    fn test_padded_without_trailer() {
        let image = FirmwareImage::padded(&[0x01; 512]).unwrap();
        assert_eq!(image.len(), 512);
        let image = FirmwareImage::padded(&[0x01; 513]).unwrap();
        assert_eq!(image.len(), 1024);
        assert_eq!(image.as_bytes()[513], FILL_BYTE);
    }

    #[test]
    fn test_padded_rejects_empty() {
        assert!(matches!(
            FirmwareImage::padded(&[]),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_custom_page_size() {
        let image = FirmwareImage::prepare_with_page_size(&[1, 2, 3], 256).unwrap();
        assert_eq!(image.len(), 256);
        assert_eq!(image.page_size(), 256);
        assert!(FirmwareImage::prepare_with_page_size(&[1], 0).is_err());
    }

    #[test]
    fn test_page_addresses() {
        let image = FirmwareImage::prepare(&[0u8; 1500]).unwrap();
        let pages: Vec<_> = image.pages(0x30000).collect();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].address, 0x30000);
        assert_eq!(pages[1].address, 0x30200);
        assert_eq!(pages[2].address, 0x30400);
        assert!(pages.iter().all(|p| p.data.len() == PAGE_SIZE));
        assert_eq!(pages[2].index, 2);
    }

    #[test]
    fn test_span_checks_overflow() {
        let image = FirmwareImage::prepare(&[0u8; 10]).unwrap();
        assert_eq!(image.span(0x30000).unwrap(), 512);
        assert_eq!(image.span(u32::MAX - 1023).unwrap(), 512);
        assert!(matches!(
            image.span(u32::MAX - 100),
            Err(Error::InvalidImage(_))
        ));
    }
}
