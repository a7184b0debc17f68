//! Session footer: the last 24 bytes of a finalized archive.
//!
//! ```text
//! offset  size  field
//!      0     4  "ArCF"
//!      4     8  directory offset      (u64 LE)
//!     12     8  previous directory    (u64 LE, 0 = first session)
//!     20     4  CRC32 of bytes 0..20  (u32 LE)
//! ```
//!
//! Readers locate it by scanning backward from end of stream through the
//! trailing [`SCAN_WINDOW`] bytes for a signature whose CRC checks out.

use byteorder::{ByteOrder, LittleEndian};
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::error::{FormatError, Result};

pub const FOOTER_MAGIC: &[u8; 4] = b"ArCF";
pub const FOOTER_SIZE: usize = 24;
pub const SCAN_WINDOW: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Footer {
    pub directory_offset: u64,
    /// Directory of the previous session; 0 when there is none.
    pub prev_directory:   u64,
}

impl Footer {
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[..4].copy_from_slice(FOOTER_MAGIC);
        LittleEndian::write_u64(&mut buf[4..12], self.directory_offset);
        LittleEndian::write_u64(&mut buf[12..20], self.prev_directory);
        let crc = crc32fast::hash(&buf[..20]);
        LittleEndian::write_u32(&mut buf[20..24], crc);
        buf
    }

    /// Decode a candidate.  `None` when the magic or CRC does not match.
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < FOOTER_SIZE || &buf[..4] != FOOTER_MAGIC {
            return None;
        }
        if crc32fast::hash(&buf[..20]) != LittleEndian::read_u32(&buf[20..24]) {
            return None;
        }
        Some(Self {
            directory_offset: LittleEndian::read_u64(&buf[4..12]),
            prev_directory:   LittleEndian::read_u64(&buf[12..20]),
        })
    }

    pub fn write<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.to_bytes())
    }
}

/// Find the newest valid footer in the trailing window.
///
/// Returns the footer and its offset.  The directory it names must lie before
/// the footer itself, which rules out stray signatures inside payload bytes
/// that happen to carry a valid CRC.
pub fn locate<R: Read + Seek + ?Sized>(reader: &mut R) -> Result<(Footer, u64)> {
    let end = reader.seek(SeekFrom::End(0))?;
    let start = end.saturating_sub(SCAN_WINDOW);
    reader.seek(SeekFrom::Start(start))?;
    let mut tail = Vec::with_capacity((end - start) as usize);
    (&mut *reader).take(end - start).read_to_end(&mut tail)?;

    find_in(&tail, start).ok_or_else(|| FormatError::FooterNotFound(SCAN_WINDOW).into())
}

/// Scan `buf` (which starts at archive offset `base`) backward for a footer.
pub fn find_in(buf: &[u8], base: u64) -> Option<(Footer, u64)> {
    if buf.len() < FOOTER_SIZE {
        return None;
    }
    (0..=buf.len() - FOOTER_SIZE).rev().find_map(|i| {
        let footer = Footer::from_bytes(&buf[i..])?;
        let at = base + i as u64;
        (footer.directory_offset < at && footer.prev_directory < footer.directory_offset)
            .then_some((footer, at))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_layout() {
        let f = Footer { directory_offset: 0x1122, prev_directory: 7 };
        let b = f.to_bytes();
        assert_eq!(&b[..4], b"ArCF");
        assert_eq!(LittleEndian::read_u64(&b[4..12]), 0x1122);
        assert_eq!(Footer::from_bytes(&b), Some(f));
    }

    #[test]
    fn test_bad_crc_is_ignored() {
        let mut b = Footer { directory_offset: 100, prev_directory: 0 }.to_bytes();
        b[5] ^= 0xff;
        assert_eq!(Footer::from_bytes(&b), None);
    }

    #[test]
    fn test_locate_picks_last_footer() {
        let mut data = vec![0u8; 300];
        data.extend_from_slice(&Footer { directory_offset: 10, prev_directory: 0 }.to_bytes());
        data.extend_from_slice(&[1u8; 50]);
        let last_at = data.len() as u64;
        data.extend_from_slice(&Footer { directory_offset: 200, prev_directory: 10 }.to_bytes());

        let (f, at) = locate(&mut Cursor::new(data)).unwrap();
        assert_eq!(at, last_at);
        assert_eq!(f.directory_offset, 200);
    }

    #[test]
    fn test_missing_footer() {
        let err = locate(&mut Cursor::new(vec![0u8; 5000])).unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_footer_outside_window_is_not_found() {
        let mut data = vec![0u8; 100];
        data.extend_from_slice(&Footer { directory_offset: 10, prev_directory: 0 }.to_bytes());
        data.extend_from_slice(&vec![0u8; SCAN_WINDOW as usize]);
        assert!(locate(&mut Cursor::new(data)).is_err());
    }
}
