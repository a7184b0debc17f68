//! Archive header: the first bytes of every archive.
//!
//! ```text
//! offset 0  "ArC\x01"   signature
//! offset 4  u8          format version
//! ```
//!
//! Everything else (block table, directory location) lives at the end of the
//! stream, so the header never needs to be patched after writing.

use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use crate::error::{FormatError, Result};
use crate::varint::eof_as;

pub const MAGIC: &[u8; 4] = b"ArC\x01";
pub const VERSION: u8 = 1;
/// Offset of the first block.
pub const HEADER_SIZE: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub version: u8,
}

impl Default for ArchiveHeader {
    fn default() -> Self {
        Self { version: VERSION }
    }
}

impl ArchiveHeader {
    pub fn write<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(MAGIC)?;
        writer.write_u8(self.version)?;
        Ok(())
    }

    pub fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(|e| eof_as(e, "archive header"))?;
        if &magic != MAGIC {
            return Err(FormatError::BadSignature(magic).into());
        }
        let version = reader.read_u8().map_err(|e| eof_as(e, "archive header"))?;
        if version != VERSION {
            return Err(FormatError::UnsupportedVersion(version).into());
        }
        Ok(Self { version })
    }
}
