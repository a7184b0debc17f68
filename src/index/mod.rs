//! Archive directory: block table plus file entries.
//!
//! One directory is written per write session as a zstd-compressed block
//! of kind `Directory`.  It fully replaces the previous session's directory;
//! the footer keeps a back-pointer to that one for recovery.
//!
//! # Binary layout
//! ```text
//! varint nblocks
//!   nblocks × (varint offset, varint comp_size, varint orig_size)
//! varint nfiles
//!   nfiles × (stringz name, varint size, varint mtime, u32 LE crc32,
//!             varint nextents, nextents × (varint block, varint offset, varint len))
//! u8     locked
//! stringz recovery
//! varint comment_len, comment bytes
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{self, Cursor, Read, Write};

use crate::error::{FormatError, Result};
use crate::varint::{eof_as, read_stringz, read_varint, write_stringz, write_varint};

/// Location and sizes of one block in the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub offset:    u64,
    pub comp_size: u64,
    pub orig_size: u64,
}

/// A byte range of one solid block belonging to an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Index into [`Directory::blocks`].
    pub block:  u64,
    pub offset: u64,
    pub len:    u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name:    String,
    pub size:    u64,
    /// Modification time, unix seconds.
    pub mtime:   u64,
    pub crc32:   u32,
    pub extents: Vec<Extent>,
}

/// What a caller sees when listing an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub name:  String,
    pub size:  u64,
    pub mtime: u64,
    pub crc32: u32,
}

impl From<&DirectoryEntry> for EntryInfo {
    fn from(e: &DirectoryEntry) -> Self {
        Self { name: e.name.clone(), size: e.size, mtime: e.mtime, crc32: e.crc32 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub blocks:   Vec<BlockInfo>,
    pub entries:  Vec<DirectoryEntry>,
    pub locked:   bool,
    pub recovery: String,
    pub comment:  String,
}

impl Directory {
    pub fn find(&self, name: &str) -> Option<&DirectoryEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn list(&self) -> Vec<EntryInfo> {
        self.entries.iter().map(EntryInfo::from).collect()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn total_compressed(&self) -> u64 {
        self.blocks.iter().map(|b| b.comp_size).sum()
    }

    /// Indices of entries that have at least one byte in `block`.
    pub fn entries_in_block(&self, block: u64) -> impl Iterator<Item = usize> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, e)| e.extents.iter().any(|x| x.block == block))
            .map(|(i, _)| i)
    }

    pub fn encode(&self) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        write_varint(&mut out, self.blocks.len() as u64)?;
        for b in &self.blocks {
            write_varint(&mut out, b.offset)?;
            write_varint(&mut out, b.comp_size)?;
            write_varint(&mut out, b.orig_size)?;
        }
        write_varint(&mut out, self.entries.len() as u64)?;
        for e in &self.entries {
            write_stringz(&mut out, &e.name)?;
            write_varint(&mut out, e.size)?;
            write_varint(&mut out, e.mtime)?;
            out.write_u32::<LittleEndian>(e.crc32)?;
            write_varint(&mut out, e.extents.len() as u64)?;
            for x in &e.extents {
                write_varint(&mut out, x.block)?;
                write_varint(&mut out, x.offset)?;
                write_varint(&mut out, x.len)?;
            }
        }
        out.write_u8(u8::from(self.locked))?;
        write_stringz(&mut out, &self.recovery)?;
        write_varint(&mut out, self.comment.len() as u64)?;
        out.write_all(self.comment.as_bytes())?;
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(data);
        let remaining = |cur: &Cursor<&[u8]>| data.len() as u64 - cur.position();

        // Every record takes at least one byte per field, which bounds the counts.
        let nblocks = read_varint(&mut cur)?;
        if nblocks > remaining(&cur) {
            return Err(FormatError::Corrupt(format!("block count {nblocks} exceeds directory size")).into());
        }
        let mut blocks = Vec::with_capacity(nblocks as usize);
        for _ in 0..nblocks {
            blocks.push(BlockInfo {
                offset:    read_varint(&mut cur)?,
                comp_size: read_varint(&mut cur)?,
                orig_size: read_varint(&mut cur)?,
            });
        }

        let nfiles = read_varint(&mut cur)?;
        if nfiles > remaining(&cur) {
            return Err(FormatError::Corrupt(format!("file count {nfiles} exceeds directory size")).into());
        }
        let mut entries = Vec::with_capacity(nfiles as usize);
        for _ in 0..nfiles {
            let name = read_stringz(&mut cur)?;
            let size = read_varint(&mut cur)?;
            let mtime = read_varint(&mut cur)?;
            let crc32 = cur.read_u32::<LittleEndian>().map_err(|e| eof_as(e, "directory entry"))?;
            let nextents = read_varint(&mut cur)?;
            if nextents > remaining(&cur) {
                return Err(FormatError::Corrupt(format!("{name}: extent count {nextents} is implausible")).into());
            }
            let mut extents = Vec::with_capacity(nextents as usize);
            for _ in 0..nextents {
                extents.push(Extent {
                    block:  read_varint(&mut cur)?,
                    offset: read_varint(&mut cur)?,
                    len:    read_varint(&mut cur)?,
                });
            }
            entries.push(DirectoryEntry { name, size, mtime, crc32, extents });
        }

        let locked = cur.read_u8().map_err(|e| eof_as(e, "directory trailer"))? != 0;
        let recovery = read_stringz(&mut cur)?;
        let comment_len = read_varint(&mut cur)?;
        if comment_len > remaining(&cur) {
            return Err(FormatError::Truncated("directory comment").into());
        }
        let mut comment = vec![0u8; comment_len as usize];
        cur.read_exact(&mut comment).map_err(|e| eof_as(e, "directory comment"))?;
        let comment = String::from_utf8(comment)
            .map_err(|_| FormatError::Corrupt("directory comment is not valid UTF-8".into()))?;
        if remaining(&cur) != 0 {
            return Err(FormatError::Corrupt(format!("{} trailing bytes after directory", remaining(&cur))).into());
        }

        let dir = Self { blocks, entries, locked, recovery, comment };
        dir.validate()?;
        Ok(dir)
    }

    /// Cross-check extents against the block table.
    pub fn validate(&self) -> Result<()> {
        for e in &self.entries {
            let mut covered = 0u64;
            for x in &e.extents {
                let block = self.blocks.get(x.block as usize).ok_or_else(|| {
                    FormatError::Corrupt(format!("{}: extent names missing block {}", e.name, x.block))
                })?;
                if x.offset.checked_add(x.len).map_or(true, |end| end > block.orig_size) {
                    return Err(FormatError::Corrupt(format!(
                        "{}: extent {}+{} overruns block {} ({} bytes)",
                        e.name, x.offset, x.len, x.block, block.orig_size
                    ))
                    .into());
                }
                covered += x.len;
            }
            if covered != e.size {
                return Err(FormatError::Corrupt(format!(
                    "{}: extents cover {covered} bytes, entry size is {}",
                    e.name, e.size
                ))
                .into());
            }
        }
        Ok(())
    }
}
