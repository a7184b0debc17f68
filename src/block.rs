//! Block framing: local descriptor plus payload.
//!
//! ```text
//! [kind u8][comp_size varint][orig_size varint][comp_method stringz]
//! [enc_method stringz][crc32 u32 LE][payload: comp_size bytes]
//! ```
//!
//! The CRC covers the *decompressed* payload, so it catches corruption that
//! survives every decoding stage.  Encryption, when present, is the outermost
//! layer; the codec runs inside it and the dedup op stream inside that.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::codec::{get_codec, CodecStage};
use crate::config::Method;
use crate::crypto::KeyCache;
use crate::dedup::stream;
use crate::error::{FormatError, Result};
use crate::varint::{eof_as, read_stringz, read_varint, varint_len, write_stringz, write_varint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Data      = 1,
    Directory = 2,
}

impl BlockKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(BlockKind::Data),
            2 => Some(BlockKind::Directory),
            _ => None,
        }
    }
}

// ── Compression method string ────────────────────────────────────────────────

/// Parsed compression-method string.
///
/// `dedup:m2+zstd:3` for data blocks, `zstd:19` for the directory,
/// `storing` when nothing was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Dedup { method: Method, stage: CodecStage },
    Plain(CodecStage),
}

impl CompressionMethod {
    pub fn parse(s: &str) -> std::result::Result<Self, FormatError> {
        let unknown = || FormatError::UnknownMethod(s.to_string());
        if let Some(rest) = s.strip_prefix("dedup:m") {
            let (num, stage) = rest.split_once('+').ok_or_else(unknown)?;
            let method = num.parse::<u8>().ok().and_then(|n| Method::try_from(n).ok());
            let method = method.ok_or_else(unknown)?;
            let stage = CodecStage::parse(stage).ok_or_else(unknown)?;
            Ok(CompressionMethod::Dedup { method, stage })
        } else {
            CodecStage::parse(s).map(CompressionMethod::Plain).ok_or_else(unknown)
        }
    }

    pub fn stage(&self) -> CodecStage {
        match *self {
            CompressionMethod::Dedup { stage, .. } | CompressionMethod::Plain(stage) => stage,
        }
    }
}

impl fmt::Display for CompressionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionMethod::Dedup { method, stage } => write!(f, "dedup:m{}+{stage}", method.number()),
            CompressionMethod::Plain(stage) => write!(f, "{stage}"),
        }
    }
}

// ── Local descriptor ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct LocalDescriptor {
    pub kind:        BlockKind,
    pub comp_size:   u64,
    pub orig_size:   u64,
    pub comp_method: String,
    /// Empty when the block is not encrypted.
    pub enc_method:  String,
    pub crc32:       u32,
}

impl LocalDescriptor {
    pub fn encoded_len(&self) -> u64 {
        (1 + varint_len(self.comp_size)
            + varint_len(self.orig_size)
            + self.comp_method.len()
            + 1
            + self.enc_method.len()
            + 1
            + 4) as u64
    }

    pub fn is_encrypted(&self) -> bool {
        !self.enc_method.is_empty()
    }

    pub fn write<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<u64> {
        writer.write_u8(self.kind as u8)?;
        write_varint(writer, self.comp_size)?;
        write_varint(writer, self.orig_size)?;
        write_stringz(writer, &self.comp_method)?;
        write_stringz(writer, &self.enc_method)?;
        writer.write_u32::<LittleEndian>(self.crc32)?;
        Ok(self.encoded_len())
    }

    pub fn read<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let kind_byte = reader.read_u8().map_err(|e| eof_as(e, "block descriptor"))?;
        let kind = BlockKind::from_u8(kind_byte).ok_or(FormatError::UnknownBlockKind(kind_byte))?;
        let comp_size = read_varint(reader)?;
        let orig_size = read_varint(reader)?;
        let comp_method = read_stringz(reader)?;
        let enc_method = read_stringz(reader)?;
        let crc32 = reader
            .read_u32::<LittleEndian>()
            .map_err(|e| eof_as(e, "block descriptor"))?;
        Ok(Self { kind, comp_size, orig_size, comp_method, enc_method, crc32 })
    }
}

// ── Encoded block ────────────────────────────────────────────────────────────

/// A block ready to be written: descriptor and final payload bytes.
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    pub descriptor: LocalDescriptor,
    pub payload:    Vec<u8>,
}

impl EncodedBlock {
    /// Write descriptor and payload.  Returns bytes written.
    pub fn write_to<W: Write + ?Sized>(&self, writer: &mut W) -> io::Result<u64> {
        let head = self.descriptor.write(writer)?;
        writer.write_all(&self.payload)?;
        Ok(head + self.payload.len() as u64)
    }
}

/// Compress `data` with a single codec stage, no dedup and no encryption.
pub fn encode_plain_block(kind: BlockKind, data: &[u8], stage: CodecStage) -> Result<EncodedBlock> {
    let payload = get_codec(stage.codec).compress(data, stage.level)?;
    Ok(EncodedBlock {
        descriptor: LocalDescriptor {
            kind,
            comp_size:   payload.len() as u64,
            orig_size:   data.len() as u64,
            comp_method: CompressionMethod::Plain(stage).to_string(),
            enc_method:  String::new(),
            crc32:       crc32fast::hash(data),
        },
        payload,
    })
}

/// A block payload with encryption and the codec stage removed.
pub struct Unpacked {
    method: CompressionMethod,
    bytes:  Vec<u8>,
}

impl Unpacked {
    /// Bytes before the block start its op stream refers to.
    pub fn reach(&self, desc: &LocalDescriptor) -> Result<u64> {
        match self.method {
            CompressionMethod::Dedup { .. } => Ok(stream::reach(&self.bytes, desc.orig_size)?),
            CompressionMethod::Plain(_) => Ok(0),
        }
    }
}

/// Decrypt and decompress a block payload.  Decompressed output is capped
/// at what `orig_size` allows, so a forged descriptor cannot inflate it.
pub fn unpack_payload(
    desc:    &LocalDescriptor,
    payload: &[u8],
    keys:    &mut KeyCache,
    offset:  u64,
) -> Result<Unpacked> {
    let method = CompressionMethod::parse(&desc.comp_method)?;

    let decrypted;
    let compressed: &[u8] = if desc.is_encrypted() {
        decrypted = keys.open(&desc.enc_method, payload, offset)?;
        &decrypted
    } else {
        payload
    };

    let limit = match method {
        CompressionMethod::Dedup { .. } => stream::max_stream_len(desc.orig_size),
        CompressionMethod::Plain(_) => desc.orig_size,
    };
    let bytes = get_codec(method.stage().codec).decompress(compressed, limit)?;
    Ok(Unpacked { method, bytes })
}

/// Expand an unpacked payload and verify its size and CRC.  `history` holds
/// the session bytes right before this block, oldest first.
pub fn finish_payload(
    desc:     &LocalDescriptor,
    unpacked: Unpacked,
    history:  &[&[u8]],
    offset:   u64,
) -> Result<Vec<u8>> {
    let data = match unpacked.method {
        CompressionMethod::Dedup { .. } => stream::decode_with_history(&unpacked.bytes, desc.orig_size, history)?,
        CompressionMethod::Plain(_) => unpacked.bytes,
    };

    if data.len() as u64 != desc.orig_size {
        return Err(FormatError::SizeMismatch {
            offset,
            expected: desc.orig_size,
            actual:   data.len() as u64,
        }
        .into());
    }
    let actual = crc32fast::hash(&data);
    if actual != desc.crc32 {
        return Err(FormatError::CrcMismatch { offset, descriptor: Box::new(desc.clone()), actual }.into());
    }
    Ok(data)
}

/// Undo every layer of a self-contained block payload and verify its CRC.
///
/// `offset` is the block's position in the archive, used in error reports.
pub fn decode_payload(
    desc:    &LocalDescriptor,
    payload: &[u8],
    keys:    &mut KeyCache,
    offset:  u64,
) -> Result<Vec<u8>> {
    let unpacked = unpack_payload(desc, payload, keys, offset)?;
    finish_payload(desc, unpacked, &[], offset)
}

/// Read the descriptor and raw payload of the block at `offset`.
pub fn read_block_at<R: Read + Seek + ?Sized>(reader: &mut R, offset: u64) -> Result<(LocalDescriptor, Vec<u8>)> {
    reader.seek(SeekFrom::Start(offset))?;
    let desc = LocalDescriptor::read(reader)?;
    let mut payload = Vec::new();
    (&mut *reader).take(desc.comp_size).read_to_end(&mut payload)?;
    if (payload.len() as u64) < desc.comp_size {
        return Err(FormatError::Truncated("block payload").into());
    }
    Ok((desc, payload))
}
