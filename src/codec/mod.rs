//! Entropy-coding stage: pluggable codecs behind one trait.
//!
//! Codecs are identified on disk by name inside the block's
//! compression-method string (`"zstd:19"`, `"lz4"`, `"storing"`, ...).
//! The name is the authoritative identity; the optional `:<level>` suffix
//! is informational for readers and only drives the encoder.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;
use std::io::{self, Read, Write};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecId {
    None,
    Zstd,
    Lz4,
    Brotli,
    Lzma,
}

impl CodecId {
    pub const ALL: [CodecId; 5] = [
        CodecId::None,
        CodecId::Zstd,
        CodecId::Lz4,
        CodecId::Brotli,
        CodecId::Lzma,
    ];

    /// On-disk name.  `None` is written as `storing`.
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None   => "storing",
            CodecId::Zstd   => "zstd",
            CodecId::Lz4    => "lz4",
            CodecId::Brotli => "brotli",
            CodecId::Lzma   => "lzma",
        }
    }

    /// Parse a codec name as written on disk or typed on the command line.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" | "storing" | "store" => Some(CodecId::None),
            "zstd"   => Some(CodecId::Zstd),
            "lz4"    => Some(CodecId::Lz4),
            "brotli" => Some(CodecId::Brotli),
            "lzma"   => Some(CodecId::Lzma),
            _        => None,
        }
    }

    /// Whether the level parameter means anything to this codec.
    pub fn takes_level(self) -> bool {
        matches!(self, CodecId::Zstd | CodecId::Brotli)
    }

    pub fn default_level(self) -> i32 {
        match self {
            CodecId::Zstd   => 3,
            CodecId::Brotli => 9,
            _               => 0,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One codec stage of a method string: codec plus encoder level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecStage {
    pub codec: CodecId,
    pub level: i32,
}

impl CodecStage {
    pub fn new(codec: CodecId, level: i32) -> Self {
        Self { codec, level }
    }

    /// Parse `name[:level]`.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(2, ':');
        let codec = CodecId::from_name(parts.next()?)?;
        let level = match parts.next() {
            Some(l) => l.parse().ok()?,
            None    => codec.default_level(),
        };
        Some(Self { codec, level })
    }
}

impl fmt::Display for CodecStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.codec.takes_level() {
            write!(f, "{}:{}", self.codec.name(), self.level)
        } else {
            f.write_str(self.codec.name())
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("{codec} compression failed: {msg}")]
    Compression { codec: CodecId, msg: String },
    #[error("{codec} decompression failed: {msg}")]
    Decompression { codec: CodecId, msg: String },
    #[error("{codec} output exceeds the declared {limit} bytes")]
    Oversized { codec: CodecId, limit: u64 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError>;
    /// Decompress at most `limit` bytes; larger output is an error, raised
    /// before more than `limit + 1` bytes are produced.
    fn decompress(&self, data: &[u8], limit: u64) -> Result<Vec<u8>, CodecError>;

    /// Rough working-set estimate for compressing `input_len` bytes, used by
    /// the memory pre-check.  Output buffer included.
    fn memory_estimate(&self, input_len: u64) -> u64 {
        input_len + input_len / 2 + 64 * 1024
    }
}

// ── Built-in codec implementations ──────────────────────────────────────────

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId { CodecId::None }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8], limit: u64) -> Result<Vec<u8>, CodecError> {
        if data.len() as u64 > limit {
            return Err(CodecError::Oversized { codec: CodecId::None, limit });
        }
        Ok(data.to_vec())
    }
    fn memory_estimate(&self, input_len: u64) -> u64 { input_len }
}

pub struct ZstdCodec;
impl Codec for ZstdCodec {
    fn codec_id(&self) -> CodecId { CodecId::Zstd }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        zstd::encode_all(data, level).map_err(|e| CodecError::Compression {
            codec: CodecId::Zstd,
            msg:   e.to_string(),
        })
    }
    fn decompress(&self, data: &[u8], limit: u64) -> Result<Vec<u8>, CodecError> {
        let fail = |e: io::Error| CodecError::Decompression { codec: CodecId::Zstd, msg: e.to_string() };
        let decoder = zstd::stream::read::Decoder::new(data).map_err(fail)?;
        read_limited(decoder, CodecId::Zstd, limit).map_err(|e| match e {
            CodecError::Io(io) => fail(io),
            other => other,
        })
    }
    fn memory_estimate(&self, input_len: u64) -> u64 {
        // Window tables grow with the level; 64 MiB covers level 19.
        input_len + input_len / 2 + 64 * 1024 * 1024
    }
}

pub struct Lz4Codec;
impl Codec for Lz4Codec {
    fn codec_id(&self) -> CodecId { CodecId::Lz4 }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        Ok(lz4_flex::compress_prepend_size(data))
    }
    fn decompress(&self, data: &[u8], limit: u64) -> Result<Vec<u8>, CodecError> {
        // The size prefix is checked before lz4_flex allocates for it.
        if data.len() >= 4 && u64::from(LittleEndian::read_u32(&data[..4])) > limit {
            return Err(CodecError::Oversized { codec: CodecId::Lz4, limit });
        }
        lz4_flex::decompress_size_prepended(data).map_err(|e| CodecError::Decompression {
            codec: CodecId::Lz4,
            msg:   e.to_string(),
        })
    }
}

pub struct BrotliCodec;
impl Codec for BrotliCodec {
    fn codec_id(&self) -> CodecId { CodecId::Brotli }
    fn compress(&self, data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
        let quality = level.clamp(0, 11) as u32;
        let mut out = Vec::new();
        {
            let mut w = brotli::CompressorWriter::new(&mut out, 4096, quality, 22);
            w.write_all(data).map_err(|e| CodecError::Compression {
                codec: CodecId::Brotli,
                msg:   e.to_string(),
            })?;
        }
        Ok(out)
    }
    fn decompress(&self, data: &[u8], limit: u64) -> Result<Vec<u8>, CodecError> {
        read_limited(brotli::Decompressor::new(data, 4096), CodecId::Brotli, limit).map_err(|e| match e {
            CodecError::Io(io) => CodecError::Decompression { codec: CodecId::Brotli, msg: io.to_string() },
            other => other,
        })
    }
    fn memory_estimate(&self, input_len: u64) -> u64 {
        input_len * 2 + 16 * 1024 * 1024
    }
}

pub struct LzmaCodec;
impl Codec for LzmaCodec {
    fn codec_id(&self) -> CodecId { CodecId::Lzma }
    fn compress(&self, data: &[u8], _: i32) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut io::Cursor::new(data), &mut out).map_err(|e| {
            CodecError::Compression { codec: CodecId::Lzma, msg: e.to_string() }
        })?;
        Ok(out)
    }
    fn decompress(&self, data: &[u8], limit: u64) -> Result<Vec<u8>, CodecError> {
        let mut out = LimitedWriter { buf: Vec::new(), limit };
        // The dictionary buffer grows by doubling up to the decoded size.
        let options = lzma_rs::decompress::Options {
            memlimit: Some(usize::try_from(limit.saturating_mul(2)).unwrap_or(usize::MAX).max(4096)),
            ..Default::default()
        };
        let result = lzma_rs::lzma_decompress_with_options(&mut io::Cursor::new(data), &mut out, &options);
        if out.buf.len() as u64 > limit {
            return Err(CodecError::Oversized { codec: CodecId::Lzma, limit });
        }
        result.map_err(|e| CodecError::Decompression { codec: CodecId::Lzma, msg: format!("{e:?}") })?;
        Ok(out.buf)
    }
}

/// Drain `reader`, failing once it yields more than `limit` bytes.
fn read_limited<R: Read>(reader: R, codec: CodecId, limit: u64) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    reader.take(limit.saturating_add(1)).read_to_end(&mut out)?;
    if out.len() as u64 > limit {
        return Err(CodecError::Oversized { codec, limit });
    }
    Ok(out)
}

/// Write sink that refuses to grow past `limit` bytes.
struct LimitedWriter {
    buf:   Vec<u8>,
    limit: u64,
}

impl Write for LimitedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.limit.saturating_add(1).saturating_sub(self.buf.len() as u64);
        if room == 0 {
            return Err(io::Error::new(io::ErrorKind::Other, "output limit reached"));
        }
        let n = data.len().min(usize::try_from(room).unwrap_or(usize::MAX));
        self.buf.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Resolve a CodecId to a built-in codec.
pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None   => Box::new(NoneCodec),
        CodecId::Zstd   => Box::new(ZstdCodec),
        CodecId::Lz4    => Box::new(Lz4Codec),
        CodecId::Brotli => Box::new(BrotliCodec),
        CodecId::Lzma   => Box::new(LzmaCodec),
    }
}
