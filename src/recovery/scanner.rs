//! Directory-bypass recovery scanner.
//!
//! # How it works
//!
//! The scanner walks forward from the end of the archive header, parsing
//! each block descriptor and skipping its payload.  It does not need the
//! footer or the directory.  Descriptors carry no signature, so a candidate
//! only counts when its method strings parse and agree with its kind.
//! After a bad descriptor the scanner resyncs one byte at a time.
//!
//! Session footers met along the way are recorded; the newest one whose
//! directory still decodes is what [`ArchiveReader::open_recovering`] uses
//! after an interrupted append.
//!
//! ## Recovery quality
//!
//! | Quality | Description |
//! |---------|-------------|
//! | `Full` | All blocks intact, at least one footer found |
//! | `Partial` | Some blocks corrupt or truncated |
//! | `HeaderOnly` | Blocks survived but no footer, so entry names are lost |
//! | `Catastrophic` | Fewer than 50% of descriptors valid; results unreliable |
//!
//! ## Progress
//!
//! `scan()` takes an optional callback invoked after every block with
//! `(bytes_scanned, total_bytes)`.
//!
//! [`ArchiveReader::open_recovering`]: crate::io_stream::ArchiveReader::open_recovering

use serde::Serialize;
use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use crate::block::{finish_payload, unpack_payload, BlockKind, CompressionMethod, LocalDescriptor};
use crate::config::ArchiveConfig;
use crate::crypto::{EncryptionMethod, KeyCache};
use crate::error::Result;
use crate::footer::{Footer, FOOTER_MAGIC, FOOTER_SIZE};
use crate::io_stream::ArchiveWriter;
use crate::superblock::{ArchiveHeader, HEADER_SIZE};

/// Bytes read at each candidate position; comfortably holds a descriptor.
const PEEK_LEN: usize = 512;

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BlockHealth {
    /// Descriptor valid; payload fully present.
    Healthy,
    /// Descriptor valid but fewer bytes follow than `comp_size` declares.
    TruncatedPayload { declared: u64, available: u64 },
    /// A run of bytes that does not parse as a descriptor.
    BadDescriptor { skipped: u64 },
}

impl BlockHealth {
    pub fn is_usable(&self) -> bool {
        matches!(self, BlockHealth::Healthy)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScannedBlock {
    pub offset:     u64,
    pub descriptor: Option<LocalDescriptor>,
    pub health:     BlockHealth,
}

impl ScannedBlock {
    pub fn is_usable(&self) -> bool {
        self.health.is_usable() && self.descriptor.is_some()
    }

    fn kind(&self) -> Option<BlockKind> {
        self.descriptor.as_ref().map(|d| d.kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FooterRecord {
    pub offset: u64,
    pub footer: Footer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecoveryQuality {
    Full,
    Partial,
    HeaderOnly,
    Catastrophic,
}

#[derive(Debug, Serialize)]
pub struct RecoveryReport {
    pub header_ok:         bool,
    pub total_scanned:     usize,
    pub healthy_blocks:    usize,
    pub corrupt_blocks:    usize,
    pub truncated_blocks:  usize,
    pub bytes_scanned:     u64,
    pub block_log:         Vec<ScannedBlock>,
    /// Footers in file order; the last one is the newest session.
    pub footers:           Vec<FooterRecord>,
    /// Sum of `orig_size` over healthy data blocks.
    pub recoverable_bytes: u64,
    pub quality:           RecoveryQuality,
}

impl RecoveryReport {
    /// Percentage of scanned blocks that are healthy (0.0–100.0).
    pub fn health_pct(&self) -> f64 {
        if self.total_scanned == 0 {
            return 100.0;
        }
        self.healthy_blocks as f64 / self.total_scanned as f64 * 100.0
    }

    pub fn summary(&self) -> String {
        format!(
            "{:?} recovery: {}/{} blocks healthy ({:.1}%), {} session footer(s), {:.2} MiB recoverable",
            self.quality,
            self.healthy_blocks,
            self.total_scanned,
            self.health_pct(),
            self.footers.len(),
            self.recoverable_bytes as f64 / 1024.0 / 1024.0,
        )
    }
}

// ── Scanner ───────────────────────────────────────────────────────────────────

/// A descriptor counts only if its method strings parse and fit its kind.
fn plausible(desc: &LocalDescriptor) -> bool {
    let method_fits = match CompressionMethod::parse(&desc.comp_method) {
        Ok(CompressionMethod::Dedup { .. }) => desc.kind == BlockKind::Data,
        Ok(CompressionMethod::Plain(_)) => desc.kind == BlockKind::Directory,
        Err(_) => false,
    };
    let enc_fits = match desc.kind {
        BlockKind::Directory => desc.enc_method.is_empty(),
        BlockKind::Data => desc.enc_method.is_empty() || EncryptionMethod::parse(&desc.enc_method).is_ok(),
    };
    method_fits && enc_fits
}

enum Peek {
    Footer(Footer),
    Block(LocalDescriptor),
    Garbage,
}

fn peek(buf: &[u8]) -> Peek {
    if buf.starts_with(FOOTER_MAGIC) {
        if let Some(footer) = Footer::from_bytes(buf) {
            return Peek::Footer(footer);
        }
    }
    match LocalDescriptor::read(&mut Cursor::new(buf)) {
        Ok(desc) if plausible(&desc) => Peek::Block(desc),
        _ => Peek::Garbage,
    }
}

/// Scan an archive for recoverable blocks without using its directory.
///
/// `size_hint` is the archive length for progress reporting; 0 = seek to
/// find it.  Corrupt data never produces an error; it is reported as
/// [`BlockHealth`] entries.  Only I/O failures propagate.
pub fn scan<R, F>(reader: &mut R, size_hint: u64, mut progress: Option<&mut F>) -> io::Result<RecoveryReport>
where
    R: Read + Seek + ?Sized,
    F: FnMut(u64, u64),
{
    let end = if size_hint > 0 { size_hint } else { reader.seek(SeekFrom::End(0))? };
    reader.seek(SeekFrom::Start(0))?;
    let header_ok = ArchiveHeader::read(reader).is_ok();
    if !header_ok {
        log::warn!("archive header is damaged; scanning anyway");
    }

    let mut block_log = Vec::new();
    let mut footers = Vec::new();
    let mut healthy_blocks = 0usize;
    let mut corrupt_blocks = 0usize;
    let mut truncated_blocks = 0usize;
    let mut recoverable_bytes = 0u64;
    // Start of the bad run currently being skipped.
    let mut garbage_from: Option<u64> = None;

    let mut pos = HEADER_SIZE;
    let mut peek_buf = vec![0u8; PEEK_LEN];
    while pos < end {
        reader.seek(SeekFrom::Start(pos))?;
        let want = PEEK_LEN.min((end - pos) as usize);
        reader.read_exact(&mut peek_buf[..want])?;

        let found = peek(&peek_buf[..want]);
        if !matches!(found, Peek::Garbage) {
            if let Some(from) = garbage_from.take() {
                corrupt_blocks += 1;
                block_log.push(ScannedBlock {
                    offset:     from,
                    descriptor: None,
                    health:     BlockHealth::BadDescriptor { skipped: pos - from },
                });
            }
        }

        match found {
            Peek::Footer(footer) => {
                log::debug!("footer at {pos}: directory at {}", footer.directory_offset);
                footers.push(FooterRecord { offset: pos, footer });
                pos += FOOTER_SIZE as u64;
            }
            Peek::Garbage => {
                garbage_from.get_or_insert(pos);
                pos += 1;
                continue;
            }
            Peek::Block(desc) => {
                let payload_at = pos + desc.encoded_len();
                let available = end.saturating_sub(payload_at);
                let health = if available < desc.comp_size {
                    truncated_blocks += 1;
                    BlockHealth::TruncatedPayload { declared: desc.comp_size, available }
                } else {
                    healthy_blocks += 1;
                    if desc.kind == BlockKind::Data {
                        recoverable_bytes += desc.orig_size;
                    }
                    BlockHealth::Healthy
                };
                let next = payload_at + desc.comp_size.min(available);
                block_log.push(ScannedBlock { offset: pos, descriptor: Some(desc), health });
                pos = next;
            }
        }

        if let Some(cb) = progress.as_mut() {
            cb(pos, end);
        }
    }
    if let Some(from) = garbage_from {
        corrupt_blocks += 1;
        block_log.push(ScannedBlock {
            offset:     from,
            descriptor: None,
            health:     BlockHealth::BadDescriptor { skipped: end - from },
        });
    }

    let total_scanned = block_log.len();
    let quality = if total_scanned == 0 {
        RecoveryQuality::Catastrophic
    } else {
        let pct = healthy_blocks as f64 / total_scanned as f64;
        match (footers.is_empty(), pct) {
            (_, p) if p < 0.50 => RecoveryQuality::Catastrophic,
            (true, _) => RecoveryQuality::HeaderOnly,
            _ if healthy_blocks == total_scanned && header_ok => RecoveryQuality::Full,
            _ => RecoveryQuality::Partial,
        }
    };

    Ok(RecoveryReport {
        header_ok,
        total_scanned,
        healthy_blocks,
        corrupt_blocks,
        truncated_blocks,
        bytes_scanned: end,
        block_log,
        footers,
        recoverable_bytes,
        quality,
    })
}

/// Scan the archive at `path`.
pub fn scan_file(path: &std::path::Path) -> io::Result<RecoveryReport> {
    let mut f = std::fs::File::open(path)?;
    let size = f.metadata()?.len();
    scan::<_, fn(u64, u64)>(&mut f, size, None)
}

/// Copy every healthy data block of `src` that still decodes into a new
/// archive written to `dst`, one entry per block named
/// `recovered/block_<offset>`.  Useful when no directory survives.
///
/// Blocks that refer back into earlier blocks of their session decode only
/// while every block in between survived.
pub fn extract_recoverable<R, W>(
    src:      &mut R,
    dst:      W,
    password: Option<&str>,
    cfg:      ArchiveConfig,
) -> Result<(RecoveryReport, W)>
where
    R: Read + Seek,
    W: Write + Seek + Send + 'static,
{
    let report = scan::<_, fn(u64, u64)>(src, 0, None)?;
    let mut keys = KeyCache::new(password);
    let mut writer = ArchiveWriter::begin(dst, cfg)?;

    // Decoded data blocks of the current session, oldest first.
    let mut history: VecDeque<Vec<u8>> = VecDeque::new();
    let mut held = 0u64;
    let mut keep = 0u64;

    for sb in &report.block_log {
        let desc = match &sb.descriptor {
            Some(desc) if sb.is_usable() && desc.kind == BlockKind::Data => desc,
            // A gap or a directory ends the run of blocks that can refer back.
            _ => {
                history.clear();
                held = 0;
                continue;
            }
        };
        src.seek(SeekFrom::Start(sb.offset + desc.encoded_len()))?;
        let mut payload = vec![0u8; desc.comp_size as usize];
        src.read_exact(&mut payload)?;

        let decoded = unpack_payload(desc, &payload, &mut keys, sb.offset).and_then(|unpacked| {
            let reach = unpacked.reach(desc)?;
            keep = keep.max(reach + 2 * desc.orig_size);
            let segments: Vec<&[u8]> = history.iter().map(Vec::as_slice).collect();
            finish_payload(desc, unpacked, &segments, sb.offset)
        });
        match decoded {
            Ok(data) => {
                writer.add_bytes(&format!("recovered/block_{:016x}", sb.offset), &data, 0)?;
                held += data.len() as u64;
                history.push_back(data);
                while held > keep {
                    let Some(old) = history.pop_front() else { break };
                    held -= old.len() as u64;
                }
            }
            Err(e) => {
                log::warn!("block at {}: {e}; skipped", sb.offset);
                history.clear();
                held = 0;
            }
        }
    }

    let dst = writer.finalize()?;
    Ok((report, dst))
}
