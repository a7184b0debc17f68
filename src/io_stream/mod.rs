//! Write and read sessions over any seekable byte stream.
//!
//! # Writer
//! [`ArchiveWriter`] accepts files one at a time and packs their bytes into
//! solid blocks of `solid_block_size` bytes.  A full block is handed to the
//! background [`Pipeline`]; the caller keeps reading input while workers
//! chunk, deduplicate, compress and encrypt earlier blocks.  Only the
//! directory is held in memory.  `finalize()` writes it as one zstd block
//! followed by the footer.
//!
//! # Append
//! [`ArchiveWriter::append`] reopens a finalized archive, carries its block
//! table and entries forward and writes new blocks after the old footer.  The
//! new footer links back to the previous directory.
//!
//! # Reader
//! [`ArchiveReader`] reads the header, locates the footer in the trailing
//! window and decodes the directory.  No block is touched until an entry is
//! requested.  Decoded blocks are cached for as long as later blocks can
//! still refer to them: one block for per-block dictionaries, the reach of
//! the op streams seen so far for a session dictionary.

pub mod input;

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::block::{
    decode_payload, encode_plain_block, finish_payload, read_block_at, unpack_payload, BlockKind, LocalDescriptor,
    Unpacked,
};
use crate::codec::{CodecId, CodecStage};
use crate::config::ArchiveConfig;
use crate::crypto::{EncryptionContext, KdfParams, KeyCache};
use crate::dedup::memory::{MemoryEstimate, MemoryPlan};
use crate::error::{ArcError, FormatError, Result};
use crate::footer::{self, Footer, FOOTER_SIZE};
use crate::index::{Directory, DirectoryEntry, EntryInfo, Extent};
use crate::pipeline::solid::{BlockBuffer, SolidBlock};
use crate::pipeline::{CancellationToken, Pipeline, PipelineOutcome};
use crate::recovery::scanner;
use crate::superblock::ArchiveHeader;
use input::InputData;

/// Codec stage for directory blocks.
pub const DIRECTORY_STAGE: CodecStage = CodecStage { codec: CodecId::Zstd, level: 9 };

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct ArchiveWriter<W: Write + Seek + Send + 'static> {
    cfg:            Arc<ArchiveConfig>,
    pipeline:       Option<Pipeline<W>>,
    cancel:         CancellationToken,
    plan:           MemoryPlan,
    current:        Option<SolidBlock>,
    next_seq:       u64,
    /// Directory carried over from the previous session (empty for a new archive).
    previous:       Directory,
    prev_directory: u64,
    /// Entries of this session; extent block numbers are session sequence numbers.
    entries:        Vec<DirectoryEntry>,
    scratch:        Vec<u8>,
}

impl<W: Write + Seek + Send + 'static> ArchiveWriter<W> {
    /// Start a new archive at offset 0 of `sink`.
    pub fn begin(mut sink: W, cfg: ArchiveConfig) -> Result<Self> {
        cfg.validate()?;
        sink.seek(SeekFrom::Start(0))?;
        ArchiveHeader::default().write(&mut sink)?;
        Self::start(sink, cfg, Directory::default(), 0)
    }

    fn start(sink: W, cfg: ArchiveConfig, previous: Directory, prev_directory: u64) -> Result<Self> {
        cfg.validate()?;
        let plan = MemoryEstimate::for_config(&cfg).check(&cfg)?;

        // Argon2 runs here, before any worker exists.
        let encryption = match &cfg.password {
            Some(password) => {
                let kdf = KdfParams { iterations: cfg.kdf_iterations, memory_kib: cfg.kdf_memory_kib };
                Some(Arc::new(EncryptionContext::new(password.expose(), kdf)?))
            }
            None => None,
        };

        let cfg = Arc::new(cfg);
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::start(sink, Arc::clone(&cfg), encryption, cancel.clone())?;
        log::info!(
            "write session: method {} ({:?}), {}, solid blocks of {} KiB, {} workers{}",
            cfg.method.number(),
            cfg.method,
            cfg.codec_stage(),
            cfg.solid_block_size >> 10,
            cfg.worker_threads(),
            if cfg.password.is_some() { ", encrypted" } else { "" }
        );

        Ok(Self {
            cfg,
            pipeline: Some(pipeline),
            cancel,
            plan,
            current: None,
            next_seq: 0,
            previous,
            prev_directory,
            entries: Vec::new(),
            scratch: Vec::new(),
        })
    }

    /// Token that cancels this session from any thread.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.cfg
    }

    /// Add one entry read to end from `source`, stamped with the current time.
    /// A name already added in this session is replaced.
    pub fn add_file<R: Read>(&mut self, name: &str, source: R) -> Result<EntryInfo> {
        self.add_entry(name, source, unix_now())
    }

    pub fn add_entry<R: Read>(&mut self, name: &str, mut source: R, mtime: u64) -> Result<EntryInfo> {
        let name = normalize_name(name)?;
        let mut buf = std::mem::take(&mut self.scratch);
        buf.resize(self.cfg.buf_size.min(self.cfg.solid_block_size), 0);

        let mut hasher = crc32fast::Hasher::new();
        let mut size = 0u64;
        let mut extents = Vec::new();
        let result = loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e.into()),
            };
            hasher.update(&buf[..n]);
            size += n as u64;
            if let Err(e) = self.feed(&buf[..n], &mut extents) {
                break Err(e);
            }
        };
        self.scratch = buf;
        result?;
        self.finish_entry(name, size, mtime, hasher.finalize(), extents)
    }

    /// Add an entry whose bytes are already in memory.
    pub fn add_bytes(&mut self, name: &str, data: &[u8], mtime: u64) -> Result<EntryInfo> {
        let name = normalize_name(name)?;
        let mut extents = Vec::new();
        self.feed(data, &mut extents)?;
        self.finish_entry(name, data.len() as u64, mtime, crc32fast::hash(data), extents)
    }

    /// Add a file, or every file below a directory in name order.  Entry
    /// names are relative to the parent of `path`.  Returns the entries added.
    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> Result<Vec<EntryInfo>> {
        let path = path.as_ref();
        let root = path.parent().unwrap_or(Path::new(""));
        let mut added = Vec::new();
        self.add_tree(root, path, &mut added)?;
        Ok(added)
    }

    fn add_tree(&mut self, root: &Path, path: &Path, added: &mut Vec<EntryInfo>) -> Result<()> {
        let meta = fs::metadata(path)?;
        if meta.is_dir() {
            let mut children = fs::read_dir(path)?
                .map(|e| e.map(|e| e.path()))
                .collect::<io::Result<Vec<_>>>()?;
            children.sort();
            for child in children {
                self.add_tree(root, &child, added)?;
            }
            return Ok(());
        }

        let name = entry_name(root, path)?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        let info = if self.cfg.use_mmap {
            let data = InputData::map(path)?;
            self.add_bytes(&name, data.as_slice(), mtime)?
        } else {
            self.add_entry(&name, File::open(path)?, mtime)?
        };
        log::debug!("added {} ({} bytes)", info.name, info.size);
        added.push(info);
        Ok(())
    }

    // ── Block accumulation ───────────────────────────────────────────────────

    fn new_block(&mut self) -> Result<SolidBlock> {
        let buffer = match self.plan {
            MemoryPlan::Heap => BlockBuffer::heap(),
            MemoryPlan::Spill => BlockBuffer::spilled(&self.cfg, self.cfg.solid_block_size)?,
        };
        let block = SolidBlock::new(self.next_seq, buffer);
        self.next_seq += 1;
        Ok(block)
    }

    fn current_block(&mut self) -> Result<&mut SolidBlock> {
        let block = match self.current.take() {
            Some(block) => block,
            None => self.new_block()?,
        };
        Ok(self.current.insert(block))
    }

    /// Append `data` to the open block, sealing each block that fills up.
    fn feed(&mut self, mut data: &[u8], extents: &mut Vec<Extent>) -> Result<()> {
        let limit = self.cfg.solid_block_size;
        while !data.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(ArcError::Cancelled);
            }
            let block = self.current_block()?;
            let take = (limit - block.len()).min(data.len());
            let extent = Extent { block: block.seq, offset: block.len() as u64, len: take as u64 };
            block.push(&data[..take])?;
            let full = block.len() >= limit;
            push_extent(extents, extent);
            data = &data[take..];
            if full {
                self.seal_current()?;
            }
        }
        Ok(())
    }

    fn finish_entry(
        &mut self,
        name:        String,
        size:        u64,
        mtime:       u64,
        crc32:       u32,
        mut extents: Vec<Extent>,
    ) -> Result<EntryInfo> {
        if extents.is_empty() {
            // Empty files still point at a block so they survive the
            // flushed-blocks filter applied on cancellation.
            let block = self.current_block()?;
            extents.push(Extent { block: block.seq, offset: block.len() as u64, len: 0 });
        }

        let mut seal = false;
        if let (Some(last), Some(block)) = (extents.last(), self.current.as_mut()) {
            if block.seq == last.block {
                block.files += 1;
                seal = self.cfg.solid_block_files.is_some_and(|n| block.files >= n);
            }
        }

        // Same rule as across sessions: the newer entry wins.  Its
        // predecessor's bytes stay in their block, unreferenced.
        if let Some(i) = self.entries.iter().position(|e| e.name == name) {
            log::info!("{name}: replaces an entry added earlier in this session");
            self.entries.remove(i);
        }
        let entry = DirectoryEntry { name, size, mtime, crc32, extents };
        let info = EntryInfo::from(&entry);
        self.entries.push(entry);
        if seal {
            self.seal_current()?;
        }
        Ok(info)
    }

    fn seal_current(&mut self) -> Result<()> {
        let Some(block) = self.current.take() else { return Ok(()) };
        let submitted = self.pipeline.as_ref().is_some_and(|p| p.submit(block));
        if submitted {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(ArcError::Cancelled);
        }
        // A worker or the writer failed; collect its error.
        Err(match self.pipeline.take().map(Pipeline::finish) {
            Some(Ok(PipelineOutcome { error: Some(e), .. })) | Some(Err(e)) => e,
            _ => session_aborted(),
        })
    }

    // ── Finalize ─────────────────────────────────────────────────────────────

    /// Flush the open block, wait for the pipeline and write directory plus
    /// footer.  Returns the sink positioned after the footer.
    ///
    /// After cancellation the directory lists only entries whose bytes were
    /// flushed in full, and the result is `Err(Cancelled)`.
    pub fn finalize(mut self) -> Result<W> {
        if let Some(block) = self.current.take() {
            if !block.is_empty() || block.files > 0 {
                if let Some(p) = &self.pipeline {
                    p.submit(block);
                }
            }
        }
        let pipeline = self.pipeline.take().ok_or_else(session_aborted)?;
        let PipelineOutcome { mut sink, flushed, error } = pipeline.finish()?;
        let cancelled = match error {
            None => false,
            Some(ArcError::Cancelled) => true,
            Some(e) => return Err(e),
        };

        let complete = flushed.len() as u64;
        let base = self.previous.blocks.len() as u64;
        let mut session: Vec<DirectoryEntry> = Vec::with_capacity(self.entries.len());
        for mut entry in self.entries.drain(..) {
            if entry.extents.iter().any(|x| x.block >= complete) {
                log::warn!("{}: not fully written before cancellation, left out", entry.name);
                continue;
            }
            for x in &mut entry.extents {
                x.block += base;
            }
            session.push(entry);
        }

        let mut dir = std::mem::take(&mut self.previous);
        {
            let replaced: HashSet<&str> = session.iter().map(|e| e.name.as_str()).collect();
            dir.entries.retain(|e| !replaced.contains(e.name.as_str()));
        }
        dir.entries.extend(session);
        dir.blocks.extend(flushed);
        dir.locked |= self.cfg.locked;
        if !self.cfg.comment.is_empty() {
            dir.comment = self.cfg.comment.clone();
        }
        if !self.cfg.recovery.is_empty() {
            dir.recovery = self.cfg.recovery.clone();
        }

        let directory_offset = sink.stream_position()?;
        let block = encode_plain_block(BlockKind::Directory, &dir.encode()?, DIRECTORY_STAGE)?;
        block.write_to(&mut sink)?;
        Footer { directory_offset, prev_directory: self.prev_directory }.write(&mut sink)?;
        sink.flush()?;

        log::info!(
            "finalized: {} entries, {} blocks, {} -> {} bytes, directory at {directory_offset}",
            dir.entries.len(),
            dir.blocks.len(),
            dir.total_size(),
            dir.total_compressed()
        );
        if cancelled {
            return Err(ArcError::Cancelled);
        }
        Ok(sink)
    }
}

impl<W: Read + Write + Seek + Send + 'static> ArchiveWriter<W> {
    /// Reopen a finalized archive for another write session.
    pub fn append(mut sink: W, cfg: ArchiveConfig) -> Result<Self> {
        cfg.validate()?;
        sink.seek(SeekFrom::Start(0))?;
        ArchiveHeader::read(&mut sink)?;
        let (footer, _) = footer::locate(&mut sink)?;
        let previous = read_directory(&mut sink, footer.directory_offset)?;
        if previous.locked {
            return Err(ArcError::Locked);
        }
        let end = sink.seek(SeekFrom::End(0))?;
        log::info!(
            "appending after {} entries in {} blocks at offset {end}",
            previous.entries.len(),
            previous.blocks.len()
        );
        Self::start(sink, cfg, previous, footer.directory_offset)
    }
}

fn session_aborted() -> ArcError {
    ArcError::Io(io::Error::new(io::ErrorKind::Other, "write session already aborted"))
}

fn push_extent(extents: &mut Vec<Extent>, next: Extent) {
    if let Some(last) = extents.last_mut() {
        if last.block == next.block && last.offset + last.len == next.offset {
            last.len += next.len;
            return;
        }
    }
    extents.push(next);
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs())
}

/// Archive names use `/` separators and never climb out of the extraction root.
fn normalize_name(name: &str) -> Result<String> {
    let cleaned = name.replace('\\', "/");
    let parts: Vec<&str> = cleaned.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    if parts.is_empty() || parts.contains(&"..") || cleaned.contains('\0') {
        return Err(ArcError::Config(format!("invalid entry name {name:?}")));
    }
    Ok(parts.join("/"))
}

fn entry_name(root: &Path, path: &Path) -> Result<String> {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    normalize_name(&parts.join("/"))
}

/// Read and decode the directory block at `offset`.
pub fn read_directory<R: Read + Seek + ?Sized>(reader: &mut R, offset: u64) -> Result<Directory> {
    let (desc, payload) = read_block_at(reader, offset)?;
    if desc.kind != BlockKind::Directory {
        return Err(FormatError::Corrupt(format!("block at {offset} is not a directory")).into());
    }
    let bytes = decode_payload(&desc, &payload, &mut KeyCache::new(None), offset)?;
    Directory::decode(&bytes)
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Outcome of [`ArchiveReader::extract_all`]: one line per entry.
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub extracted: Vec<(String, u64)>,
    pub failed:    Vec<(String, ArcError)>,
}

impl ExtractReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of [`ArchiveReader::verify`].
#[derive(Debug, Default)]
pub struct VerifyReport {
    pub blocks_ok:   usize,
    pub bad_blocks:  Vec<(u64, ArcError)>,
    pub entries_ok:  usize,
    pub bad_entries: Vec<(String, ArcError)>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.bad_blocks.is_empty() && self.bad_entries.is_empty()
    }
}

pub struct ArchiveReader<R: Read + Seek> {
    reader:    R,
    directory: Directory,
    footer:    Footer,
    footer_at: u64,
    keys:      KeyCache,
    /// Position of each block in the concatenated decoded stream.
    starts:    Vec<u64>,
    cache:     BTreeMap<u64, Vec<u8>>,
    /// Decoded bytes worth keeping: a block, its reach and one block of slack.
    keep:      u64,
}

impl<R: Read + Seek> ArchiveReader<R> {
    pub fn open(mut reader: R, password: Option<&str>) -> Result<Self> {
        let (footer, footer_at, directory) = load(&mut reader)?;
        Ok(Self::assemble(reader, password, footer, footer_at, directory))
    }

    /// Like [`open`](Self::open), but when no valid footer sits at the end
    /// (an interrupted append) fall back to the newest footer a forward scan
    /// finds.
    pub fn open_recovering(mut reader: R, password: Option<&str>) -> Result<Self> {
        let err = match load(&mut reader) {
            Ok((footer, at, dir)) => return Ok(Self::assemble(reader, password, footer, at, dir)),
            Err(e) if e.is_format() => e,
            Err(e) => return Err(e),
        };
        log::warn!("{err}; scanning for an earlier session");
        let report = scanner::scan::<_, fn(u64, u64)>(&mut reader, 0, None)?;
        for found in report.footers.iter().rev() {
            match read_directory(&mut reader, found.footer.directory_offset) {
                Ok(dir) => {
                    log::warn!("recovered session whose footer is at offset {}", found.offset);
                    return Ok(Self::assemble(reader, password, found.footer, found.offset, dir));
                }
                Err(e) => log::debug!("footer at {} unusable: {e}", found.offset),
            }
        }
        Err(err)
    }

    fn assemble(reader: R, password: Option<&str>, footer: Footer, footer_at: u64, directory: Directory) -> Self {
        log::debug!(
            "opened archive: {} entries, {} blocks, directory at {}",
            directory.entries.len(),
            directory.blocks.len(),
            footer.directory_offset
        );
        let starts = directory
            .blocks
            .iter()
            .scan(0u64, |at, b| {
                let start = *at;
                *at += b.orig_size;
                Some(start)
            })
            .collect();
        Self {
            reader,
            directory,
            footer,
            footer_at,
            keys: KeyCache::new(password),
            starts,
            cache: BTreeMap::new(),
            keep: 0,
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn footer(&self) -> Footer {
        self.footer
    }

    pub fn footer_offset(&self) -> u64 {
        self.footer_at
    }

    pub fn list(&self) -> Vec<EntryInfo> {
        self.directory.list()
    }

    /// Footers of every session, newest first, following the back-pointers.
    pub fn sessions(&mut self) -> Result<Vec<Footer>> {
        let mut chain = vec![self.footer];
        let mut prev = self.footer.prev_directory;
        while prev != 0 {
            let (desc, _) = read_block_at(&mut self.reader, prev)?;
            let at = prev + desc.encoded_len() + desc.comp_size;
            self.reader.seek(SeekFrom::Start(at))?;
            let mut buf = [0u8; FOOTER_SIZE];
            self.reader.read_exact(&mut buf)?;
            let footer = Footer::from_bytes(&buf)
                .filter(|f| f.directory_offset == prev)
                .ok_or_else(|| FormatError::Corrupt(format!("no footer after directory at {prev}")))?;
            chain.push(footer);
            prev = footer.prev_directory;
        }
        Ok(chain)
    }

    /// Decoded contents of block `index`.
    pub fn block_data(&mut self, index: u64) -> Result<&[u8]> {
        if !self.cache.contains_key(&index) {
            self.decode_chain(index)?;
            self.evict(index);
        }
        Ok(self.cache.get(&index).map(Vec::as_slice).unwrap_or_default())
    }

    fn unpack_block(&mut self, index: u64) -> Result<(LocalDescriptor, Unpacked, u64)> {
        let info = *self
            .directory
            .blocks
            .get(index as usize)
            .ok_or_else(|| FormatError::Corrupt(format!("block {index} is not in the block table")))?;
        let (desc, payload) = read_block_at(&mut self.reader, info.offset)?;
        if desc.kind != BlockKind::Data || desc.comp_size != info.comp_size || desc.orig_size != info.orig_size {
            return Err(FormatError::Corrupt(format!(
                "block {index} at {}: descriptor disagrees with the block table",
                info.offset
            ))
            .into());
        }
        let unpacked = unpack_payload(&desc, &payload, &mut self.keys, info.offset)?;
        Ok((desc, unpacked, info.offset))
    }

    /// Decode block `index` and every uncached earlier block its op stream
    /// needs, oldest first.
    fn decode_chain(&mut self, index: u64) -> Result<()> {
        let mut pending = Vec::new();
        let mut need_from = u64::MAX;
        let mut j = index;
        loop {
            if !self.cache.contains_key(&j) {
                let (desc, unpacked, offset) = self.unpack_block(j)?;
                let reach = unpacked.reach(&desc)?;
                let start = self.starts[j as usize];
                if reach > start {
                    return Err(FormatError::Corrupt(format!(
                        "block {j} refers to {reach} bytes before the start of the archive"
                    ))
                    .into());
                }
                need_from = need_from.min(start - reach);
                self.keep = self.keep.max(reach + 2 * desc.orig_size);
                pending.push((j, desc, unpacked, reach, offset));
            }
            if j == 0 || need_from >= self.starts[j as usize] {
                break;
            }
            j -= 1;
        }
        if pending.len() > 1 {
            log::debug!("block {index}: decoding {} blocks it refers back to", pending.len() - 1);
        }
        for (j, desc, unpacked, reach, offset) in pending.into_iter().rev() {
            let data = {
                let history = self.history_before(j, reach);
                finish_payload(&desc, unpacked, &history, offset)?
            };
            self.cache.insert(j, data);
        }
        Ok(())
    }

    /// Cached blocks ending right before block `index`, covering `reach` bytes.
    fn history_before(&self, index: u64, reach: u64) -> Vec<&[u8]> {
        let mut segments = Vec::new();
        let mut covered = 0u64;
        let mut j = index;
        while covered < reach && j > 0 {
            j -= 1;
            let Some(seg) = self.cache.get(&j) else { break };
            covered += seg.len() as u64;
            segments.push(seg.as_slice());
        }
        segments.reverse();
        segments
    }

    /// Drop the oldest cached blocks beyond what later blocks can reach.
    fn evict(&mut self, keep_index: u64) {
        let mut total: u64 = self.cache.values().map(|d| d.len() as u64).sum();
        while total > self.keep {
            let Some(&oldest) = self.cache.keys().find(|&&k| k != keep_index) else { break };
            if let Some(d) = self.cache.remove(&oldest) {
                total -= d.len() as u64;
            }
        }
    }

    /// Stream one entry into `sink`, checking its CRC.  Returns bytes written.
    pub fn extract_entry<S: Write + ?Sized>(&mut self, name: &str, sink: &mut S) -> Result<u64> {
        let entry = self
            .directory
            .find(name)
            .cloned()
            .ok_or_else(|| ArcError::NotFound(name.to_string()))?;

        let mut hasher = crc32fast::Hasher::new();
        let mut written = 0u64;
        for x in entry.extents.iter().filter(|x| x.len > 0) {
            let data = self.block_data(x.block)?;
            let bytes = usize::try_from(x.offset)
                .ok()
                .zip(x.offset.checked_add(x.len).and_then(|end| usize::try_from(end).ok()))
                .and_then(|(a, b)| data.get(a..b))
                .ok_or_else(|| FormatError::Corrupt(format!("extent of {name} lies outside block {}", x.block)))?;
            hasher.update(bytes);
            sink.write_all(bytes)?;
            written += x.len;
        }

        let actual = hasher.finalize();
        if actual != entry.crc32 {
            return Err(FormatError::Corrupt(format!(
                "{name}: CRC mismatch (stored {:08x}, computed {actual:08x})",
                entry.crc32
            ))
            .into());
        }
        Ok(written)
    }

    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.extract_entry(name, &mut out)?;
        Ok(out)
    }

    /// Extract every entry below `dest`.  A failing entry is reported and
    /// does not stop the others.
    pub fn extract_all<P: AsRef<Path>>(&mut self, dest: P) -> Result<ExtractReport> {
        let dest = dest.as_ref();
        fs::create_dir_all(dest)?;
        let entries: Vec<(String, u64)> = self.directory.entries.iter().map(|e| (e.name.clone(), e.mtime)).collect();

        let mut report = ExtractReport::default();
        for (name, mtime) in entries {
            match self.extract_to(dest, &name, mtime) {
                Ok(n) => report.extracted.push((name, n)),
                Err(e) => {
                    log::error!("{name}: {e}");
                    report.failed.push((name, e));
                }
            }
        }
        Ok(report)
    }

    fn extract_to(&mut self, dest: &Path, name: &str, mtime: u64) -> Result<u64> {
        let path = safe_join(dest, name)
            .ok_or_else(|| FormatError::Corrupt(format!("entry name {name:?} escapes the destination")))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = BufWriter::new(File::create(&path)?);
        let written = match self.extract_entry(name, &mut out) {
            Ok(n) => n,
            Err(e) => {
                drop(out);
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };
        let file = out.into_inner().map_err(|e| e.into_error())?;
        file.set_modified(UNIX_EPOCH + Duration::from_secs(mtime))?;
        Ok(written)
    }

    /// Decode every block and re-check every entry CRC.
    pub fn verify(&mut self) -> VerifyReport {
        let mut report = VerifyReport::default();
        for index in 0..self.directory.blocks.len() as u64 {
            match self.block_data(index) {
                Ok(_) => report.blocks_ok += 1,
                Err(e) => {
                    let hit = self.directory.entries_in_block(index).count();
                    log::warn!("block {index} is damaged ({e}); {hit} entries have data in it");
                    report.bad_blocks.push((index, e));
                }
            }
        }
        let names: Vec<String> = self.directory.entries.iter().map(|e| e.name.clone()).collect();
        for name in names {
            match self.extract_entry(&name, &mut io::sink()) {
                Ok(_) => report.entries_ok += 1,
                Err(e) => report.bad_entries.push((name, e)),
            }
        }
        report
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

fn load<R: Read + Seek>(reader: &mut R) -> Result<(Footer, u64, Directory)> {
    reader.seek(SeekFrom::Start(0))?;
    ArchiveHeader::read(reader)?;
    let (footer, at) = footer::locate(reader)?;
    let directory = read_directory(reader, footer.directory_offset)?;
    Ok((footer, at, directory))
}

fn safe_join(dest: &Path, name: &str) -> Option<PathBuf> {
    let mut path = dest.to_path_buf();
    for part in name.split('/') {
        match Path::new(part).components().next() {
            Some(Component::Normal(_)) if Path::new(part).components().count() == 1 => path.push(part),
            _ => return None,
        }
    }
    Some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn small_cfg() -> ArchiveConfig {
        ArchiveConfig {
            threads: 2,
            min_match: 32,
            chunk_size: 64,
            max_chunk: 512,
            solid_block_size: 4096,
            ..Default::default()
        }
    }

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut x = seed | 1;
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                x as u8
            })
            .collect()
    }

    #[test]
    fn test_entries_span_blocks() {
        let mut w = ArchiveWriter::begin(Cursor::new(Vec::new()), small_cfg()).unwrap();
        let big = pseudo_random(10_000, 3);
        w.add_bytes("big.bin", &big, 7).unwrap();
        w.add_bytes("small.txt", b"hello", 8).unwrap();
        let sink = w.finalize().unwrap();

        let mut r = ArchiveReader::open(sink, None).unwrap();
        let entry = r.directory().find("big.bin").unwrap().clone();
        assert_eq!(entry.extents.len(), 3);
        assert_eq!(r.directory().blocks.len(), 3);
        assert_eq!(r.read_entry("big.bin").unwrap(), big);
        assert_eq!(r.read_entry("small.txt").unwrap(), b"hello");
        assert_eq!(r.list()[1].mtime, 8);
    }

    #[test]
    fn test_empty_entry_gets_zero_length_extent() {
        let mut w = ArchiveWriter::begin(Cursor::new(Vec::new()), small_cfg()).unwrap();
        w.add_bytes("empty", b"", 0).unwrap();
        let mut r = ArchiveReader::open(w.finalize().unwrap(), None).unwrap();
        let entry = r.directory().find("empty").unwrap().clone();
        assert_eq!(entry.extents, vec![Extent { block: 0, offset: 0, len: 0 }]);
        assert_eq!(r.directory().blocks[0].orig_size, 0);
        assert!(r.read_entry("empty").unwrap().is_empty());
    }

    #[test]
    fn test_solid_block_files_limit() {
        let cfg = ArchiveConfig { solid_block_files: Some(2), ..small_cfg() };
        let mut w = ArchiveWriter::begin(Cursor::new(Vec::new()), cfg).unwrap();
        for i in 0..5 {
            w.add_bytes(&format!("f{i}"), b"abc", 0).unwrap();
        }
        let r = ArchiveReader::open(w.finalize().unwrap(), None).unwrap();
        assert_eq!(r.directory().blocks.len(), 3);
    }

    #[test]
    fn test_names_are_normalized() {
        assert_eq!(normalize_name("a\\b//c").unwrap(), "a/b/c");
        assert_eq!(normalize_name("/abs/./x").unwrap(), "abs/x");
        assert!(normalize_name("../etc/passwd").is_err());
        assert!(normalize_name("").is_err());
        assert!(safe_join(Path::new("/out"), "a/../b").is_none());
        assert_eq!(safe_join(Path::new("/out"), "a/b").unwrap(), Path::new("/out/a/b"));
    }

    #[test]
    fn test_later_entry_replaces_earlier_on_append() {
        let mut w = ArchiveWriter::begin(Cursor::new(Vec::new()), small_cfg()).unwrap();
        w.add_bytes("x", b"old", 0).unwrap();
        let sink = w.finalize().unwrap();

        let mut w = ArchiveWriter::append(sink, small_cfg()).unwrap();
        w.add_bytes("x", b"new", 1).unwrap();
        let mut r = ArchiveReader::open(w.finalize().unwrap(), None).unwrap();
        assert_eq!(r.list().len(), 1);
        assert_eq!(r.read_entry("x").unwrap(), b"new");
        assert_eq!(r.sessions().unwrap().len(), 2);
    }

    #[test]
    fn test_duplicate_name_in_one_session_keeps_the_later_entry() {
        let mut w = ArchiveWriter::begin(Cursor::new(Vec::new()), small_cfg()).unwrap();
        w.add_bytes("dup", b"first", 0).unwrap();
        w.add_bytes("other", b"-", 0).unwrap();
        w.add_bytes("dup", b"second", 5).unwrap();
        let mut r = ArchiveReader::open(w.finalize().unwrap(), None).unwrap();
        let names: Vec<String> = r.list().into_iter().map(|e| e.name).collect();
        assert_eq!(names, ["other", "dup"]);
        assert_eq!(r.read_entry("dup").unwrap(), b"second");
        assert_eq!(r.list()[1].mtime, 5);
    }

    #[test]
    fn test_session_dictionary_blocks_decode_in_any_order() {
        let cfg = ArchiveConfig { dict_size: Some(1 << 20), ..small_cfg() };
        let unit = pseudo_random(4096, 11);
        let mut w = ArchiveWriter::begin(Cursor::new(Vec::new()), cfg).unwrap();
        for i in 0..4 {
            w.add_bytes(&format!("copy{i}"), &unit, 0).unwrap();
        }
        w.add_bytes("tail", &pseudo_random(3000, 12), 0).unwrap();
        let mut r = ArchiveReader::open(w.finalize().unwrap(), None).unwrap();

        let blocks = r.directory().blocks.clone();
        assert_eq!(blocks.len(), 5);
        assert!(blocks[0].comp_size > 3000);
        for later in &blocks[1..4] {
            assert!(later.comp_size < 200, "{blocks:?}");
        }
        // Newest first: every read walks back to block 0.
        for i in (0..4).rev() {
            assert_eq!(r.read_entry(&format!("copy{i}")).unwrap(), unit);
        }
        assert!(r.verify().is_clean());
    }

    #[test]
    fn test_missing_entry() {
        let w = ArchiveWriter::begin(Cursor::new(Vec::new()), small_cfg()).unwrap();
        let mut r = ArchiveReader::open(w.finalize().unwrap(), None).unwrap();
        assert!(matches!(r.read_entry("nope"), Err(ArcError::NotFound(_))));
    }
}
