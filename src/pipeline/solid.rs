//! Solid blocks and their buffers.

use memmap2::MmapMut;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;

use crate::config::ArchiveConfig;

/// Lifecycle of one solid block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Accumulating,
    Chunking,
    Deduplicating,
    Compressing,
    Encrypting,
    Sealed,
    Flushed,
    Failed,
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlockState::Accumulating  => "accumulating",
            BlockState::Chunking      => "chunking",
            BlockState::Deduplicating => "deduplicating",
            BlockState::Compressing   => "compressing",
            BlockState::Encrypting    => "encrypting",
            BlockState::Sealed        => "sealed",
            BlockState::Flushed       => "flushed",
            BlockState::Failed        => "failed",
        };
        f.write_str(s)
    }
}

// ── Buffer ───────────────────────────────────────────────────────────────────

/// Backing storage for a block's bytes: heap, or a memory-mapped temp file
/// when the session runs over its memory budget.
pub enum BlockBuffer {
    Heap(Vec<u8>),
    Spilled {
        map:   MmapMut,
        len:   usize,
        _file: File,
        /// Named spill file under `vm_file`; removed when the buffer drops.
        _path: Option<tempfile::TempPath>,
    },
}

impl BlockBuffer {
    pub fn heap() -> Self {
        BlockBuffer::Heap(Vec::new())
    }

    /// Map a fresh temp file of `capacity` bytes under the configured spill
    /// location.  A `vm_file` spill is a named file next to that path; any
    /// other spill is unlinked already.  Either vanishes with the buffer.
    pub fn spilled(cfg: &ArchiveConfig, capacity: usize) -> io::Result<Self> {
        let (file, path) = match (&cfg.vm_file, &cfg.temp_dir) {
            (Some(vm), _) => {
                let dir = vm.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
                let prefix = vm.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
                let (file, path) = tempfile::Builder::new().prefix(&prefix).tempfile_in(dir)?.into_parts();
                log::debug!("spilling block buffer to {}", path.display());
                (file, Some(path))
            }
            (None, Some(dir)) => (tempfile::tempfile_in(dir)?, None),
            (None, None) => (tempfile::tempfile()?, None),
        };
        file.set_len(capacity.max(1) as u64)?;
        // SAFETY: the file is private to this buffer (unlinked temp file) and
        // is only accessed through this mapping.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(BlockBuffer::Spilled { map, len: 0, _file: file, _path: path })
    }

    pub fn len(&self) -> usize {
        match self {
            BlockBuffer::Heap(v) => v.len(),
            BlockBuffer::Spilled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append `data`.  A spilled buffer never grows past its mapped capacity;
    /// callers split input at the solid block size.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            BlockBuffer::Heap(v) => v.extend_from_slice(data),
            BlockBuffer::Spilled { map, len, .. } => {
                let end = *len + data.len();
                if end > map.len() {
                    return Err(io::Error::new(io::ErrorKind::Other, "spill buffer capacity exceeded"));
                }
                map[*len..end].copy_from_slice(data);
                *len = end;
            }
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            BlockBuffer::Heap(v) => v,
            BlockBuffer::Spilled { map, len, .. } => &map[..*len],
        }
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self, BlockBuffer::Spilled { .. })
    }
}

// ── SolidBlock ───────────────────────────────────────────────────────────────

/// Bytes of one or more files compressed as a unit.
pub struct SolidBlock {
    /// Position within the write session; also the nonce counter.
    pub seq:   u64,
    pub files: usize,
    buffer:    BlockBuffer,
    state:     BlockState,
}

impl SolidBlock {
    pub fn new(seq: u64, buffer: BlockBuffer) -> Self {
        log::debug!("block {seq}: created ({})", if buffer.is_spilled() { "spilled" } else { "heap" });
        Self { seq, files: 0, buffer, state: BlockState::Accumulating }
    }

    pub fn state(&self) -> BlockState {
        self.state
    }

    pub fn set_state(&mut self, next: BlockState) {
        log::debug!("block {}: {} -> {}", self.seq, self.state, next);
        self.state = next;
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn push(&mut self, data: &[u8]) -> io::Result<()> {
        debug_assert_eq!(self.state, BlockState::Accumulating, "sealed blocks are immutable");
        self.buffer.extend_from_slice(data)
    }
}

impl AsRef<[u8]> for SolidBlock {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}
