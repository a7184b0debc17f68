//! Immutable archive configuration.
//!
//! An [`ArchiveConfig`] is built once (struct literal over `Default`, a JSON
//! file, or CLI flags), validated once, and then shared read-only by every
//! stage of a session.  Nothing in the crate reads process-wide settings.
//!
//! ```
//! use dedarc::config::{ArchiveConfig, Method};
//! use dedarc::codec::CodecId;
//!
//! let cfg = ArchiveConfig {
//!     method: Method::Exhaustive,
//!     codec:  CodecId::Lz4,
//!     ..ArchiveConfig::default()
//! };
//! cfg.validate().unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use zeroize::Zeroize;

use crate::cdc::{ChunkParams, RollingKind};
use crate::codec::{CodecId, CodecStage};
use crate::crypto::{MAX_KDF_ITERATIONS, MAX_KDF_MEMORY_KIB};
use crate::error::{ArcError, Result};

/// Lower bound for `min_match`; shorter matches cost more to encode than they save.
pub const MIN_MATCH_FLOOR: usize = 16;
/// Default solid block size: 16 MiB.
pub const DEFAULT_SOLID_BLOCK_SIZE: usize = 16 * 1024 * 1024;
/// Default I/O buffer: 8 MiB.
pub const DEFAULT_BUF_SIZE: usize = 8 * 1024 * 1024;

/// 0 = warnings only, then info, debug, trace.
pub fn log_filter_for(verbosity: u8) -> log::LevelFilter {
    match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    }
}

// ── Method ────────────────────────────────────────────────────────────────────

/// Dedup method 0–5, trading thoroughness for speed and memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Method {
    /// Fixed-size pieces, dictionary limited to the I/O buffer.
    InMemory   = 0,
    /// Polynomial (Rabin) content-defined chunking.
    Cdc        = 1,
    /// Gear content-defined chunking.
    GearCdc    = 2,
    /// Gear CDC with precomputed BLAKE3 digests instead of byte compares.
    Digests    = 3,
    /// Gear CDC, two-pass future-LZ indexing.
    FutureLz   = 4,
    /// Gear CDC, several candidates per fingerprint.
    Exhaustive = 5,
}

impl Method {
    pub fn number(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for Method {
    type Error = String;

    fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
        Ok(match v {
            0 => Method::InMemory,
            1 => Method::Cdc,
            2 => Method::GearCdc,
            3 => Method::Digests,
            4 => Method::FutureLz,
            5 => Method::Exhaustive,
            other => return Err(format!("method must be 0-5, got {other}")),
        })
    }
}

impl From<Method> for u8 {
    fn from(m: Method) -> u8 {
        m as u8
    }
}

// ── Small enums ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LargePages {
    #[default]
    Disable,
    Try,
    Force,
}

impl LargePages {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "disable" | "off" => Some(LargePages::Disable),
            "try" => Some(LargePages::Try),
            "force" => Some(LargePages::Force),
            _ => None,
        }
    }
}

/// Chunk fingerprint function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    #[default]
    Blake3,
    Crc32,
}

impl HashKind {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "blake3" => Some(HashKind::Blake3),
            "crc32" | "crc" => Some(HashKind::Crc32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoPass {
    /// Index only fingerprints seen more than once in the block.
    FutureLz,
    /// Build the full first-occurrence index before emitting matches.
    IndexLz,
}

impl TwoPass {
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().replace(['-', '_'], "").as_str() {
            "futurelz" => Some(TwoPass::FutureLz),
            "indexlz" => Some(TwoPass::IndexLz),
            _ => None,
        }
    }
}

/// Password kept out of `Debug` output and wiped on drop.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

// ── ArchiveConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    pub method:                Method,
    /// Dedup window in bytes.  `None` = the whole solid block.
    pub dict_size:             Option<u64>,
    pub buf_size:              usize,
    /// Dictionary sampling: only fingerprints with `accel` low zero bits are indexed.
    pub accel:                 u8,
    pub min_match:             usize,
    /// Target (average) chunk length L.
    pub chunk_size:            usize,
    pub max_chunk:             usize,
    /// Worker threads; 0 = one per available core.
    pub threads:               usize,
    pub verbosity:             u8,
    pub use_mmap:              bool,
    pub large_pages:           LargePages,
    pub hash:                  HashKind,
    #[serde(skip_serializing)]
    pub password:              Option<Password>,
    /// Directory for spill files when a block buffer exceeds the memory budget.
    pub temp_dir:              Option<PathBuf>,
    /// Explicit spill file path; takes precedence over `temp_dir`.
    pub vm_file:               Option<PathBuf>,
    /// Memory budget in bytes.  `None` = currently available system memory.
    pub max_memory:            Option<u64>,
    pub codec:                 CodecId,
    pub level:                 i32,
    pub solid_block_size:      usize,
    /// Seal a block after this many files.  `None` = size threshold only.
    pub solid_block_files:     Option<usize>,
    /// Override the pass structure; `None` = derived from `method`.
    pub two_pass:              Option<TwoPass>,
    pub exhaustive_candidates: usize,
    pub kdf_iterations:        u32,
    pub kdf_memory_kib:        u32,
    pub comment:               String,
    pub locked:                bool,
    pub recovery:              String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            method:                Method::GearCdc,
            dict_size:             None,
            buf_size:              DEFAULT_BUF_SIZE,
            accel:                 0,
            min_match:             256,
            chunk_size:            2048,
            max_chunk:             16 * 1024,
            threads:               0,
            verbosity:             0,
            use_mmap:              true,
            large_pages:           LargePages::Disable,
            hash:                  HashKind::Blake3,
            password:              None,
            temp_dir:              None,
            vm_file:               None,
            max_memory:            None,
            codec:                 CodecId::Zstd,
            level:                 CodecId::Zstd.default_level(),
            solid_block_size:      DEFAULT_SOLID_BLOCK_SIZE,
            solid_block_files:     None,
            two_pass:              None,
            exhaustive_candidates: 8,
            kdf_iterations:        3,
            kdf_memory_kib:        64 * 1024,
            comment:               String::new(),
            locked:                false,
            recovery:              String::new(),
        }
    }
}

impl ArchiveConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let cfg: Self = serde_json::from_slice(&bytes)
            .map_err(|e| ArcError::Config(format!("{}: {e}", path.as_ref().display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Password::new(password));
        self
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Set the codec stage; `level` of `None` picks the codec's default.
    pub fn with_codec(mut self, codec: CodecId, level: Option<i32>) -> Self {
        self.codec = codec;
        self.level = level.unwrap_or_else(|| codec.default_level());
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_chunking(mut self, min_match: usize, chunk_size: usize, max_chunk: usize) -> Self {
        self.min_match = min_match;
        self.chunk_size = chunk_size;
        self.max_chunk = max_chunk;
        self
    }

    pub fn with_solid_block(mut self, size: usize, files: Option<usize>) -> Self {
        self.solid_block_size = size;
        self.solid_block_files = files;
        self
    }

    pub fn with_dict_size(mut self, dict_size: Option<u64>) -> Self {
        self.dict_size = dict_size;
        self
    }

    pub fn with_kdf(mut self, iterations: u32, memory_kib: u32) -> Self {
        self.kdf_iterations = iterations;
        self.kdf_memory_kib = memory_kib;
        self
    }

    pub fn with_max_memory(mut self, bytes: Option<u64>) -> Self {
        self.max_memory = bytes;
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    pub fn locked(mut self, locked: bool) -> Self {
        self.locked = locked;
        self
    }

    /// Reject inconsistent settings before any work starts.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(ArcError::Config(msg));
        if self.min_match < MIN_MATCH_FLOOR {
            return bad(format!("min_match must be at least {MIN_MATCH_FLOOR}, got {}", self.min_match));
        }
        if self.chunk_size < self.min_match {
            return bad(format!(
                "chunk_size ({}) must not be smaller than min_match ({})",
                self.chunk_size, self.min_match
            ));
        }
        if self.max_chunk < self.chunk_size {
            return bad(format!(
                "max_chunk ({}) must not be smaller than chunk_size ({})",
                self.max_chunk, self.chunk_size
            ));
        }
        if self.buf_size == 0 || self.solid_block_size == 0 {
            return bad("buf_size and solid_block_size must be non-zero".into());
        }
        if self.dict_size == Some(0) {
            return bad("dict_size must be non-zero when set".into());
        }
        if self.solid_block_files == Some(0) {
            return bad("solid_block_files must be non-zero when set".into());
        }
        if self.accel > 8 {
            return bad(format!("accel must be 0-8, got {}", self.accel));
        }
        if self.exhaustive_candidates == 0 {
            return bad("exhaustive_candidates must be at least 1".into());
        }
        if !(1..=MAX_KDF_ITERATIONS).contains(&self.kdf_iterations) {
            return bad(format!("kdf_iterations must be 1-{MAX_KDF_ITERATIONS}, got {}", self.kdf_iterations));
        }
        if !(8..=MAX_KDF_MEMORY_KIB).contains(&self.kdf_memory_kib) {
            return bad(format!("kdf_memory_kib must be 8-{MAX_KDF_MEMORY_KIB}, got {}", self.kdf_memory_kib));
        }
        if self.large_pages == LargePages::Force {
            return bad("large-page mode 'force' is not available in this build".into());
        }
        if let Some(p) = &self.password {
            if p.expose().is_empty() {
                return bad("password must not be empty".into());
            }
        }
        Ok(())
    }

    // ── Derived settings ─────────────────────────────────────────────────────

    pub fn worker_threads(&self) -> usize {
        if self.threads > 0 {
            self.threads
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        }
    }

    /// Bytes a match may reach back.  Method 0 only sees its I/O buffer.
    pub fn dictionary_window(&self) -> u64 {
        match self.method {
            Method::InMemory => self.buf_size as u64,
            _ => self.dict_size.unwrap_or(self.solid_block_size as u64),
        }
    }

    /// One match dictionary spans the whole write session, so later blocks
    /// reference earlier ones.  Off when the window fits in a single block;
    /// blocks then decode independently and dedup runs in parallel.
    pub fn session_dictionary(&self) -> bool {
        self.method != Method::InMemory && self.dictionary_window() > self.solid_block_size as u64
    }

    /// Log level for a session, from `verbosity`.
    pub fn log_filter(&self) -> log::LevelFilter {
        log_filter_for(self.verbosity)
    }

    pub fn precompute_digests(&self) -> bool {
        self.method == Method::Digests
    }

    /// Matches stay on chunk boundaries (no byte-wise extension).
    pub fn round_matches(&self) -> bool {
        self.method == Method::Digests && self.dict_size.is_none()
    }

    pub fn pass_mode(&self) -> Option<TwoPass> {
        self.two_pass.or(match self.method {
            Method::FutureLz => Some(TwoPass::FutureLz),
            _ => None,
        })
    }

    pub fn candidates_per_fingerprint(&self) -> usize {
        match self.method {
            Method::Exhaustive => self.exhaustive_candidates,
            _ => 1,
        }
    }

    pub fn chunk_params(&self) -> ChunkParams {
        let kind = match self.method {
            Method::InMemory => RollingKind::Fixed,
            Method::Cdc => RollingKind::Rabin,
            _ => RollingKind::Gear,
        };
        ChunkParams {
            min_len: self.min_match,
            target:  self.chunk_size,
            max_len: self.max_chunk,
            kind,
        }
    }

    pub fn codec_stage(&self) -> CodecStage {
        CodecStage::new(self.codec, self.level)
    }
}
