//! Up-front memory accounting for a write session.
//!
//! The estimate is computed from the configuration alone and checked before
//! the first block buffer is allocated.  When it exceeds the budget and a
//! spill location is configured, block buffers move to memory-mapped temp
//! files and only the heap-resident part has to fit.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::codec::get_codec;
use crate::config::{ArchiveConfig, LargePages, TwoPass};
use crate::error::ResourceError;

/// Dictionary slot, its fingerprint key and the eviction queue entry.
const TABLE_ENTRY_BYTES: u64 = 112;
/// Chunk list plus occurrence count kept by the two-pass modes.
const PREPASS_ENTRY_BYTES: u64 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryEstimate {
    /// Solid blocks alive at once: one accumulating, one per worker, and the
    /// hand-off queue between them.
    pub blocks_in_flight: u64,
    pub block_buffers:    u64,
    /// Earlier blocks a session dictionary still points into.
    pub history:          u64,
    pub hash_tables:      u64,
    pub codec:            u64,
}

/// Where block buffers live for this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPlan {
    Heap,
    Spill,
}

impl MemoryEstimate {
    pub fn for_config(cfg: &ArchiveConfig) -> Self {
        let workers = cfg.worker_threads() as u64;
        let block = cfg.solid_block_size as u64;
        let blocks_in_flight = 1 + workers + 2 * workers;

        // A session dictionary is one table over the whole window; otherwise
        // every worker builds its own over at most one block.
        let session = cfg.session_dictionary();
        let (window, tables) = if session {
            (cfg.dictionary_window(), 1)
        } else {
            (cfg.dictionary_window().min(block), workers)
        };
        let mut entries = (window / cfg.chunk_size.max(1) as u64 + 1) >> cfg.accel;
        let mut per_entry = TABLE_ENTRY_BYTES;
        if cfg.pass_mode().is_some() {
            entries = entries.max(block / cfg.chunk_size.max(1) as u64 + 1);
            if cfg.pass_mode() == Some(TwoPass::FutureLz) {
                per_entry += PREPASS_ENTRY_BYTES;
            }
        }

        // Op stream before the codec runs, then the codec's own working set.
        let codec = block + get_codec(cfg.codec).memory_estimate(block);

        Self {
            blocks_in_flight,
            block_buffers: blocks_in_flight * block,
            history:       if session { window + block } else { 0 },
            hash_tables:   tables * entries * per_entry,
            codec:         workers * codec,
        }
    }

    pub fn total(&self) -> u64 {
        self.block_buffers + self.history + self.hash_tables + self.codec
    }

    /// What must stay on the heap when block buffers are spilled.
    pub fn resident(&self) -> u64 {
        self.hash_tables + self.codec
    }

    /// Compare against the budget (`max_memory`, else currently available RAM).
    pub fn check(&self, cfg: &ArchiveConfig) -> Result<MemoryPlan, ResourceError> {
        if cfg.large_pages == LargePages::Try {
            log::info!("large pages requested; continuing with regular pages");
        }
        let available = cfg.max_memory.unwrap_or_else(available_memory);
        let total = self.total();
        log::debug!(
            "memory estimate: {} MiB ({} blocks in flight), budget {} MiB",
            total >> 20,
            self.blocks_in_flight,
            available >> 20
        );
        if total <= available {
            return Ok(MemoryPlan::Heap);
        }
        let can_spill = cfg.temp_dir.is_some() || cfg.vm_file.is_some();
        if can_spill && self.resident() <= available {
            log::info!(
                "block buffers ({} MiB) exceed the memory budget; spilling to disk",
                (self.block_buffers + self.history) >> 20
            );
            return Ok(MemoryPlan::Spill);
        }
        Err(ResourceError {
            what:      "solid block pipeline",
            required:  if can_spill { self.resident() } else { total },
            available,
        })
    }
}

pub fn available_memory() -> u64 {
    let mut sys = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
    );
    sys.refresh_memory();
    sys.available_memory()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_scales_with_threads() {
        let one = MemoryEstimate::for_config(&ArchiveConfig { threads: 1, ..Default::default() });
        let four = MemoryEstimate::for_config(&ArchiveConfig { threads: 4, ..Default::default() });
        assert!(four.total() > 3 * one.total());
        assert_eq!(one.blocks_in_flight, 4);
    }

    #[test]
    fn test_budget_exceeded_reports_numbers() {
        let cfg = ArchiveConfig { threads: 1, max_memory: Some(1024), ..Default::default() };
        let est = MemoryEstimate::for_config(&cfg);
        let err = est.check(&cfg).unwrap_err();
        assert_eq!(err.required, est.total());
        assert_eq!(err.available, 1024);
    }

    #[test]
    fn test_spill_when_only_buffers_exceed() {
        let base = ArchiveConfig { threads: 1, ..Default::default() };
        let est = MemoryEstimate::for_config(&base);
        let cfg = ArchiveConfig {
            max_memory: Some(est.resident() + 1),
            temp_dir:   Some(std::env::temp_dir()),
            ..base
        };
        assert_eq!(est.check(&cfg).unwrap(), MemoryPlan::Spill);
    }

    #[test]
    fn test_session_dictionary_counts_history() {
        let base = ArchiveConfig { threads: 2, solid_block_size: 1 << 20, ..Default::default() };
        let per_block = MemoryEstimate::for_config(&base);
        assert_eq!(per_block.history, 0);

        let session = MemoryEstimate::for_config(&base.clone().with_dict_size(Some(64 << 20)));
        assert_eq!(session.history, (64 << 20) + (1 << 20));
        assert!(session.total() > per_block.total() + (64 << 20));
    }
}
