//! Content-defined chunking.
//!
//! [`Chunker`] walks a buffer and yields [`Chunk`]s that cover it with no
//! gaps or overlaps.  A cut is declared where the rolling hash satisfies
//! `hash & mask == 0`, never before `min_len` bytes, always at `max_len`,
//! and always at end of input.  Because the hash only sees a short trailing
//! window, an insertion upstream shifts boundaries only locally, which is
//! what lets the match finder re-discover shifted duplicates.
//!
//! ```
//! use dedarc::cdc::{ChunkParams, Chunker, Fingerprinter, RollingKind};
//! use dedarc::config::HashKind;
//!
//! let data = vec![7u8; 10_000];
//! let params = ChunkParams { min_len: 64, target: 512, max_len: 2048, kind: RollingKind::Gear };
//! let fp = Fingerprinter::new(HashKind::Blake3, false);
//! let total: usize = Chunker::new(&data, params, fp).map(|c| c.len).sum();
//! assert_eq!(total, data.len());
//! ```

pub mod gear;
pub mod rabin;

use crate::config::HashKind;
use gear::{gear_table, GEAR_WINDOW};
use rabin::{RollingHash, RABIN_WINDOW};

/// Rolling hash family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollingKind {
    /// Fixed `target`-size pieces; no hashing.
    Fixed,
    Rabin,
    Gear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkParams {
    pub min_len: usize,
    pub target:  usize,
    pub max_len: usize,
    pub kind:    RollingKind,
}

impl ChunkParams {
    /// `next_pow2(target - min_len) - 1`: cuts land on average `target` bytes apart.
    pub fn mask(&self) -> u64 {
        let span = self.target.saturating_sub(self.min_len).max(1) as u64;
        span.next_power_of_two() - 1
    }
}

/// One content-defined piece of the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset:      usize,
    pub len:         usize,
    pub fingerprint: u64,
    /// Full BLAKE3 digest, present only when digests are precomputed.
    pub digest:      Option<[u8; 32]>,
}

impl Chunk {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

// ── Fingerprints ─────────────────────────────────────────────────────────────

/// Maps chunk bytes to a 64-bit lookup key (and optionally a full digest).
#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
    kind:        HashKind,
    keep_digest: bool,
}

impl Fingerprinter {
    /// `keep_digest` forces BLAKE3 regardless of `kind`; the digest doubles as
    /// the verification key.
    pub fn new(kind: HashKind, keep_digest: bool) -> Self {
        Self { kind, keep_digest }
    }

    pub fn fingerprint(&self, bytes: &[u8]) -> (u64, Option<[u8; 32]>) {
        if self.keep_digest || self.kind == HashKind::Blake3 {
            let digest = *blake3::hash(bytes).as_bytes();
            let mut key = [0u8; 8];
            key.copy_from_slice(&digest[..8]);
            let fp = u64::from_le_bytes(key);
            (fp, self.keep_digest.then_some(digest))
        } else {
            let crc = crc32fast::hash(bytes);
            ((u64::from(crc) << 32) | (bytes.len() as u64 & 0xffff_ffff), None)
        }
    }
}

// ── Chunker ──────────────────────────────────────────────────────────────────

/// Lazy iterator over the chunks of `data`.
pub struct Chunker<'a> {
    data:   &'a [u8],
    params: ChunkParams,
    fp:     Fingerprinter,
    mask:   u64,
    pos:    usize,
    rabin:  RollingHash,
}

impl<'a> Chunker<'a> {
    pub fn new(data: &'a [u8], params: ChunkParams, fp: Fingerprinter) -> Self {
        let mask = params.mask();
        Self { data, params, fp, mask, pos: 0, rabin: RollingHash::new() }
    }

    /// Continue from `offset`, which must be a boundary this chunker (or an
    /// identically configured one) produced earlier.
    pub fn resume_at(&mut self, offset: usize) {
        self.pos = offset.min(self.data.len());
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// End (exclusive) of the chunk starting at `start`.
    fn next_cut(&mut self, start: usize) -> usize {
        let remaining = self.data.len() - start;
        let min_len = self.params.min_len.max(1);
        let max_len = self.params.max_len.max(min_len);

        if self.params.kind == RollingKind::Fixed {
            return start + remaining.min(self.params.target.max(1));
        }
        if remaining <= min_len {
            return self.data.len();
        }

        let search_start = start + min_len;
        let search_end = (start + max_len).min(self.data.len());

        match self.params.kind {
            RollingKind::Gear => {
                let table = gear_table();
                let mut hash = 0u64;
                // Prime the hash so the first candidate already sees a full window.
                for &b in &self.data[search_start.saturating_sub(GEAR_WINDOW).max(start)..search_start] {
                    hash = gear::roll(hash, b, table);
                }
                for i in search_start..search_end {
                    hash = gear::roll(hash, self.data[i], table);
                    if hash & self.mask == 0 {
                        return i + 1;
                    }
                }
            }
            RollingKind::Rabin => {
                self.rabin.reset();
                for &b in &self.data[search_start.saturating_sub(RABIN_WINDOW).max(start)..search_start] {
                    self.rabin.update(b);
                }
                for i in search_start..search_end {
                    if self.rabin.update(self.data[i]) & self.mask == 0 {
                        return i + 1;
                    }
                }
            }
            RollingKind::Fixed => {}
        }
        search_end
    }
}

impl Iterator for Chunker<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.pos >= self.data.len() {
            return None;
        }
        let start = self.pos;
        let end = self.next_cut(start);
        self.pos = end;
        let (fingerprint, digest) = self.fp.fingerprint(&self.data[start..end]);
        Some(Chunk { offset: start, len: end - start, fingerprint, digest })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize, seed: u64) -> Vec<u8> {
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

    fn params(kind: RollingKind) -> ChunkParams {
        ChunkParams { min_len: 64, target: 512, max_len: 2048, kind }
    }

    fn fp() -> Fingerprinter {
        Fingerprinter::new(HashKind::Blake3, false)
    }

    #[test]
    fn test_empty_input_has_no_chunks() {
        assert_eq!(Chunker::new(&[], params(RollingKind::Gear), fp()).count(), 0);
    }

    #[test]
    fn test_single_byte() {
        let chunks: Vec<_> = Chunker::new(&[42], params(RollingKind::Rabin), fp()).collect();
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].offset, chunks[0].len), (0, 1));
    }

    #[test]
    fn test_cover_without_gaps_and_respect_bounds() {
        let data = noise(200_000, 9);
        for kind in [RollingKind::Fixed, RollingKind::Rabin, RollingKind::Gear] {
            let p = params(kind);
            let chunks: Vec<_> = Chunker::new(&data, p, fp()).collect();
            let mut expected = 0;
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.offset, expected, "{kind:?}: gap before chunk {i}");
                assert!(c.len <= p.max_len);
                if i + 1 < chunks.len() {
                    assert!(c.len >= p.min_len, "{kind:?}: chunk {i} too short: {}", c.len);
                }
                expected = c.end();
            }
            assert_eq!(expected, data.len());
        }
    }

    #[test]
    fn test_average_size_near_target() {
        let data = noise(1 << 20, 3);
        let n = Chunker::new(&data, params(RollingKind::Gear), fp()).count();
        let avg = data.len() / n;
        assert!((256..=2048).contains(&avg), "average chunk {avg}");
    }

    #[test]
    fn test_deterministic() {
        let data = noise(100_000, 5);
        let a: Vec<_> = Chunker::new(&data, params(RollingKind::Gear), fp()).collect();
        let b: Vec<_> = Chunker::new(&data, params(RollingKind::Gear), fp()).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_boundaries_resync_after_insertion() {
        let base = noise(100_000, 11);
        let mut edited = base[..1000].to_vec();
        edited.extend_from_slice(b"INSERTED");
        edited.extend_from_slice(&base[1000..]);

        let ends = |d: &[u8], shift: usize| -> std::collections::HashSet<usize> {
            Chunker::new(d, params(RollingKind::Gear), fp())
                .map(|c| c.end().saturating_sub(shift))
                .filter(|&e| e > 4000)
                .collect()
        };
        let a = ends(&base, 0);
        let b = ends(&edited, 8);
        let shared = a.intersection(&b).count();
        assert!(shared * 10 >= a.len() * 9, "only {shared} of {} boundaries survived", a.len());
    }

    #[test]
    fn test_resume_at_boundary() {
        let data = noise(50_000, 17);
        let all: Vec<_> = Chunker::new(&data, params(RollingKind::Rabin), fp()).collect();
        let mut resumed = Chunker::new(&data, params(RollingKind::Rabin), fp());
        resumed.resume_at(all[3].offset);
        assert_eq!(resumed.collect::<Vec<_>>(), all[3..].to_vec());
    }

    #[test]
    fn test_fixed_pieces() {
        let data = vec![1u8; 1300];
        let lens: Vec<_> = Chunker::new(&data, params(RollingKind::Fixed), fp()).map(|c| c.len).collect();
        assert_eq!(lens, vec![512, 512, 276]);
    }

    #[test]
    fn test_crc_fingerprint_includes_length() {
        let f = Fingerprinter::new(HashKind::Crc32, false);
        let (a, d) = f.fingerprint(b"abc");
        assert_eq!(a & 0xffff_ffff, 3);
        assert!(d.is_none());
        let f = Fingerprinter::new(HashKind::Crc32, true);
        assert!(f.fingerprint(b"abc").1.is_some());
    }
}
