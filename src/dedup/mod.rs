//! Match finder: turns a chunk stream into literal runs and back-references.
//!
//! Every chunk is first tried as a continuation of the previous match (same
//! distance, verified directly), then looked up by fingerprint.  A
//! fingerprint hit is only a candidate; the bytes (or, for method 3, the full
//! BLAKE3 digests) must agree before a match is emitted.  Verified matches
//! grow backward into the preceding literal run unless round matches are
//! requested.  Adjacent matches with equal distance and adjacent literals are
//! merged, so the output never holds two neighbouring ops that could be one.
//!
//! Offsets in the dictionary are positions in the write session.  With a
//! window no larger than a solid block every block gets a fresh
//! [`Dictionary`] and its matches stay inside it.  A larger window keeps one
//! dictionary for the whole session ([`SessionDedup`]) together with the
//! [`History`] of earlier blocks it points into.  Entries older than the
//! window are evicted in insertion order either way.

pub mod memory;
pub mod stream;

use std::collections::{HashMap, VecDeque};

use crate::cdc::{Chunk, Chunker, Fingerprinter};
use crate::config::{ArchiveConfig, TwoPass};
use crate::error::{ArcError, Result};
use crate::pipeline::CancellationToken;

/// Chunks classified between two cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 1024;

/// One op of the dictionary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupMatch<'a> {
    Literal(&'a [u8]),
    /// Copy `len` bytes starting `distance` bytes back in the output.
    Match { distance: u64, len: u64 },
}

impl DedupMatch<'_> {
    pub fn len(&self) -> u64 {
        match self {
            DedupMatch::Literal(b) => b.len() as u64,
            DedupMatch::Match { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_match(&self) -> bool {
        matches!(self, DedupMatch::Match { .. })
    }
}

/// Literal bounds are block-local; distances are session-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Literal { start: usize, end: usize },
    Match { distance: usize, len: usize },
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Session offset.
    offset: usize,
    len:    usize,
    digest: Option<[u8; 32]>,
}

/// Match-finder settings derived from an [`ArchiveConfig`].
#[derive(Debug, Clone, Copy)]
pub struct FinderParams {
    pub window:        usize,
    pub min_match:     usize,
    pub candidates:    usize,
    pub accel_mask:    u64,
    pub round_matches: bool,
    pub verify_digest: bool,
    pub pass:          Option<TwoPass>,
    /// How far past a candidate the exhaustive search looks to rank it.
    pub lookahead:     usize,
}

impl FinderParams {
    pub fn from_config(cfg: &ArchiveConfig) -> Self {
        Self {
            window:        usize::try_from(cfg.dictionary_window()).unwrap_or(usize::MAX),
            min_match:     cfg.min_match,
            candidates:    cfg.candidates_per_fingerprint(),
            accel_mask:    (1u64 << cfg.accel) - 1,
            round_matches: cfg.round_matches(),
            verify_digest: cfg.precompute_digests(),
            pass:          cfg.pass_mode(),
            lookahead:     cfg.max_chunk,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub chunks:         u64,
    pub matched_chunks: u64,
    pub literal_bytes:  u64,
    pub match_bytes:    u64,
}

// ── Dictionary and history ───────────────────────────────────────────────────

/// Fingerprint table with its eviction queue.
#[derive(Debug, Default)]
pub struct Dictionary {
    table:  HashMap<u64, VecDeque<Slot>>,
    /// Insertion order, for window eviction.
    order:  VecDeque<(u64, usize)>,
    /// Future-LZ occurrence counts from the first pass.
    counts: HashMap<u64, u32>,
}

impl Dictionary {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Bytes of the blocks classified earlier in the session, oldest first.
#[derive(Default)]
pub struct History {
    segments: VecDeque<(usize, Box<dyn AsRef<[u8]> + Send>)>,
    /// Session offset just past the newest segment.
    end:      usize,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session offset of the next block.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Session offset of the oldest byte still held.
    pub fn start(&self) -> usize {
        self.segments.front().map_or(self.end, |(base, _)| *base)
    }

    /// Bytes held.
    pub fn retained(&self) -> usize {
        self.end - self.start()
    }

    pub fn push(&mut self, block: Box<dyn AsRef<[u8]> + Send>) {
        let len = (*block).as_ref().len();
        self.segments.push_back((self.end, block));
        self.end += len;
    }

    /// Drop blocks that lie entirely more than `window` bytes back.
    pub fn trim(&mut self, window: usize) {
        let horizon = self.end.saturating_sub(window);
        while let Some((base, seg)) = self.segments.front() {
            if base + (**seg).as_ref().len() > horizon {
                break;
            }
            self.segments.pop_front();
        }
    }

    fn segment(&self, i: usize) -> (usize, &[u8]) {
        let (base, seg) = &self.segments[i];
        (*base, (**seg).as_ref())
    }

    /// Bytes from session offset `s` to the end of its segment.
    fn tail_at(&self, s: usize) -> &[u8] {
        if s < self.start() || s >= self.end {
            return &[];
        }
        let i = self.segments.partition_point(|(base, _)| *base <= s) - 1;
        let (base, seg) = self.segment(i);
        &seg[s - base..]
    }

    /// Bytes from the start of the segment holding `s - 1` up to `s`.
    fn head_before(&self, s: usize) -> &[u8] {
        if s <= self.start() || s > self.end {
            return &[];
        }
        let i = self.segments.partition_point(|(base, _)| *base < s) - 1;
        let (base, seg) = self.segment(i);
        &seg[..s - base]
    }
}

// ── Match finder ─────────────────────────────────────────────────────────────

pub struct MatchFinder<'a> {
    data:    &'a [u8],
    /// Session offset of `data[0]`.
    base:    usize,
    history: Option<&'a History>,
    params:  FinderParams,
    dict:    Dictionary,
    ops:     Vec<Op>,
    pos:     usize,
    stats:   DedupStats,
}

impl<'a> MatchFinder<'a> {
    /// Finder for one block on its own.
    pub fn new(data: &'a [u8], params: FinderParams) -> Self {
        Self {
            data,
            base: 0,
            history: None,
            params,
            dict: Dictionary::default(),
            ops: Vec::new(),
            pos: 0,
            stats: DedupStats::default(),
        }
    }

    /// Finder for the block that follows `history`, continuing `dict`.
    pub fn resume(data: &'a [u8], history: &'a History, dict: Dictionary, params: FinderParams) -> Self {
        Self { base: history.end(), history: Some(history), dict, ..Self::new(data, params) }
    }

    pub fn needs_prepass(&self) -> bool {
        self.params.pass.is_some()
    }

    /// First pass of the two-pass modes.  `chunks` must be the full chunk
    /// list of the block, in order.
    pub fn prepare(&mut self, chunks: &[Chunk]) {
        match self.params.pass {
            Some(TwoPass::FutureLz) => {
                for c in chunks {
                    *self.dict.counts.entry(c.fingerprint).or_insert(0) += 1;
                }
                log::trace!(
                    "future-lz: {} distinct fingerprints, {} repeated",
                    self.dict.counts.len(),
                    self.dict.counts.values().filter(|&&n| n > 1).count()
                );
            }
            Some(TwoPass::IndexLz) => {
                for c in chunks {
                    if self.indexable(c) && !self.dict.table.contains_key(&c.fingerprint) {
                        let offset = self.base + c.offset;
                        let slot = Slot { offset, len: c.len, digest: c.digest };
                        self.dict.table.insert(c.fingerprint, VecDeque::from([slot]));
                        self.dict.order.push_back((c.fingerprint, offset));
                    }
                }
            }
            None => {}
        }
    }

    /// Classify the next chunk.  Chunks must arrive in order and without gaps.
    pub fn classify(&mut self, chunk: &Chunk) -> DedupMatch<'a> {
        debug_assert_eq!(chunk.offset, self.pos, "chunks must be contiguous");
        let (o, l) = (chunk.offset, chunk.len);
        self.evict(self.base + o);
        self.stats.chunks += 1;

        let found = self.continuation(o, l).or_else(|| self.lookup(chunk));
        let result = match found {
            Some(distance) => {
                self.stats.matched_chunks += 1;
                self.push_match(o, l, distance);
                DedupMatch::Match { distance: distance as u64, len: l as u64 }
            }
            None => {
                self.push_literal(o, o + l);
                DedupMatch::Literal(&self.data[o..o + l])
            }
        };
        self.insert(chunk);
        self.pos = o + l;
        result
    }

    /// Merged op list for everything classified so far.
    pub fn finish(self) -> (Vec<DedupMatch<'a>>, DedupStats) {
        let (ops, stats, _) = self.finish_session();
        (ops, stats)
    }

    /// Like [`finish`](Self::finish), handing back the dictionary for the
    /// next block of the session.
    pub fn finish_session(mut self) -> (Vec<DedupMatch<'a>>, DedupStats, Dictionary) {
        let data = self.data;
        let ops = self
            .ops
            .iter()
            .map(|op| match *op {
                Op::Literal { start, end } => {
                    self.stats.literal_bytes += (end - start) as u64;
                    DedupMatch::Literal(&data[start..end])
                }
                Op::Match { distance, len } => {
                    self.stats.match_bytes += len as u64;
                    DedupMatch::Match { distance: distance as u64, len: len as u64 }
                }
            })
            .collect();
        (ops, self.stats, self.dict)
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn indexable(&self, c: &Chunk) -> bool {
        c.len >= self.params.min_match && c.fingerprint & self.params.accel_mask == 0
    }

    /// Bytes from session offset `s` up to the end of its block.
    fn tail_at(&self, s: usize) -> &'a [u8] {
        if s >= self.base {
            return self.data.get(s - self.base..).unwrap_or_default();
        }
        self.history.map_or(&[][..], |h| h.tail_at(s))
    }

    /// Bytes from the start of the block holding `s - 1` up to `s`.
    fn head_before(&self, s: usize) -> &'a [u8] {
        if s > self.base {
            return &self.data[..s - self.base];
        }
        self.history.map_or(&[][..], |h| h.head_before(s))
    }

    /// Whether `len` bytes at session offset `src` equal `data[dst..]`.
    fn equal(&self, mut src: usize, dst: usize, len: usize) -> bool {
        let mut done = 0;
        while done < len {
            let seg = self.tail_at(src);
            if seg.is_empty() {
                return false;
            }
            let n = seg.len().min(len - done);
            if seg[..n] != self.data[dst + done..dst + done + n] {
                return false;
            }
            done += n;
            src += n;
        }
        true
    }

    fn continuation(&self, o: usize, l: usize) -> Option<usize> {
        let Some(Op::Match { distance, .. }) = self.ops.last() else {
            return None;
        };
        let d = *distance;
        let now = self.base + o;
        if d > now || d > self.params.window {
            return None;
        }
        self.equal(now - d, o, l).then_some(d)
    }

    fn lookup(&self, chunk: &Chunk) -> Option<usize> {
        let (o, l) = (chunk.offset, chunk.len);
        if l < self.params.min_match {
            return None;
        }
        let now = self.base + o;
        let slots = self.dict.table.get(&chunk.fingerprint)?;
        let mut best: Option<(usize, usize)> = None;

        // Most recent first, so ties keep the shortest distance.
        for slot in slots.iter().rev() {
            if slot.len != l || slot.offset >= now {
                continue;
            }
            let d = now - slot.offset;
            if d > self.params.window {
                continue;
            }
            let verified = if self.params.verify_digest {
                matches!((slot.digest, chunk.digest), (Some(a), Some(b)) if a == b)
            } else {
                self.equal(slot.offset, o, l)
            };
            if !verified {
                continue;
            }
            if self.params.candidates == 1 {
                return Some(d);
            }
            let score = l + self.forward_extent(slot.offset + l, o + l);
            if best.map_or(true, |(s, _)| score > s) {
                best = Some((score, d));
            }
        }
        best.map(|(_, d)| d)
    }

    /// Common prefix of session offset `src` and `data[dst..]`.
    fn forward_extent(&self, mut src: usize, mut dst: usize) -> usize {
        let limit = self.params.lookahead.min(self.data.len() - dst);
        let mut n = 0;
        while n < limit {
            let seg = self.tail_at(src);
            let span = seg.len().min(limit - n);
            let same = seg[..span].iter().zip(&self.data[dst..]).take_while(|(a, b)| a == b).count();
            n += same;
            if same < span || span == 0 {
                break;
            }
            src += same;
            dst += same;
        }
        n
    }

    /// Bytes before session offset `src` that equal those before `data[dst]`.
    fn backward_extent(&self, mut src: usize, mut dst: usize, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            let seg = self.head_before(src);
            let span = seg.len().min(max - n);
            let same = seg
                .iter()
                .rev()
                .zip(self.data[..dst].iter().rev())
                .take(span)
                .take_while(|(a, b)| a == b)
                .count();
            n += same;
            if same < span || span == 0 {
                break;
            }
            src -= same;
            dst -= same;
        }
        n
    }

    fn push_match(&mut self, o: usize, l: usize, d: usize) {
        let mut len = l;
        if !self.params.round_matches {
            if let Some(&Op::Literal { start, end }) = self.ops.last() {
                let k = self.backward_extent(self.base + o - d, o, end - start);
                if let Some(Op::Literal { end, .. }) = self.ops.last_mut() {
                    *end -= k;
                }
                len += k;
                if end - k == start {
                    self.ops.pop();
                }
            }
        }
        match self.ops.last_mut() {
            Some(Op::Match { distance, len: prev }) if *distance == d => *prev += len,
            _ => self.ops.push(Op::Match { distance: d, len }),
        }
    }

    fn push_literal(&mut self, start: usize, end: usize) {
        match self.ops.last_mut() {
            Some(Op::Literal { end: prev_end, .. }) => *prev_end = end,
            _ => self.ops.push(Op::Literal { start, end }),
        }
    }

    fn insert(&mut self, c: &Chunk) {
        if self.params.pass == Some(TwoPass::IndexLz) || !self.indexable(c) {
            return;
        }
        if self.params.pass == Some(TwoPass::FutureLz)
            && self.dict.counts.get(&c.fingerprint).copied().unwrap_or(0) < 2
        {
            return;
        }
        let offset = self.base + c.offset;
        let slots = self.dict.table.entry(c.fingerprint).or_default();
        slots.push_back(Slot { offset, len: c.len, digest: c.digest });
        if slots.len() > self.params.candidates {
            slots.pop_front();
        }
        self.dict.order.push_back((c.fingerprint, offset));
    }

    fn evict(&mut self, now: usize) {
        while let Some(&(fp, offset)) = self.dict.order.front() {
            if now.saturating_sub(offset) <= self.params.window {
                break;
            }
            self.dict.order.pop_front();
            if let Some(slots) = self.dict.table.get_mut(&fp) {
                slots.retain(|s| s.offset != offset);
                if slots.is_empty() {
                    self.dict.table.remove(&fp);
                }
            }
        }
    }
}

// ── Session-wide dedup ───────────────────────────────────────────────────────

/// Dictionary and history carried from block to block of one write session.
/// Blocks must be fed in session order.
pub struct SessionDedup {
    params:  FinderParams,
    dict:    Dictionary,
    history: History,
}

impl SessionDedup {
    pub fn new(cfg: &ArchiveConfig) -> Self {
        Self { params: FinderParams::from_config(cfg), dict: Dictionary::default(), history: History::new() }
    }

    /// Classify `block` against itself and every earlier block still in the
    /// window, then keep it as history.  Returns the serialized op stream.
    pub fn dedup_block(
        &mut self,
        block:  Box<dyn AsRef<[u8]> + Send>,
        chunks: &[Chunk],
        cancel: &CancellationToken,
    ) -> Result<(Vec<u8>, DedupStats)> {
        let data = (*block).as_ref();
        let dict = std::mem::take(&mut self.dict);
        let mut finder = MatchFinder::resume(data, &self.history, dict, self.params);
        if finder.needs_prepass() {
            finder.prepare(chunks);
        }
        for (i, c) in chunks.iter().enumerate() {
            check_cancel(cancel, i)?;
            finder.classify(c);
        }
        let (ops, stats, dict) = finder.finish_session();
        let op_stream = stream::encode(&ops);
        drop(ops);

        self.dict = dict;
        self.history.push(block);
        self.history.trim(self.params.window);
        log::trace!(
            "session dictionary: {} entries, {} history bytes",
            self.dict.len(),
            self.history.retained()
        );
        Ok((op_stream, stats))
    }

    pub fn history(&self) -> &History {
        &self.history
    }
}

fn check_cancel(cancel: &CancellationToken, i: usize) -> Result<()> {
    if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
        Err(ArcError::Cancelled)
    } else {
        Ok(())
    }
}

/// Split a block into chunks with the configured chunker and fingerprint.
pub fn chunk_block(data: &[u8], cfg: &ArchiveConfig, cancel: &CancellationToken) -> Result<Vec<Chunk>> {
    let fp = Fingerprinter::new(cfg.hash, cfg.precompute_digests());
    let mut chunks = Vec::with_capacity(data.len() / cfg.chunk_size.max(1) + 1);
    for (i, c) in Chunker::new(data, cfg.chunk_params(), fp).enumerate() {
        check_cancel(cancel, i)?;
        chunks.push(c);
    }
    Ok(chunks)
}

/// Classify the chunks of one block against its own dictionary.
pub fn dedup_chunks<'a>(
    data:   &'a [u8],
    chunks: &[Chunk],
    cfg:    &ArchiveConfig,
    cancel: &CancellationToken,
) -> Result<(Vec<DedupMatch<'a>>, DedupStats)> {
    let mut finder = MatchFinder::new(data, FinderParams::from_config(cfg));
    if finder.needs_prepass() {
        finder.prepare(chunks);
    }
    for (i, c) in chunks.iter().enumerate() {
        check_cancel(cancel, i)?;
        finder.classify(c);
    }
    Ok(finder.finish())
}

/// Chunk and deduplicate one solid block.
pub fn dedup_block<'a>(
    data:   &'a [u8],
    cfg:    &ArchiveConfig,
    cancel: &CancellationToken,
) -> Result<(Vec<DedupMatch<'a>>, DedupStats)> {
    let chunks = chunk_block(data, cfg, cancel)?;
    dedup_chunks(data, &chunks, cfg, cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HashKind, Method};

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

    fn cfg(method: Method) -> ArchiveConfig {
        ArchiveConfig { method, min_match: 64, chunk_size: 512, max_chunk: 4096, ..Default::default() }
    }

    fn expand(ops: &[DedupMatch<'_>]) -> Vec<u8> {
        let mut out = Vec::new();
        for op in ops {
            match *op {
                DedupMatch::Literal(b) => out.extend_from_slice(b),
                DedupMatch::Match { distance, len } => {
                    let start = out.len() - distance as usize;
                    for k in 0..len as usize {
                        out.push(out[start + k]);
                    }
                }
            }
        }
        out
    }

    fn run<'a>(data: &'a [u8], cfg: &ArchiveConfig) -> (Vec<DedupMatch<'a>>, DedupStats) {
        dedup_block(data, cfg, &CancellationToken::new()).unwrap()
    }

    #[test]
    fn test_every_method_reconstructs_input() {
        let unit = noise(30_000, 1);
        let mut data = unit.clone();
        data.extend_from_slice(&noise(5_000, 2));
        data.extend_from_slice(&unit);
        for m in 0..=5u8 {
            let cfg = cfg(Method::try_from(m).unwrap());
            let (ops, _) = run(&data, &cfg);
            assert_eq!(expand(&ops), data, "method {m}");
        }
    }

    #[test]
    fn test_repeat_becomes_one_match() {
        let unit = noise(40_000, 7);
        let data = [unit.clone(), unit].concat();
        let (ops, stats) = run(&data, &cfg(Method::GearCdc));
        assert!(stats.match_bytes >= 39_000, "{stats:?}");
        let matches: Vec<_> = ops.iter().filter(|o| o.is_match()).collect();
        assert_eq!(matches.len(), 1, "{ops:?}");
        assert!(matches!(matches[0], DedupMatch::Match { distance: 40_000, .. }));
    }

    #[test]
    fn test_ops_are_merged_and_respect_min_match() {
        let unit = noise(20_000, 3);
        let data = [unit.clone(), noise(3_000, 4), unit.clone(), unit].concat();
        let (ops, _) = run(&data, &cfg(Method::Exhaustive));
        for pair in ops.windows(2) {
            match (pair[0], pair[1]) {
                (DedupMatch::Literal(_), DedupMatch::Literal(_)) => panic!("unmerged literals"),
                (DedupMatch::Match { distance: a, .. }, DedupMatch::Match { distance: b, .. }) => {
                    assert_ne!(a, b, "unmerged matches")
                }
                _ => {}
            }
        }
        for op in &ops {
            if let DedupMatch::Match { len, .. } = op {
                assert!(*len >= 64);
            }
        }
    }

    #[test]
    fn test_window_limits_distance() {
        let unit = noise(8_000, 9);
        let data = [unit.clone(), noise(50_000, 10), unit].concat();
        let small = ArchiveConfig { dict_size: Some(16 * 1024), ..cfg(Method::GearCdc) };
        let (ops, stats) = run(&data, &small);
        assert_eq!(stats.match_bytes, 0, "{ops:?}");
        let large = ArchiveConfig { dict_size: Some(1 << 20), ..small };
        assert!(run(&data, &large).1.match_bytes > 0);
    }

    #[test]
    fn test_round_matches_skip_backward_extension() {
        let unit = noise(30_000, 12);
        let data = [unit.clone(), unit].concat();
        let cfg = cfg(Method::Digests);
        assert!(cfg.round_matches());
        let (ops, _) = run(&data, &cfg);
        assert_eq!(expand(&ops), data);
    }

    #[test]
    fn test_index_lz_finds_first_occurrence() {
        let unit = noise(10_000, 13);
        let data = [unit.clone(), unit.clone(), unit].concat();
        let cfg = ArchiveConfig { two_pass: Some(TwoPass::IndexLz), ..cfg(Method::GearCdc) };
        let (ops, stats) = run(&data, &cfg);
        assert_eq!(expand(&ops), data);
        assert!(stats.match_bytes > 15_000, "{stats:?}");
    }

    #[test]
    fn test_deterministic_ops() {
        let unit = noise(25_000, 14);
        let data = [unit.clone(), noise(1_000, 16), unit].concat();
        let a = run(&data, &cfg(Method::FutureLz)).0;
        let b = run(&data, &cfg(Method::FutureLz)).0;
        assert_eq!(a, b);
    }

    #[test]
    fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let data = noise(1000, 1);
        let err = dedup_block(&data, &cfg(Method::GearCdc), &token).unwrap_err();
        assert!(matches!(err, ArcError::Cancelled));
    }

    // ── Hand-built chunk streams ─────────────────────────────────────────────

    const PIECE: usize = 16;

    fn params(candidates: usize) -> FinderParams {
        FinderParams {
            window:        1 << 20,
            min_match:     PIECE,
            candidates,
            accel_mask:    0,
            round_matches: true,
            verify_digest: false,
            pass:          None,
            lookahead:     64,
        }
    }

    /// Uniform 16-byte pieces: (fill byte, fingerprint, digest tag).
    fn pieces(layout: &[(u8, u64, u8)]) -> (Vec<u8>, Vec<Chunk>) {
        let mut data = Vec::new();
        let mut chunks = Vec::new();
        for &(fill, fingerprint, tag) in layout {
            chunks.push(Chunk { offset: data.len(), len: PIECE, fingerprint, digest: Some([tag; 32]) });
            data.extend_from_slice(&[fill; PIECE]);
        }
        (data, chunks)
    }

    fn classify_all<'a>(data: &'a [u8], chunks: &[Chunk], params: FinderParams) -> Vec<DedupMatch<'a>> {
        let mut finder = MatchFinder::new(data, params);
        for c in chunks {
            finder.classify(c);
        }
        finder.finish().0
    }

    #[test]
    fn test_exhaustive_prefers_longest_candidate() {
        // x p x q [x p]: the older x is followed by p, so it wins.
        let (data, chunks) = pieces(&[(b'x', 1, 0), (b'p', 2, 0), (b'x', 1, 0), (b'q', 3, 0), (b'x', 1, 0), (b'p', 2, 0)]);
        let ops = classify_all(&data, &chunks, params(8));
        assert_eq!(ops.last(), Some(&DedupMatch::Match { distance: 64, len: 32 }), "{ops:?}");
        assert_eq!(expand(&ops), data);

        // One candidate per fingerprint keeps only the most recent x.
        let ops = classify_all(&data, &chunks, params(1));
        assert!(ops.contains(&DedupMatch::Match { distance: 32, len: 16 }), "{ops:?}");
    }

    #[test]
    fn test_exhaustive_tie_keeps_most_recent() {
        // x p q x p r [x p]: both earlier x are followed by p.
        let (data, chunks) = pieces(&[
            (b'x', 1, 0), (b'p', 2, 0), (b'q', 3, 0),
            (b'x', 1, 0), (b'p', 2, 0), (b'r', 4, 0),
            (b'x', 1, 0), (b'p', 2, 0),
        ]);
        let ops = classify_all(&data, &chunks, params(8));
        assert_eq!(ops.last(), Some(&DedupMatch::Match { distance: 48, len: 32 }), "{ops:?}");
        assert_eq!(expand(&ops), data);
    }

    #[test]
    fn test_equal_fingerprints_over_different_bytes_stay_literal() {
        let (data, chunks) = pieces(&[(b'a', 9, 0), (b'b', 9, 0)]);
        let ops = classify_all(&data, &chunks, params(1));
        assert_eq!(ops, vec![DedupMatch::Literal(&data[..])]);
    }

    #[test]
    fn test_crc32_fingerprints_still_verify_bytes() {
        let unit = noise(20_000, 21);
        let data = [unit.clone(), noise(2_000, 22), unit].concat();
        let cfg = ArchiveConfig { hash: HashKind::Crc32, ..cfg(Method::Exhaustive) };
        let (ops, stats) = run(&data, &cfg);
        assert_eq!(expand(&ops), data);
        assert!(stats.match_bytes > 15_000, "{stats:?}");
    }

    #[test]
    fn test_digest_mode_rejects_mismatched_digest() {
        let verify = FinderParams { verify_digest: true, ..params(1) };
        // Same bytes and fingerprint, different digest: not a match.
        let (data, chunks) = pieces(&[(b'a', 5, 1), (b'z', 6, 0), (b'a', 5, 2)]);
        let ops = classify_all(&data, &chunks, verify);
        assert!(ops.iter().all(|o| !o.is_match()), "{ops:?}");

        let (data, chunks) = pieces(&[(b'a', 5, 1), (b'z', 6, 0), (b'a', 5, 1)]);
        let ops = classify_all(&data, &chunks, verify);
        assert_eq!(ops.last(), Some(&DedupMatch::Match { distance: 32, len: 16 }));
    }

    #[test]
    fn test_accel_skips_unsampled_fingerprints() {
        let sampled = FinderParams { accel_mask: 0b11, ..params(1) };
        let (data, chunks) = pieces(&[(b'a', 0b101, 0), (b'z', 7, 0), (b'a', 0b101, 0)]);
        assert!(classify_all(&data, &chunks, sampled).iter().all(|o| !o.is_match()));

        let (data, chunks) = pieces(&[(b'a', 0b100, 0), (b'z', 7, 0), (b'a', 0b100, 0)]);
        let ops = classify_all(&data, &chunks, sampled);
        assert_eq!(ops.last(), Some(&DedupMatch::Match { distance: 32, len: 16 }));
    }

    #[test]
    fn test_accel_still_finds_repeats() {
        let unit = noise(40_000, 23);
        let data = [unit.clone(), unit].concat();
        let cfg = ArchiveConfig { accel: 2, ..cfg(Method::GearCdc) };
        let (ops, stats) = run(&data, &cfg);
        assert_eq!(expand(&ops), data);
        assert!(stats.match_bytes > 35_000, "{stats:?}");
    }

    // ── Session dictionary ───────────────────────────────────────────────────

    fn session_pass(session: &mut SessionDedup, block: Vec<u8>, cfg: &ArchiveConfig) -> (Vec<u8>, DedupStats) {
        let token = CancellationToken::new();
        let chunks = chunk_block(&block, cfg, &token).unwrap();
        session.dedup_block(Box::new(block), &chunks, &token).unwrap()
    }

    #[test]
    fn test_session_dictionary_matches_earlier_block() {
        let unit = noise(32 * 1024, 24);
        let cfg = ArchiveConfig { dict_size: Some(1 << 20), solid_block_size: unit.len(), ..cfg(Method::GearCdc) };
        assert!(cfg.session_dictionary());

        let mut session = SessionDedup::new(&cfg);
        let (first, s1) = session_pass(&mut session, unit.clone(), &cfg);
        assert_eq!(s1.match_bytes, 0);
        assert_eq!(stream::reach(&first, unit.len() as u64).unwrap(), 0);

        let (second, s2) = session_pass(&mut session, unit.clone(), &cfg);
        assert!(s2.match_bytes >= 31 * 1024, "{s2:?}");
        assert!(second.len() < 64, "{} stream bytes", second.len());
        assert_eq!(stream::reach(&second, unit.len() as u64).unwrap(), unit.len() as u64);
        let out = stream::decode_with_history(&second, unit.len() as u64, &[&unit]).unwrap();
        assert_eq!(out, unit);
        assert_eq!(session.history().retained(), 2 * unit.len());
    }

    #[test]
    fn test_session_history_is_trimmed_to_window() {
        let cfg = ArchiveConfig { dict_size: Some(24 * 1024), solid_block_size: 16 * 1024, ..cfg(Method::GearCdc) };
        let mut session = SessionDedup::new(&cfg);
        for seed in 0..5 {
            session_pass(&mut session, noise(16 * 1024, 30 + seed), &cfg);
        }
        // Last block plus the one reaching into the window.
        assert_eq!(session.history().retained(), 32 * 1024);
        assert_eq!(session.history().end(), 80 * 1024);
    }

    #[test]
    fn test_session_match_spans_block_boundary() {
        let unit = noise(24 * 1024, 25);
        let cfg = ArchiveConfig { dict_size: Some(1 << 20), solid_block_size: 16 * 1024, ..cfg(Method::GearCdc) };
        let (a, b) = unit.split_at(16 * 1024);
        let mut session = SessionDedup::new(&cfg);
        session_pass(&mut session, a.to_vec(), &cfg);
        session_pass(&mut session, b.to_vec(), &cfg);

        let (third, stats) = session_pass(&mut session, unit.clone(), &cfg);
        assert!(stats.match_bytes >= 23 * 1024, "{stats:?}");
        let out = stream::decode_with_history(&third, unit.len() as u64, &[a, b]).unwrap();
        assert_eq!(out, unit);
    }
}
