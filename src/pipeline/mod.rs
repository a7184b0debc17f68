//! Background compression pipeline.
//!
//! ```text
//!  caller thread          rayon pool (N workers)           "dedarc-writer"
//!  ─────────────          ──────────────────────           ───────────────
//!  accumulate block ──▶ [bounded 2N] ──▶ chunk → dedup ──▶ [bounded 2N] ──▶ reorder by seq
//!                                        → compress                         → write FIFO
//!                                        → encrypt
//! ```
//!
//! When the dictionary window is larger than a solid block, chunking and
//! dedup move to one "dedarc-dedup" thread in front of the pool.  It sees
//! blocks in session order and matches them against everything before them;
//! the workers only compress and encrypt the op streams it hands on.
//!
//! The writer thread owns the sink until [`Pipeline::finish`] hands it back
//! together with the table of flushed blocks.  A failing worker raises the
//! shared abort flag; the writer stops writing at that point, so everything
//! already on disk stays a valid prefix of the session.

pub mod solid;

use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::BTreeMap;
use std::io::{self, Seek, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::block::{BlockKind, CompressionMethod, EncodedBlock, LocalDescriptor};
use crate::codec::get_codec;
use crate::config::ArchiveConfig;
use crate::crypto::EncryptionContext;
use crate::dedup::{chunk_block, dedup_chunks, stream, DedupStats, SessionDedup};
use crate::error::{ArcError, Result};
use crate::index::BlockInfo;
use solid::{BlockState, SolidBlock};

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cooperative cancellation flag, cheap to clone and share across threads.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ── Messages ─────────────────────────────────────────────────────────────────

/// Work handed to the pool.
enum Job {
    /// Runs every stage on the worker.
    Raw(SolidBlock),
    /// Already classified against the session dictionary.
    Classified(ClassifiedBlock),
}

struct ClassifiedBlock {
    seq:       u64,
    orig_size: u64,
    crc32:     u32,
    op_stream: Vec<u8>,
}

struct SealedBlock {
    seq:   u64,
    block: EncodedBlock,
}

/// What the writer thread hands back when the pipeline shuts down.
pub struct PipelineOutcome<W> {
    pub sink:    W,
    /// Blocks written, in session order.
    pub flushed: Vec<BlockInfo>,
    /// First failure, if any.  `Cancelled` when the session was cancelled.
    pub error:   Option<ArcError>,
}

struct WorkerContext {
    cfg:        Arc<ArchiveConfig>,
    encryption: Option<Arc<EncryptionContext>>,
    cancel:     CancellationToken,
    abort:      CancellationToken,
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct Pipeline<W: Write + Seek + Send + 'static> {
    work_tx: Option<Sender<Job>>,
    dedup:   Option<JoinHandle<()>>,
    writer:  Option<JoinHandle<PipelineOutcome<W>>>,
    pool:    Option<rayon::ThreadPool>,
    abort:   CancellationToken,
    cancel:  CancellationToken,
}

impl<W: Write + Seek + Send + 'static> Pipeline<W> {
    /// Spawn the worker pool and the writer thread.  New blocks are written
    /// at the sink's current position.
    pub fn start(
        sink:       W,
        cfg:        Arc<ArchiveConfig>,
        encryption: Option<Arc<EncryptionContext>>,
        cancel:     CancellationToken,
    ) -> Result<Self> {
        let threads = cfg.worker_threads();
        let abort = CancellationToken::new();

        let (work_tx, work_rx) = bounded::<Job>(threads * 2);
        let (sealed_tx, sealed_rx) = bounded::<Result<SealedBlock>>(threads * 2);

        let writer = thread::Builder::new().name("dedarc-writer".to_string()).spawn({
            let abort = abort.clone();
            let cancel = cancel.clone();
            move || write_blocks(sink, sealed_rx, abort, cancel)
        })?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("dedarc-worker-{i}"))
            .build()
            .map_err(|e| ArcError::Config(format!("failed to create worker pool: {e}")))?;

        let session = cfg.session_dictionary();
        let ctx = Arc::new(WorkerContext { cfg, encryption, cancel: cancel.clone(), abort: abort.clone() });
        let (dedup, pool_rx) = if session {
            let (job_tx, job_rx) = bounded::<Job>(threads * 2);
            let handle = thread::Builder::new().name("dedarc-dedup".to_string()).spawn({
                let tx = sealed_tx.clone();
                let ctx = Arc::clone(&ctx);
                move || dedup_loop(work_rx, job_tx, tx, ctx)
            })?;
            (Some(handle), job_rx)
        } else {
            (None, work_rx)
        };
        for _ in 0..threads {
            let rx = pool_rx.clone();
            let tx = sealed_tx.clone();
            let ctx = Arc::clone(&ctx);
            pool.spawn(move || worker_loop(rx, tx, ctx));
        }
        log::debug!(
            "pipeline started: {threads} workers, queue depth {}, {} dictionary",
            threads * 2,
            if session { "session" } else { "per-block" }
        );

        Ok(Self { work_tx: Some(work_tx), dedup, writer: Some(writer), pool: Some(pool), abort, cancel })
    }

    /// Hand a sealed-for-writing block to the workers.  Blocks while the
    /// queue is full.  Returns `false` once the session is cancelled or has
    /// failed; the caller should stop feeding and call [`Pipeline::finish`].
    pub fn submit(&self, block: SolidBlock) -> bool {
        if self.is_stopping() {
            return false;
        }
        log::trace!("block {}: queued ({} bytes, {} files)", block.seq, block.len(), block.files);
        let Some(tx) = &self.work_tx else { return false };
        tx.send(Job::Raw(block)).is_ok()
    }

    pub fn is_stopping(&self) -> bool {
        self.abort.is_cancelled() || self.cancel.is_cancelled()
    }

    /// Close the queue, wait for all workers and the writer, and hand back
    /// the sink with the flushed block table.
    pub fn finish(mut self) -> Result<PipelineOutcome<W>> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<PipelineOutcome<W>> {
        drop(self.work_tx.take());
        if let Some(handle) = self.dedup.take() {
            handle
                .join()
                .map_err(|_| ArcError::Io(io::Error::new(io::ErrorKind::Other, "dedup thread panicked")))?;
        }
        let outcome = match self.writer.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| ArcError::Io(io::Error::new(io::ErrorKind::Other, "writer thread panicked")))?,
            None => return Err(ArcError::Io(io::Error::new(io::ErrorKind::Other, "pipeline already finished"))),
        };
        drop(self.pool.take());
        Ok(outcome)
    }
}

impl<W: Write + Seek + Send + 'static> Drop for Pipeline<W> {
    fn drop(&mut self) {
        if self.writer.is_some() {
            self.abort.cancel();
            let _ = self.shutdown();
        }
    }
}

// ── Workers ──────────────────────────────────────────────────────────────────

fn worker_loop(rx: Receiver<Job>, tx: Sender<Result<SealedBlock>>, ctx: Arc<WorkerContext>) {
    for job in rx.iter() {
        let stopping = ctx.abort.is_cancelled() || ctx.cancel.is_cancelled();
        let result = match job {
            Job::Raw(block) if stopping => {
                log::debug!("block {}: dropped before processing", block.seq);
                continue;
            }
            Job::Classified(block) if stopping => {
                log::debug!("block {}: dropped before compression", block.seq);
                continue;
            }
            Job::Raw(mut block) => {
                let seq = block.seq;
                match seal_block(&mut block, &ctx) {
                    Err(ArcError::Cancelled) => {
                        log::debug!("block {seq}: cancelled during {}", block.state());
                        continue;
                    }
                    Err(e) => {
                        log::error!("block {seq}: {} -> {}: {e}", block.state(), BlockState::Failed);
                        block.set_state(BlockState::Failed);
                        Err(e)
                    }
                    Ok(encoded) => Ok(SealedBlock { seq, block: encoded }),
                }
            }
            Job::Classified(block) => {
                let seq = block.seq;
                match pack_stream(seq, block.op_stream, block.orig_size, block.crc32, &ctx) {
                    Err(e) => {
                        log::error!("block {seq}: {} -> {}: {e}", BlockState::Compressing, BlockState::Failed);
                        Err(e)
                    }
                    Ok(encoded) => Ok(SealedBlock { seq, block: encoded }),
                }
            }
        };
        if result.is_err() {
            ctx.abort.cancel();
        }
        if tx.send(result).is_err() {
            break;
        }
    }
}

/// Classify blocks in session order against one shared dictionary and hand
/// the op streams to the pool.
fn dedup_loop(rx: Receiver<Job>, jobs: Sender<Job>, sealed: Sender<Result<SealedBlock>>, ctx: Arc<WorkerContext>) {
    let mut session = SessionDedup::new(&ctx.cfg);
    for job in rx.iter() {
        let mut block = match job {
            Job::Raw(block) => block,
            classified => {
                if jobs.send(classified).is_err() {
                    break;
                }
                continue;
            }
        };
        if ctx.abort.is_cancelled() || ctx.cancel.is_cancelled() {
            log::debug!("block {}: dropped before dedup", block.seq);
            continue;
        }
        let seq = block.seq;
        let orig_size = block.len() as u64;
        let crc32 = crc32fast::hash(block.data());

        block.set_state(BlockState::Chunking);
        let chunks = match chunk_block(block.data(), &ctx.cfg, &ctx.cancel) {
            Ok(chunks) => chunks,
            Err(e) => {
                fail_dedup(&mut block, e, &sealed, &ctx);
                continue;
            }
        };
        block.set_state(BlockState::Deduplicating);
        // The block itself becomes history; the next one matches against it.
        match session.dedup_block(Box::new(block), &chunks, &ctx.cancel) {
            Ok((op_stream, stats)) => {
                log_stats(seq, &stats);
                let job = Job::Classified(ClassifiedBlock { seq, orig_size, crc32, op_stream });
                if jobs.send(job).is_err() {
                    break;
                }
            }
            Err(ArcError::Cancelled) => log::debug!("block {seq}: cancelled during dedup"),
            Err(e) => {
                log::error!("block {seq}: {} -> {}: {e}", BlockState::Deduplicating, BlockState::Failed);
                ctx.abort.cancel();
                let _ = sealed.send(Err(e));
            }
        }
    }
}

fn fail_dedup(block: &mut SolidBlock, e: ArcError, sealed: &Sender<Result<SealedBlock>>, ctx: &WorkerContext) {
    if matches!(e, ArcError::Cancelled) {
        log::debug!("block {}: cancelled during {}", block.seq, block.state());
        return;
    }
    log::error!("block {}: {} -> {}: {e}", block.seq, block.state(), BlockState::Failed);
    block.set_state(BlockState::Failed);
    ctx.abort.cancel();
    let _ = sealed.send(Err(e));
}

fn log_stats(seq: u64, stats: &DedupStats) {
    log::debug!(
        "block {seq}: {} chunks, {} matched, {} literal / {} matched bytes",
        stats.chunks, stats.matched_chunks, stats.literal_bytes, stats.match_bytes
    );
}

/// Run one block through chunk → dedup → codec → (encrypt).
fn seal_block(block: &mut SolidBlock, ctx: &WorkerContext) -> Result<EncodedBlock> {
    let cfg = &*ctx.cfg;

    block.set_state(BlockState::Chunking);
    let chunks = chunk_block(block.data(), cfg, &ctx.cancel)?;

    block.set_state(BlockState::Deduplicating);
    let (ops, stats) = dedup_chunks(block.data(), &chunks, cfg, &ctx.cancel)?;
    log_stats(block.seq, &stats);
    let op_stream = stream::encode(&ops);
    drop(ops);

    block.set_state(BlockState::Compressing);
    let data = block.data();
    let encoded = pack_stream(block.seq, op_stream, data.len() as u64, crc32fast::hash(data), ctx)?;
    block.set_state(BlockState::Sealed);
    Ok(encoded)
}

/// Codec and encryption stages for an op stream.
fn pack_stream(seq: u64, op_stream: Vec<u8>, orig_size: u64, crc32: u32, ctx: &WorkerContext) -> Result<EncodedBlock> {
    let cfg = &*ctx.cfg;
    let stage = cfg.codec_stage();
    let compressed = get_codec(stage.codec).compress(&op_stream, stage.level)?;
    drop(op_stream);

    let (payload, enc_method) = match &ctx.encryption {
        Some(enc) => {
            log::debug!("block {seq}: {} -> {}", BlockState::Compressing, BlockState::Encrypting);
            enc.seal(seq, &compressed)?
        }
        None => (compressed, String::new()),
    };

    Ok(EncodedBlock {
        descriptor: LocalDescriptor {
            kind:        BlockKind::Data,
            comp_size:   payload.len() as u64,
            orig_size,
            comp_method: CompressionMethod::Dedup { method: cfg.method, stage }.to_string(),
            enc_method,
            crc32,
        },
        payload,
    })
}

// ── Writer ───────────────────────────────────────────────────────────────────

fn write_blocks<W: Write + Seek>(
    mut sink: W,
    rx:       Receiver<Result<SealedBlock>>,
    abort:    CancellationToken,
    cancel:   CancellationToken,
) -> PipelineOutcome<W> {
    let mut pending = BTreeMap::<u64, EncodedBlock>::new();
    let mut flushed = Vec::new();
    let mut next_seq = 0u64;
    let mut error: Option<ArcError> = None;

    let mut position = match sink.stream_position() {
        Ok(p) => p,
        Err(e) => {
            abort.cancel();
            return PipelineOutcome { sink, flushed, error: Some(e.into()) };
        }
    };

    // Keep draining after a failure so blocked workers can exit.
    for item in rx {
        match item {
            Ok(sealed) if error.is_none() => {
                pending.insert(sealed.seq, sealed.block);
            }
            Ok(_) => {}
            Err(e) => {
                abort.cancel();
                error.get_or_insert(e);
            }
        }
        if error.is_some() || cancel.is_cancelled() {
            continue;
        }

        while let Some(block) = pending.remove(&next_seq) {
            match block.write_to(&mut sink) {
                Ok(written) => {
                    flushed.push(BlockInfo {
                        offset:    position,
                        comp_size: block.descriptor.comp_size,
                        orig_size: block.descriptor.orig_size,
                    });
                    log::debug!(
                        "block {next_seq}: {} -> {} at offset {position} ({} -> {} bytes)",
                        BlockState::Sealed,
                        BlockState::Flushed,
                        block.descriptor.orig_size,
                        block.descriptor.comp_size
                    );
                    position += written;
                    next_seq += 1;
                }
                Err(e) => {
                    abort.cancel();
                    error = Some(e.into());
                    break;
                }
            }
        }
    }

    if error.is_none() {
        if let Err(e) = sink.flush() {
            error = Some(e.into());
        }
    }
    if error.is_none() && cancel.is_cancelled() {
        error = Some(ArcError::Cancelled);
    }
    if error.is_none() && !pending.is_empty() {
        // A worker dropped a block without reporting; should not happen.
        error = Some(ArcError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("pipeline ended with {} unwritten blocks", pending.len()),
        )));
    }
    PipelineOutcome { sink, flushed, error }
}
