//! Serialized form of a block's dedup ops.
//!
//! ```text
//! record  := varint(len << 1 | is_match) body
//! body    := <len literal bytes>            if is_match == 0
//!          | varint(distance)               if is_match == 1
//! ```
//!
//! The stream is handed to the codec stage afterwards; it is never stored raw
//! unless the codec is `storing`.
//!
//! Distances count back through the write session, not just the block.  A
//! distance larger than the output produced so far reaches into the blocks
//! written before this one; [`reach`] tells a reader how many of those bytes
//! it has to supply to [`decode_with_history`].

use crate::error::FormatError;
use crate::varint::{decode_varint, encode_varint, varint_len};

use super::DedupMatch;

/// Upper bound for the initial output allocation; a corrupt `orig_size`
/// must not trigger a huge reservation before the stream proves it.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Longest op stream a block of `orig_size` bytes can need.  A literal byte
/// costs at most two stream bytes and a match of `MIN_MATCH_FLOOR` or more
/// bytes costs at most twenty.
pub fn max_stream_len(orig_size: u64) -> u64 {
    orig_size.saturating_mul(3).saturating_add(64)
}

pub fn encoded_len(ops: &[DedupMatch<'_>]) -> usize {
    ops.iter()
        .map(|op| match op {
            DedupMatch::Literal(b) => varint_len((b.len() as u64) << 1) + b.len(),
            DedupMatch::Match { distance, len } => varint_len(len << 1 | 1) + varint_len(*distance),
        })
        .sum()
}

pub fn encode(ops: &[DedupMatch<'_>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_len(ops));
    for op in ops {
        match op {
            DedupMatch::Literal(bytes) => {
                encode_varint((bytes.len() as u64) << 1, &mut out);
                out.extend_from_slice(bytes);
            }
            DedupMatch::Match { distance, len } => {
                encode_varint(len << 1 | 1, &mut out);
                encode_varint(*distance, &mut out);
            }
        }
    }
    out
}

/// One parsed record header.
enum Record<'s> {
    Literal(&'s [u8]),
    Match { distance: u64, len: u64 },
}

/// Parse the record at `*pos`, checking it against the bytes produced so far.
fn next_record<'s>(stream: &'s [u8], pos: &mut usize, produced: u64, orig_size: u64) -> Result<Record<'s>, FormatError> {
    let (tag, used) = decode_varint(&stream[*pos..])?;
    *pos += used;
    let len = tag >> 1;
    if len == 0 {
        return Err(FormatError::Corrupt(format!("zero-length record at stream offset {}", *pos - used)));
    }
    if produced + len > orig_size {
        return Err(FormatError::Corrupt(format!("record of {len} bytes overruns block size {orig_size}")));
    }
    if tag & 1 == 0 {
        let end = pos.checked_add(len as usize).filter(|&e| e <= stream.len());
        let end = end.ok_or(FormatError::Truncated("literal run"))?;
        let bytes = &stream[*pos..end];
        *pos = end;
        return Ok(Record::Literal(bytes));
    }
    let (distance, used) = decode_varint(&stream[*pos..])?;
    *pos += used;
    if distance == 0 {
        return Err(FormatError::Corrupt(format!("zero match distance at {produced}")));
    }
    Ok(Record::Match { distance, len })
}

/// Bytes before the block start that the stream refers to; 0 for a
/// self-contained block.
pub fn reach(stream: &[u8], orig_size: u64) -> Result<u64, FormatError> {
    let mut pos = 0;
    let mut produced = 0u64;
    let mut reach = 0u64;
    while pos < stream.len() {
        match next_record(stream, &mut pos, produced, orig_size)? {
            Record::Literal(bytes) => produced += bytes.len() as u64,
            Record::Match { distance, len } => {
                reach = reach.max(distance.saturating_sub(produced));
                produced += len;
            }
        }
    }
    Ok(reach)
}

/// Expand a serialized op stream of a self-contained block.  The result is
/// exactly `orig_size` bytes.
pub fn decode(stream: &[u8], orig_size: u64) -> Result<Vec<u8>, FormatError> {
    decode_with_history(stream, orig_size, &[])
}

/// Expand an op stream whose matches may reach into earlier blocks.
///
/// `history` holds the bytes right before this block, oldest segment first;
/// together they must cover at least [`reach`] bytes.
pub fn decode_with_history(stream: &[u8], orig_size: u64, history: &[&[u8]]) -> Result<Vec<u8>, FormatError> {
    let history_len: u64 = history.iter().map(|h| h.len() as u64).sum();
    let mut out: Vec<u8> = Vec::with_capacity(orig_size.min(MAX_PREALLOC) as usize);
    let mut pos = 0;

    while pos < stream.len() {
        match next_record(stream, &mut pos, out.len() as u64, orig_size)? {
            Record::Literal(bytes) => out.extend_from_slice(bytes),
            Record::Match { distance, len } => {
                let produced = out.len() as u64;
                if distance > produced + history_len {
                    return Err(FormatError::Corrupt(format!(
                        "match distance {distance} reaches past the available {} bytes (at {produced})",
                        produced + history_len
                    )));
                }
                let mut len = len as usize;
                if distance > produced {
                    // Leading part comes from earlier blocks.
                    let back = distance - produced;
                    let from_history = back.min(len as u64);
                    copy_history(history, history_len - back, from_history as usize, &mut out);
                    len -= from_history as usize;
                    if len == 0 {
                        continue;
                    }
                }
                // Source now lies in this block, `distance` bytes back.
                let start = out.len() - distance as usize;
                if distance as usize >= len {
                    out.extend_from_within(start..start + len);
                } else {
                    // Overlapping copy repeats the last `distance` bytes.
                    for k in 0..len {
                        let b = out[start + k];
                        out.push(b);
                    }
                }
            }
        }
    }

    if out.len() as u64 != orig_size {
        return Err(FormatError::Corrupt(format!(
            "op stream produced {} bytes, block declares {orig_size}",
            out.len()
        )));
    }
    Ok(out)
}

/// Append `len` bytes of the concatenated `history` starting at `from`.
fn copy_history(history: &[&[u8]], mut from: u64, mut len: usize, out: &mut Vec<u8>) {
    for seg in history {
        if len == 0 {
            break;
        }
        let seg_len = seg.len() as u64;
        if from >= seg_len {
            from -= seg_len;
            continue;
        }
        let start = from as usize;
        let n = len.min(seg.len() - start);
        out.extend_from_slice(&seg[start..start + n]);
        len -= n;
        from = 0;
    }
}
