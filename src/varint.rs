//! Variable-length integers and NUL-terminated strings.
//!
//! # Varint layout
//! A value occupies 1–9 bytes.  Bytes 1–8 each carry 7 payload bits,
//! least-significant group first, with the high bit set when another byte
//! follows.  If the eighth byte still has its continuation bit set, a ninth
//! byte carries the remaining 8 bits verbatim, so `u64::MAX` fits in 9 bytes.
//!
//! ```text
//!   0x00..=0x7f          -> 1 byte
//!   0x80..=0x3fff        -> 2 bytes
//!   ...
//!   >= 1 << 56           -> 9 bytes
//! ```

use byteorder::ReadBytesExt;
use std::io::{self, Read, Write};

use crate::error::{ArcError, FormatError};

pub const MAX_VARINT_LEN: usize = 9;

/// Upper bound on a stored string.  Names and method strings are short;
/// anything longer is treated as corruption rather than allocated.
pub const MAX_STRINGZ_LEN: usize = 64 * 1024;

/// Append the encoding of `value` to `out`.  Returns the number of bytes written.
pub fn encode_varint(mut value: u64, out: &mut Vec<u8>) -> usize {
    for i in 0..8 {
        if value < 0x80 {
            out.push(value as u8);
            return i + 1;
        }
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
    MAX_VARINT_LEN
}

/// Encoded length of `value` without producing it.
pub fn varint_len(value: u64) -> usize {
    let mut v = value;
    for i in 0..8 {
        if v < 0x80 {
            return i + 1;
        }
        v >>= 7;
    }
    MAX_VARINT_LEN
}

/// Decode a varint from the front of `data`.  Returns `(value, bytes_consumed)`.
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize), FormatError> {
    let mut value = 0u64;
    for i in 0..8 {
        let b = *data.get(i).ok_or(FormatError::Truncated("varint"))?;
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    let last = *data.get(8).ok_or(FormatError::Truncated("varint"))?;
    value |= u64::from(last) << 56;
    Ok((value, MAX_VARINT_LEN))
}

pub fn write_varint<W: Write + ?Sized>(writer: &mut W, value: u64) -> io::Result<usize> {
    let mut buf = Vec::with_capacity(MAX_VARINT_LEN);
    let n = encode_varint(value, &mut buf);
    writer.write_all(&buf)?;
    Ok(n)
}

pub fn read_varint<R: Read + ?Sized>(reader: &mut R) -> Result<u64, ArcError> {
    let mut value = 0u64;
    for i in 0..8 {
        let b = reader.read_u8().map_err(|e| eof_as(e, "varint"))?;
        value |= u64::from(b & 0x7f) << (7 * i);
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }
    let last = reader.read_u8().map_err(|e| eof_as(e, "varint"))?;
    Ok(value | u64::from(last) << 56)
}

/// Write `s` followed by a single NUL.  Interior NULs are rejected.
pub fn write_stringz<W: Write + ?Sized>(writer: &mut W, s: &str) -> io::Result<usize> {
    if s.as_bytes().contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("string contains an interior NUL: {s:?}"),
        ));
    }
    writer.write_all(s.as_bytes())?;
    writer.write_all(&[0])?;
    Ok(s.len() + 1)
}

pub fn read_stringz<R: Read + ?Sized>(reader: &mut R) -> Result<String, ArcError> {
    let mut bytes = Vec::new();
    loop {
        let b = reader.read_u8().map_err(|e| eof_as(e, "string"))?;
        if b == 0 {
            break;
        }
        if bytes.len() == MAX_STRINGZ_LEN {
            return Err(FormatError::Corrupt("unterminated string".into()).into());
        }
        bytes.push(b);
    }
    String::from_utf8(bytes)
        .map_err(|_| FormatError::Corrupt("string is not valid UTF-8".into()).into())
}

/// Map an unexpected EOF to a truncation error; anything else stays I/O.
pub(crate) fn eof_as(e: io::Error, what: &'static str) -> ArcError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FormatError::Truncated(what).into()
    } else {
        ArcError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encoding_sizes() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(16383), 2);
        assert_eq!(varint_len(16384), 3);
        assert_eq!(varint_len((1 << 56) - 1), 8);
        assert_eq!(varint_len(1 << 56), 9);
        assert_eq!(varint_len(u64::MAX), 9);
    }

    #[test]
    fn test_known_bytes() {
        let mut out = Vec::new();
        encode_varint(300, &mut out);
        assert_eq!(out, [0xac, 0x02]);

        out.clear();
        encode_varint(u64::MAX, &mut out);
        assert_eq!(out, [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_slice_and_stream_agree() {
        let values = [0u64, 1, 127, 128, 300, 1 << 35, (1 << 56) + 7, u64::MAX];
        let mut buf = Vec::new();
        for v in values {
            encode_varint(v, &mut buf);
        }
        let mut cur = Cursor::new(&buf);
        let mut pos = 0;
        for v in values {
            let (decoded, used) = decode_varint(&buf[pos..]).unwrap();
            assert_eq!(decoded, v);
            pos += used;
            assert_eq!(read_varint(&mut cur).unwrap(), v);
        }
        assert_eq!(pos, buf.len());
    }

    #[test]
    fn test_truncated_varint() {
        assert!(matches!(decode_varint(&[0x80, 0x80]), Err(FormatError::Truncated(_))));
        let err = read_varint(&mut Cursor::new(vec![0xffu8; 3])).unwrap_err();
        assert!(err.is_format());
    }

    #[test]
    fn test_stringz() {
        let mut buf = Vec::new();
        write_stringz(&mut buf, "dedup:m2+zstd:3").unwrap();
        write_stringz(&mut buf, "").unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_stringz(&mut cur).unwrap(), "dedup:m2+zstd:3");
        assert_eq!(read_stringz(&mut cur).unwrap(), "");
        assert!(write_stringz(&mut Vec::new(), "a\0b").is_err());
    }
}
