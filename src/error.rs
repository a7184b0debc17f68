//! Crate-wide error taxonomy.
//!
//! Every public operation returns [`ArcError`].  The variants follow the
//! failure classes a caller has to tell apart:
//!
//! | Variant          | Meaning                                              |
//! |------------------|------------------------------------------------------|
//! | `Format`         | not this format, or the data is corrupt (CRC, footer) |
//! | `Authentication` | wrong password or tampered ciphertext                 |
//! | `Resource`       | memory pre-check failed; retry with smaller limits    |
//! | `Io`             | the underlying source/sink failed                     |
//! | `Cancelled`      | cooperative abort was requested                       |

use std::io;
use thiserror::Error;

use crate::block::LocalDescriptor;
use crate::codec::CodecError;
use crate::crypto::CryptoError;

pub type Result<T, E = ArcError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum ArcError {
    #[error("format error: {0}")]
    Format(#[from] FormatError),
    #[error("authentication failed for block at offset {offset}: wrong password or tampered data")]
    Authentication { offset: u64 },
    #[error("{0}")]
    Resource(#[from] ResourceError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("operation cancelled")]
    Cancelled,
    #[error("entry not found: {0}")]
    NotFound(String),
    #[error("archive is locked against modification")]
    Locked,
    #[error("block at offset {offset} is encrypted but no password was supplied")]
    PasswordRequired { offset: u64 },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ArcError {
    pub fn is_format(&self) -> bool {
        matches!(self, ArcError::Format(_))
    }

    pub fn is_authentication(&self) -> bool {
        matches!(self, ArcError::Authentication { .. })
    }
}

/// Structural problems with the container or a block payload.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("invalid archive signature {0:02x?}")]
    BadSignature([u8; 4]),
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u8),
    #[error("no valid footer found in the trailing {0} bytes")]
    FooterNotFound(u64),
    #[error("truncated {0}")]
    Truncated(&'static str),
    #[error("unknown block kind {0:#04x}")]
    UnknownBlockKind(u8),
    #[error("unknown method '{0}'")]
    UnknownMethod(String),
    #[error("CRC mismatch in block at offset {offset}: stored {:08x}, computed {actual:08x}", .descriptor.crc32)]
    CrcMismatch {
        offset:     u64,
        descriptor: Box<LocalDescriptor>,
        actual:     u32,
    },
    #[error("size mismatch in block at offset {offset}: expected {expected}, got {actual}")]
    SizeMismatch { offset: u64, expected: u64, actual: u64 },
    #[error("codec failure: {0}")]
    Codec(#[from] CodecError),
    #[error("corrupt data: {0}")]
    Corrupt(String),
}

/// A memory pre-check failed before anything was allocated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("insufficient memory for {what}: {required} bytes required, {available} bytes available")]
pub struct ResourceError {
    pub what:      &'static str,
    pub required:  u64,
    pub available: u64,
}

impl From<CodecError> for ArcError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(io) => ArcError::Io(io),
            other => ArcError::Format(FormatError::Codec(other)),
        }
    }
}

impl From<CryptoError> for ArcError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::DecryptionFailed { offset } => ArcError::Authentication { offset },
            CryptoError::MissingKey { offset } => ArcError::PasswordRequired { offset },
            CryptoError::BadMethod(m) => ArcError::Format(FormatError::UnknownMethod(m)),
            e @ CryptoError::UnusableKdf { .. } => ArcError::Format(FormatError::Corrupt(e.to_string())),
            CryptoError::KdfMemory { required, available, .. } => {
                ArcError::Resource(ResourceError { what: "key derivation", required, available })
            }
            other => ArcError::Config(other.to_string()),
        }
    }
}
