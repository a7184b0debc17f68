//! Path-based entry points, the primary embedding surface.
//!
//! ```no_run
//! use dedarc::archive::{begin_archive, list_entries, extract_entry};
//! use dedarc::config::ArchiveConfig;
//!
//! // Write
//! let mut w = begin_archive("out.arc", ArchiveConfig::default())?;
//! w.add_file("readme.txt", &b"Hello, world!"[..])?;
//! w.finalize()?;
//!
//! // Read
//! for e in list_entries("out.arc")? {
//!     println!("{} {}", e.name, e.size);
//! }
//! let mut out = Vec::new();
//! extract_entry("out.arc", "readme.txt", &mut out, None)?;
//! assert_eq!(out, b"Hello, world!");
//! # Ok::<(), dedarc::ArcError>(())
//! ```

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::Path;

use crate::config::ArchiveConfig;
use crate::error::Result;
use crate::index::EntryInfo;
use crate::io_stream::{ArchiveReader, ArchiveWriter, ExtractReport};

pub type FileReader = ArchiveReader<BufReader<File>>;

/// Create (or truncate) `path` and start a write session.
pub fn begin_archive<P: AsRef<Path>>(path: P, cfg: ArchiveConfig) -> Result<ArchiveWriter<File>> {
    cfg.validate()?;
    ArchiveWriter::begin(File::create(path)?, cfg)
}

/// Reopen a finalized archive for another session.  Fails with
/// [`ArcError::Locked`](crate::ArcError::Locked) on locked archives.
pub fn append_archive<P: AsRef<Path>>(path: P, cfg: ArchiveConfig) -> Result<ArchiveWriter<File>> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    ArchiveWriter::append(file, cfg)
}

/// Open strictly: the footer must sit in the trailing window.
pub fn open_archive<P: AsRef<Path>>(path: P, password: Option<&str>) -> Result<FileReader> {
    ArchiveReader::open(BufReader::new(File::open(path)?), password)
}

/// Like [`open_archive`], falling back to an earlier session footer when the
/// newest one is missing.  The one-shot helpers below open this way, so an
/// interrupted append still lists and extracts the previous session.
pub fn open_archive_recovering<P: AsRef<Path>>(path: P, password: Option<&str>) -> Result<FileReader> {
    ArchiveReader::open_recovering(BufReader::new(File::open(path)?), password)
}

pub fn list_entries<P: AsRef<Path>>(path: P) -> Result<Vec<EntryInfo>> {
    Ok(open_archive_recovering(path, None)?.list())
}

pub fn extract_entry<P, W>(path: P, name: &str, sink: &mut W, password: Option<&str>) -> Result<()>
where
    P: AsRef<Path>,
    W: Write + ?Sized,
{
    open_archive_recovering(path, password)?.extract_entry(name, sink)?;
    Ok(())
}

pub fn extract_all<P: AsRef<Path>, D: AsRef<Path>>(path: P, dest: D, password: Option<&str>) -> Result<ExtractReport> {
    open_archive_recovering(path, password)?.extract_all(dest)
}
