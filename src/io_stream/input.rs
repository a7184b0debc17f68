//! Memory-mapped file input for `add_path`.

use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::path::Path;

pub enum InputData {
    Mmap(Mmap),
    Buffer(Vec<u8>),
}

impl InputData {
    /// Map `path` read-only.  Zero-length files are never mapped.
    pub fn map(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(InputData::Buffer(Vec::new()));
        }
        // SAFETY: the mapping is read-only and dropped before `add_path`
        // returns; the archive never writes to its inputs.
        let map = unsafe { Mmap::map(&file)? };
        Ok(InputData::Mmap(map))
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            InputData::Mmap(map) => map,
            InputData::Buffer(buf) => buf,
        }
    }
}
