pub mod error;
pub mod varint;
pub mod config;
pub mod codec;
pub mod cdc;
pub mod dedup;
pub mod crypto;
pub mod superblock;
pub mod block;
pub mod footer;
pub mod index;
pub mod pipeline;
pub mod io_stream;
pub mod recovery;
pub mod archive;

pub use archive::{append_archive, begin_archive, extract_all, extract_entry, list_entries, open_archive};
pub use codec::{get_codec, CodecId};
pub use config::{ArchiveConfig, Method};
pub use error::{ArcError, FormatError, ResourceError, Result};
pub use index::EntryInfo;
pub use io_stream::{ArchiveReader, ArchiveWriter, ExtractReport, VerifyReport};
pub use pipeline::CancellationToken;
