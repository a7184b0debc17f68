//! Recovery tooling for damaged or interrupted archives.
//!
//! Archives carry one directory per write session, each linked to its
//! predecessor through the footer.  When the newest footer is missing the
//! [`scanner`] walks the block stream and finds the earlier ones.

pub mod scanner;

pub use scanner::{
    extract_recoverable, scan, scan_file, BlockHealth, FooterRecord, RecoveryQuality, RecoveryReport,
    ScannedBlock,
};
