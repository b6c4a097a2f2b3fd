//! # Data Models
//!
//! SeaORM entities for the engine's own tracking tables, plus typed records
//! for rows read from the host application's tables.

use std::fmt;

pub mod asset_map;
pub mod host;
pub mod person_map;
pub mod record_failure;
pub mod skipped_source;

pub use asset_map::Entity as AssetMap;
pub use person_map::Entity as PersonMap;
pub use record_failure::Entity as RecordFailure;
pub use skipped_source::Entity as SkippedSource;

/// Why a source asset was put on the skip list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The target owner already owns byte-identical content.
    DuplicateChecksum,
    /// The target owner has an upload with the same file stem and capture time.
    DuplicateFilename,
    /// Transient failures reached the configured ceiling.
    MaxAttempts,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DuplicateChecksum => "duplicate_checksum",
            Self::DuplicateFilename => "duplicate_filename",
            Self::MaxAttempts => "max_attempts",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
