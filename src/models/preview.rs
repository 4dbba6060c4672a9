//! Archive listing returned alongside object info.

use serde::Serialize;

/// One content entry inside a stored archive.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Entry path as recorded in the archive directory.
    pub name: String,

    /// Uncompressed size in bytes.
    pub size: u64,
}

/// Bounded view of an archive's entries.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ArchivePreview {
    pub entries: Vec<ArchiveEntry>,

    /// More content entries exist beyond `entries`.
    pub truncated: bool,
}
