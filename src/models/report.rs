//! Reports attached to a task: consistency results and exported artifacts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use super::{IdentityKey, KeyColumns};

/// Result of comparing the identity keys of a source and a processed table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// False when a key column could not be located on either side
    pub can_compare: bool,
    /// True only when nothing is missing and nothing is extra
    pub ok: bool,
    pub source_rows: usize,
    pub processed_rows: usize,
    pub missing_rows: usize,
    pub extra_rows: usize,
    /// Distinct non-empty logistics numbers seen more than once
    pub source_duplicate_count: usize,
    pub processed_duplicate_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key_columns: Option<KeyColumns>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_key_columns: Option<KeyColumns>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_samples: Vec<IdentityKey>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_samples: Vec<IdentityKey>,
    pub message: String,
}

/// Row partitions written by the exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Processed and matched
    Ok,
    /// Processed but mismatched or unknown
    Bad,
    /// Never reached
    Pending,
    /// Processed, any verdict (snapshot exports)
    Processed,
    /// Not processed yet (snapshot exports)
    Unprocessed,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Bad => "bad",
            Self::Pending => "pending",
            Self::Processed => "processed",
            Self::Unprocessed => "unprocessed",
        };
        f.write_str(name)
    }
}

/// One written partition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub rows: usize,
}

/// Everything an export wrote. Empty partitions have no file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    pub files: Vec<ArtifactRef>,
    pub manifest_file: PathBuf,
}

impl ExportManifest {
    pub fn file(&self, kind: ArtifactKind) -> Option<&ArtifactRef> {
        self.files.iter().find(|f| f.kind == kind)
    }

    pub fn ok_file(&self) -> Option<&PathBuf> {
        self.file(ArtifactKind::Ok).map(|f| &f.path)
    }

    pub fn bad_file(&self) -> Option<&PathBuf> {
        self.file(ArtifactKind::Bad).map(|f| &f.path)
    }

    pub fn pending_file(&self) -> Option<&PathBuf> {
        self.file(ArtifactKind::Pending).map(|f| &f.path)
    }

    /// Rows written for `kind`, zero when the partition was empty.
    pub fn rows(&self, kind: ArtifactKind) -> usize {
        self.file(kind).map_or(0, |f| f.rows)
    }
}
