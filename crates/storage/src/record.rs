use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::category::StorageCategory;

/// Identifier assigned to a record by its store.
///
/// Ids only ever increase, so ordering by id is insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Metadata for one stored upload.
///
/// A duplicate record shares the canonical record's `canonical_path`; it
/// never owns bytes of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: RecordId,
    pub canonical_path: PathBuf,
    pub original_file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    /// Hex-encoded SHA-256 of the content.
    pub content_hash: String,
    pub storage_category: StorageCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_duplicate_of: Option<RecordId>,
    pub created_at: DateTime<Utc>,
    pub uploader_id: String,
}

impl FileRecord {
    pub fn is_canonical(&self) -> bool {
        self.is_duplicate_of.is_none()
    }

    /// Id of the record that owns the bytes: the canonical record for a
    /// duplicate, this record otherwise.
    pub fn resource_id(&self) -> RecordId {
        self.is_duplicate_of.unwrap_or(self.id)
    }
}

/// A record before the store assigns its id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileRecord {
    pub canonical_path: PathBuf,
    pub original_file_name: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub content_hash: String,
    pub storage_category: StorageCategory,
    pub is_duplicate_of: Option<RecordId>,
    pub uploader_id: String,
}

impl NewFileRecord {
    pub(crate) fn into_record(self, id: RecordId, created_at: DateTime<Utc>) -> FileRecord {
        FileRecord {
            id,
            canonical_path: self.canonical_path,
            original_file_name: self.original_file_name,
            content_type: self.content_type,
            size_bytes: self.size_bytes,
            content_hash: self.content_hash,
            storage_category: self.storage_category,
            is_duplicate_of: self.is_duplicate_of,
            created_at,
            uploader_id: self.uploader_id,
        }
    }
}

/// Picks the canonical record among records sharing a content hash.
///
/// Only records that are not themselves duplicates are candidates. The
/// earliest `created_at` wins, ties going to the lowest id. Any number of
/// matches is fine, including none.
pub fn select_canonical(records: &[FileRecord]) -> Option<&FileRecord> {
    records
        .iter()
        .filter(|r| r.is_canonical())
        .min_by_key(|r| (r.created_at, r.id))
}
