use std::path::PathBuf;

use crate::record::RecordId;

/// Errors from storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    NotFound(RecordId),

    #[error("could not find a free file name near {0}")]
    Collision(PathBuf),
}
