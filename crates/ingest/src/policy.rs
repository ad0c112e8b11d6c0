use std::time::Duration;

use chatdrop_protocol::ChunkHeader;
use chatdrop_transfer::validate_file_name;

use crate::error::IngestError;

/// Limits applied to every new upload, plus the session timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPolicy {
    /// Largest accepted `declaredTotalSize`.
    pub max_upload_bytes: u64,
    /// `type/subtype` or `type/*` patterns. Empty allows any type.
    pub allowed_content_types: Vec<String>,
    /// Upper bound on `totalChunks`, regardless of file size.
    pub max_chunks: u32,
    /// An active session with no chunk for this long is abandoned.
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// How long terminal statuses stay queryable.
    pub status_retention: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            max_upload_bytes: 100 * 1024 * 1024,
            allowed_content_types: ["image/*", "audio/*", "video/*", "text/*", "application/*"]
                .into_iter()
                .map(String::from)
                .collect(),
            max_chunks: 10_000,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            status_retention: Duration::from_secs(600),
        }
    }
}

impl UploadPolicy {
    /// Checks the metadata of a session's first chunk.
    pub fn validate(&self, header: &ChunkHeader) -> Result<(), IngestError> {
        if header.declared_total_size > self.max_upload_bytes {
            return Err(IngestError::Validation(format!(
                "declared size {} exceeds the {} byte limit",
                header.declared_total_size, self.max_upload_bytes
            )));
        }

        if !self.content_type_allowed(&header.declared_content_type) {
            return Err(IngestError::Validation(format!(
                "content type {:?} is not allowed",
                header.declared_content_type
            )));
        }

        // Every chunk but the single chunk of an empty file carries at
        // least one byte.
        let max_chunks = header.declared_total_size.max(1).min(self.max_chunks as u64);
        if header.total_chunks == 0 || header.total_chunks as u64 > max_chunks {
            return Err(IngestError::Validation(format!(
                "total chunks {} outside 1..={max_chunks}",
                header.total_chunks
            )));
        }

        validate_file_name(&header.declared_file_name)
            .map_err(|e| IngestError::Validation(e.to_string()))
    }

    /// Matches `content_type` against the allow-list, ignoring case and
    /// parameters.
    pub fn content_type_allowed(&self, content_type: &str) -> bool {
        if self.allowed_content_types.is_empty() {
            return true;
        }
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        let Some((main, _)) = essence.split_once('/') else {
            return false;
        };

        self.allowed_content_types.iter().any(|pattern| {
            let pattern = pattern.trim().to_ascii_lowercase();
            match pattern.strip_suffix("/*") {
                Some("*") => true,
                Some(prefix) => prefix == main,
                None => pattern == essence,
            }
        })
    }
}
