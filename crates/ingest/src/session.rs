use std::sync::Arc;

use chatdrop_protocol::{ChunkHeader, SessionStatus};
use chatdrop_transfer::{ChunkBuffer, MilestoneTracker};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::IngestError;
use crate::events::EventSink;

/// Derives an upload id for a first chunk that arrived without one.
///
/// Hex of the first 16 bytes of
/// `SHA-256(fileName|uploaderId|totalChunks|timestampMillis)`.
pub fn derive_upload_id(
    file_name: &str,
    uploader_id: &str,
    total_chunks: u32,
    timestamp_millis: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{file_name}|{uploader_id}|{total_chunks}|{timestamp_millis}"));
    hex::encode(&hasher.finalize()[..16])
}

/// One in-flight upload.
///
/// The fixed metadata is recorded from the first chunk; everything that
/// changes lives behind the per-session lock.
pub(crate) struct UploadSession {
    pub id: String,
    pub owner_id: String,
    pub room_id: String,
    pub file_name: String,
    pub content_type: String,
    pub declared_total: u64,
    pub total_chunks: u32,
    pub started_at: Instant,
    pub state: Mutex<SessionState>,
}

pub(crate) struct SessionState {
    pub status: SessionStatus,
    /// Whether the start event went out.
    pub announced: bool,
    pub buffer: ChunkBuffer,
    pub milestones: MilestoneTracker,
    pub last_activity: Instant,
    /// Highest `received_bytes` reported in a progress event.
    pub last_reported_bytes: u64,
    /// Where this session's events go; follows the uploader's latest
    /// connection.
    pub sink: Arc<dyn EventSink>,
}

impl UploadSession {
    pub fn new(
        id: String,
        owner_id: &str,
        header: &ChunkHeader,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            owner_id: owner_id.to_string(),
            room_id: header.target_room_id.clone(),
            file_name: header.declared_file_name.clone(),
            content_type: header.declared_content_type.clone(),
            declared_total: header.declared_total_size,
            total_chunks: header.total_chunks,
            started_at: now,
            state: Mutex::new(SessionState {
                status: SessionStatus::Active,
                announced: false,
                buffer: ChunkBuffer::new(header.total_chunks, header.declared_total_size),
                milestones: MilestoneTracker::new(),
                last_activity: now,
                last_reported_bytes: 0,
                sink,
            }),
        }
    }

    /// Rejects a chunk whose metadata disagrees with the session.
    pub fn check_metadata(&self, header: &ChunkHeader) -> Result<(), IngestError> {
        let mismatch = if header.total_chunks != self.total_chunks {
            Some(format!(
                "totalChunks {} differs from {}",
                header.total_chunks, self.total_chunks
            ))
        } else if header.declared_file_name != self.file_name {
            Some(format!(
                "declaredFileName {:?} differs from {:?}",
                header.declared_file_name, self.file_name
            ))
        } else if header.declared_content_type != self.content_type {
            Some(format!(
                "declaredContentType {:?} differs from {:?}",
                header.declared_content_type, self.content_type
            ))
        } else if header.declared_total_size != self.declared_total {
            Some(format!(
                "declaredTotalSize {} differs from {}",
                header.declared_total_size, self.declared_total
            ))
        } else if header.target_room_id != self.room_id {
            Some(format!(
                "targetRoomId {:?} differs from {:?}",
                header.target_room_id, self.room_id
            ))
        } else {
            None
        };

        match mismatch {
            Some(reason) => Err(IngestError::ChunkRejected(reason)),
            None => Ok(()),
        }
    }
}
