use serde::{Deserialize, Serialize};

use crate::constants::MessageType;
use crate::types::{ErrorKind, Milestone, SessionStatus};

// ---------------------------------------------------------------------------
// Connection payloads
// ---------------------------------------------------------------------------

/// First message on a connection: binds the uploader identity.
///
/// Authentication happens upstream of the daemon; `user_id` is trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloRequest {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub protocol_version: u32,
}

/// Reply to `hello`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeResponse {
    pub user_id: String,
    pub protocol_version: u32,
    pub max_message_size: usize,
}

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Metadata accompanying every chunk.
///
/// `upload_id` is absent on the first chunk of a new upload; the server
/// then derives one and reports it in the `upload_started` event.
/// `chunk_index` is 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    pub target_room_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub declared_file_name: String,
    pub declared_content_type: String,
    pub declared_total_size: u64,
}

/// Chunk sent as a JSON text message.
///
/// The payload is base64-encoded. Binary frames are the preferred
/// transport; this form exists for clients that cannot send them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunkRequest {
    #[serde(flatten)]
    pub header: ChunkHeader,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// Queries the state of an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusRequest {
    pub upload_id: String,
}

/// Cancels an active upload owned by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelUploadRequest {
    pub upload_id: String,
}

// ---------------------------------------------------------------------------
// Reply payloads
// ---------------------------------------------------------------------------

/// Acknowledges one accepted chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub upload_id: String,
    pub chunk_index: u32,
    pub received_chunks: u32,
    pub received_bytes: u64,
    pub status: SessionStatus,
}

/// Reply to `upload_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResponse {
    pub upload_id: String,
    pub status: SessionStatus,
}

/// Reply to `cancel_upload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelUploadResponse {
    pub upload_id: String,
    pub cancelled: bool,
}

// ---------------------------------------------------------------------------
// Events pushed to the uploader
// ---------------------------------------------------------------------------

/// Sent once, when the first chunk of a new upload opens a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStartedEvent {
    pub upload_id: String,
    pub file_name: String,
    pub total_chunks: u32,
    pub total_bytes: u64,
}

/// Sent for every stored chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub upload_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub received_chunks: u32,
    pub received_bytes: u64,
    pub total_bytes: u64,
    pub percent: f64,
    /// Fixed-width text bar, e.g. `[######----]`.
    pub bar: String,
    pub rate_bytes_per_sec: f64,
    /// `None` while the transfer rate is still zero.
    pub eta_seconds: Option<f64>,
}

/// Sent at most once per milestone per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneEvent {
    pub upload_id: String,
    pub milestone: Milestone,
    pub received_bytes: u64,
    pub total_bytes: u64,
}

/// Terminal success event.
///
/// For a duplicate upload `resource_id` is the canonical record's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub upload_id: String,
    pub resource_id: String,
    pub download_path: String,
    pub content_type: String,
    pub size_bytes: u64,
    pub is_duplicate: bool,
}

/// Terminal failure event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub upload_id: String,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// Any event addressed to the uploader of a session.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    Started(UploadStartedEvent),
    Progress(ProgressEvent),
    Milestone(MilestoneEvent),
    Completed(CompletionEvent),
    Failed(ErrorEvent),
}

impl UploadEvent {
    /// Message type used when the event is pushed as an envelope.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Started(_) => MessageType::UploadStarted,
            Self::Progress(_) => MessageType::UploadProgress,
            Self::Milestone(_) => MessageType::UploadMilestone,
            Self::Completed(_) => MessageType::UploadComplete,
            Self::Failed(_) => MessageType::UploadFailed,
        }
    }

    pub fn upload_id(&self) -> &str {
        match self {
            Self::Started(e) => &e.upload_id,
            Self::Progress(e) => &e.upload_id,
            Self::Milestone(e) => &e.upload_id,
            Self::Completed(e) => &e.upload_id,
            Self::Failed(e) => &e.upload_id,
        }
    }

    /// Returns `true` for completion and failure events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }

    /// Wraps the event in an envelope with the given message id.
    pub fn to_message(&self, id: impl Into<String>) -> Result<crate::Message, serde_json::Error> {
        let msg_type = self.message_type();
        match self {
            Self::Started(e) => crate::Message::new(id, msg_type, Some(e)),
            Self::Progress(e) => crate::Message::new(id, msg_type, Some(e)),
            Self::Milestone(e) => crate::Message::new(id, msg_type, Some(e)),
            Self::Completed(e) => crate::Message::new(id, msg_type, Some(e)),
            Self::Failed(e) => crate::Message::new(id, msg_type, Some(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain events
// ---------------------------------------------------------------------------

/// Published when a new attachment becomes available in a room.
///
/// Consumed by the messaging subsystem, which decides on its own who
/// gets notified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentAvailable {
    pub room_id: String,
    pub resource_id: String,
    pub uploader_id: String,
    pub content_type: String,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(data).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
