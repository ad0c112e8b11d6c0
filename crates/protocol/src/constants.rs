use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Protocol revision advertised in the `welcome` reply.
pub const PROTOCOL_VERSION: u32 = 1;

/// Time to wait for a pong (or any other frame) before the uploader is
/// considered gone.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often the server pings each uploader.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(15);

/// Maximum size of a single WebSocket message (16 MiB).
///
/// Bounds one chunk plus its header; clients are expected to send chunks
/// well below this (2 MiB is typical).
pub const WS_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Connection management
    #[serde(rename = "hello")]
    Hello,
    #[serde(rename = "welcome")]
    Welcome,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,

    // Requests from uploader
    #[serde(rename = "upload_chunk")]
    UploadChunk,
    #[serde(rename = "upload_status")]
    UploadStatus,
    #[serde(rename = "cancel_upload")]
    CancelUpload,

    // Replies to uploader
    #[serde(rename = "chunk_ack")]
    ChunkAck,
    #[serde(rename = "upload_status_response")]
    UploadStatusResponse,
    #[serde(rename = "cancel_upload_response")]
    CancelUploadResponse,
    #[serde(rename = "error")]
    Error,

    // Events pushed to uploader
    #[serde(rename = "upload_started")]
    UploadStarted,
    #[serde(rename = "upload_progress")]
    UploadProgress,
    #[serde(rename = "upload_milestone")]
    UploadMilestone,
    #[serde(rename = "upload_complete")]
    UploadComplete,
    #[serde(rename = "upload_failed")]
    UploadFailed,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_UNAUTHORIZED: i32 = 401;
pub const WS_ERR_CODE_FORBIDDEN: i32 = 403;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_CONFLICT: i32 = 409;
pub const WS_ERR_CODE_PAYLOAD_TOO_LARGE: i32 = 413;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;
