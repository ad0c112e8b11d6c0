use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of an upload session.
///
/// `Active` sessions accept chunks. `Assembling` is entered exactly once,
/// when every chunk index has been seen, and is never interrupted by the
/// inactivity sweep. The remaining three states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Assembling,
    Complete,
    Failed,
    Abandoned,
}

impl SessionStatus {
    /// Returns `true` for states a session never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Abandoned)
    }
}

/// Typed failure reason carried by error events and error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Uploader is not a participant of the target room.
    AccessDenied,
    /// Declared size or content type outside the upload policy.
    ValidationFailed,
    /// Assembled (or received) length disagrees with the declared total.
    SizeMismatch,
    /// I/O failure while writing or promoting the file.
    StorageFailure,
    /// Two identical uploads raced for the canonical record. Resolved
    /// internally; never sent to an uploader.
    DedupRace,
    /// Session abandoned after inactivity. Only visible via status query.
    SessionTimeout,
    /// A single chunk was refused (bad index or metadata disagreement);
    /// the session itself is untouched.
    ChunkRejected,
    /// Chunk or request addressed to a session that no longer accepts it.
    SessionClosed,
    /// Uploader cancelled the session.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessDenied => "ACCESS_DENIED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::SizeMismatch => "SIZE_MISMATCH",
            Self::StorageFailure => "STORAGE_FAILURE",
            Self::DedupRace => "DEDUP_RACE",
            Self::SessionTimeout => "SESSION_TIMEOUT",
            Self::ChunkRejected => "CHUNK_REJECTED",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress threshold reported at most once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Milestone {
    /// The first chunk of the session was stored.
    FirstChunk,
    /// Byte progress reached `percent` (a multiple of 10).
    Percent { percent: u8 },
    /// Every chunk index has been received.
    LastChunk,
}
