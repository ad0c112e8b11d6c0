use chatdrop_protocol::constants::{
    WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_CONFLICT, WS_ERR_CODE_FORBIDDEN, WS_ERR_CODE_INTERNAL,
    WS_ERR_CODE_NOT_FOUND,
};
use chatdrop_protocol::{ErrorKind, SessionStatus};
use chatdrop_storage::StorageError;
use chatdrop_transfer::TransferError;

/// Errors from the upload pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("user {user_id} is not a participant of room {room_id}")]
    AccessDenied { user_id: String, room_id: String },

    #[error("upload {0} belongs to another user")]
    NotOwner(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("chunk rejected: {0}")]
    ChunkRejected(String),

    #[error("upload {upload_id} no longer accepts requests ({status:?})")]
    SessionClosed {
        upload_id: String,
        status: SessionStatus,
    },

    #[error("unknown upload {0}")]
    UnknownUpload(String),

    #[error("received {actual} bytes but {declared} were declared")]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("upload cancelled by uploader")]
    Cancelled,

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("assembly failed: {0}")]
    Assembly(TransferError),

    #[error("assembly task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<TransferError> for IngestError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::SizeMismatch { declared, actual } => {
                Self::SizeMismatch { declared, actual }
            }
            TransferError::Overflow { received, declared } => Self::SizeMismatch {
                declared,
                actual: received,
            },
            e @ TransferError::IndexOutOfRange { .. } => Self::ChunkRejected(e.to_string()),
            TransferError::InvalidFileName(reason) => Self::Validation(reason),
            other => Self::Assembly(other),
        }
    }
}

impl IngestError {
    /// Wire-level error kind, if the error has one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::AccessDenied { .. } | Self::NotOwner(_) => Some(ErrorKind::AccessDenied),
            Self::Validation(_) => Some(ErrorKind::ValidationFailed),
            Self::ChunkRejected(_) => Some(ErrorKind::ChunkRejected),
            Self::SessionClosed {
                status: SessionStatus::Abandoned,
                ..
            } => Some(ErrorKind::SessionTimeout),
            Self::SessionClosed { .. } => Some(ErrorKind::SessionClosed),
            Self::UnknownUpload(_) => None,
            Self::SizeMismatch { .. } => Some(ErrorKind::SizeMismatch),
            Self::Cancelled => Some(ErrorKind::Cancelled),
            Self::Storage(_) | Self::Assembly(_) | Self::Task(_) => {
                Some(ErrorKind::StorageFailure)
            }
        }
    }

    /// HTTP-style status code for error replies.
    pub fn code(&self) -> i32 {
        match self {
            Self::AccessDenied { .. } | Self::NotOwner(_) => WS_ERR_CODE_FORBIDDEN,
            Self::Validation(_) | Self::ChunkRejected(_) | Self::SizeMismatch { .. } => {
                WS_ERR_CODE_BAD_REQUEST
            }
            Self::SessionClosed { .. } => WS_ERR_CODE_CONFLICT,
            Self::UnknownUpload(_) => WS_ERR_CODE_NOT_FOUND,
            Self::Cancelled => WS_ERR_CODE_CONFLICT,
            Self::Storage(_) | Self::Assembly(_) | Self::Task(_) => WS_ERR_CODE_INTERNAL,
        }
    }
}
