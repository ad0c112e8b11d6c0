//! Wire protocol shared by the chatdrop gateway, the ingest pipeline and
//! uploader clients.
//!
//! Uploaders talk to the daemon over a single persistent WebSocket. Text
//! frames carry JSON [`Message`] envelopes; binary frames carry one chunk
//! each (see the gateway crate for the framing).

pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{ErrorBody, Message};
pub use messages::{
    AttachmentAvailable, ChunkAck, ChunkHeader, CompletionEvent, ErrorEvent, MilestoneEvent,
    ProgressEvent, UploadEvent, UploadStartedEvent,
};
pub use types::{ErrorKind, Milestone, SessionStatus};
