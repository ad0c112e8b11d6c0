//! The upload pipeline between the transport and storage.
//!
//! [`UploadCoordinator`] owns every in-flight session. Each chunk is checked
//! against the [`AccessGuard`] (first chunk only) and the [`UploadPolicy`],
//! buffered by index, and once the last index arrives the file is assembled,
//! deduplicated and placed. Events for the uploader go to the session's
//! [`EventSink`]; [`AttachmentAvailable`](chatdrop_protocol::AttachmentAvailable)
//! goes out on a broadcast channel.

mod coordinator;
mod error;
mod events;
mod guard;
mod policy;
mod session;

pub use coordinator::UploadCoordinator;
pub use error::IngestError;
pub use events::{AttachmentBus, ChannelSink, EventSink};
pub use guard::{AccessGuard, GuardFuture, StaticRoster};
pub use policy::UploadPolicy;
pub use session::derive_upload_id;
