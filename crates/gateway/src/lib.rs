//! WebSocket transport for chatdrop uploaders.
//!
//! Accepts any number of uploader connections, dispatches JSON and binary
//! frames to a [`Handler`], and manages each connection's lifecycle
//! (identity binding, ping/pong, graceful shutdown). The gateway knows
//! nothing about sessions; it only moves messages.

mod binary;
mod connection;
mod handler;
mod server;

pub use binary::{BinaryChunkHeader, ParseError, encode_binary_chunk, parse_binary_chunk};
pub use connection::{IdentityError, PeerConnection, SendError, Sender};
pub use handler::{Handler, HandlerFuture};
pub use server::{ServerConfig, UploadServer};

/// Send buffer capacity per connection.
///
/// Every chunk produces an ack, a progress event and possibly several
/// milestone events. When the buffer is full `try_send()` drops messages.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// Errors produced by the upload server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server shutting down")]
    ShuttingDown,
}
