//! Handler trait for processing uploader messages.
//!
//! Implementors provide the upload logic while the server framework
//! handles connection management, routing and binary framing.

use std::future::Future;
use std::pin::Pin;

use chatdrop_protocol::constants::WS_ERR_CODE_NOT_IMPLEMENTED;
use chatdrop_protocol::{Message, MessageType};

use crate::binary::BinaryChunkHeader;
use crate::connection::Sender;

/// A boxed future returned by handler methods.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for handling messages from an uploader connection.
///
/// The server dispatches parsed messages to the appropriate method. Each
/// method receives:
/// - `sender`: the connection's outbound channel and bound identity
/// - `msg`: the parsed JSON envelope (for text) or binary chunk
///
/// Messages from one connection are handled one at a time, in arrival
/// order. Default implementations reply with "not implemented" so
/// handlers only override what they support.
pub trait Handler: Send + Sync + 'static {
    /// Called for `hello`. The handler should bind the uploader identity
    /// on `sender` and reply `welcome`.
    fn on_hello(&self, sender: Sender, msg: Message) -> HandlerFuture<'_>;

    /// Called for `ping`.
    fn on_ping(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            if let Ok(reply) = msg.reply(MessageType::Pong, Option::<&()>::None) {
                let _ = sender.send_msg(reply);
            }
        })
    }

    /// Called for `upload_chunk` (base64 payload inside the JSON).
    fn on_upload_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, None, "not implemented");
        })
    }

    /// Called for a binary chunk frame.
    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: BinaryChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        let _ = data;
        Box::pin(async move {
            let reply = Message::error(
                header.id,
                WS_ERR_CODE_NOT_IMPLEMENTED,
                None,
                "binary chunks not implemented",
            );
            let _ = sender.send_msg(reply);
        })
    }

    /// Called for `upload_status`.
    fn on_upload_status(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, None, "not implemented");
        })
    }

    /// Called for `cancel_upload`.
    fn on_cancel_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, None, "not implemented");
        })
    }

    /// Called once the connection is gone (cleanup hook).
    fn on_disconnected(&self, sender: Sender) -> HandlerFuture<'_> {
        let _ = sender;
        Box::pin(async {})
    }
}
