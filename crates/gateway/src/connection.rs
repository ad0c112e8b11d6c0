//! Uploader connection management: read/write pumps, ping/pong, send buffering.

use std::sync::{Arc, OnceLock};

use chatdrop_protocol::constants::{
    MessageType, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_NOT_IMPLEMENTED, WS_MAX_MESSAGE_SIZE,
    WS_PING_PERIOD, WS_PONG_WAIT,
};
use chatdrop_protocol::{ErrorKind, Message, UploadEvent};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::SEND_BUFFER_SIZE;
use crate::binary::parse_binary_chunk;
use crate::handler::Handler;

/// What the server knows about one connection.
#[derive(Debug)]
struct PeerInfo {
    conn_id: String,
    remote_addr: String,
    /// Set once by `hello`.
    user_id: OnceLock<String>,
}

/// Handle for sending messages to one uploader.
///
/// Cloneable and cheap: wraps an `mpsc::Sender` and the connection's
/// identity.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<WsMessage>,
    peer: Arc<PeerInfo>,
}

impl Sender {
    fn new(tx: mpsc::Sender<WsMessage>, remote_addr: String) -> Self {
        Self {
            tx,
            peer: Arc::new(PeerInfo {
                conn_id: uuid::Uuid::new_v4().to_string(),
                remote_addr,
                user_id: OnceLock::new(),
            }),
        }
    }

    /// A sender whose frames land in the returned receiver instead of a
    /// socket. Lets handlers be driven without a network connection.
    pub fn detached(remote_addr: impl Into<String>) -> (Self, mpsc::Receiver<WsMessage>) {
        let (tx, rx) = mpsc::channel(SEND_BUFFER_SIZE);
        (Self::new(tx, remote_addr.into()), rx)
    }

    /// Sends a protocol [`Message`] as JSON text.
    ///
    /// Returns `Err` if the buffer is full or the uploader disconnected.
    pub fn send_msg(&self, msg: Message) -> Result<(), SendError> {
        let json = serde_json::to_string(&msg).map_err(|_| SendError)?;
        self.tx.try_send(WsMessage::Text(json.into())).map_err(|_| {
            tracing::warn!(conn = %self.peer.conn_id, "send buffer full or closed, dropping message");
            SendError
        })
    }

    /// Sends an error response for the given request message.
    pub fn send_error(
        &self,
        req: &Message,
        code: i32,
        kind: Option<ErrorKind>,
        message: &str,
    ) -> Result<(), SendError> {
        self.send_msg(req.reply_error(code, kind, message))
    }

    /// Pushes an upload event under a fresh message id.
    pub fn send_event(&self, event: &UploadEvent) -> Result<(), SendError> {
        let msg = event
            .to_message(uuid::Uuid::new_v4().to_string())
            .map_err(|_| SendError)?;
        self.send_msg(msg)
    }

    /// Returns `true` if the send channel is still open.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Server-assigned connection id.
    pub fn conn_id(&self) -> &str {
        &self.peer.conn_id
    }

    pub fn remote_addr(&self) -> &str {
        &self.peer.remote_addr
    }

    /// The identity bound by `hello`, if any.
    pub fn user_id(&self) -> Option<&str> {
        self.peer.user_id.get().map(String::as_str)
    }

    /// Binds the uploader identity. Repeating the same identity is fine;
    /// switching to another one is not.
    pub fn bind_user(&self, user_id: &str) -> Result<(), IdentityError> {
        let bound = self.peer.user_id.get_or_init(|| user_id.to_string());
        if bound == user_id {
            Ok(())
        } else {
            Err(IdentityError::AlreadyBound {
                current: bound.clone(),
            })
        }
    }
}

/// Error returned when the send channel is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// Error returned by [`Sender::bind_user`].
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("connection already bound to {current}")]
    AlreadyBound { current: String },
}

/// Active connection to an uploader.
///
/// Owns the read/write pump tasks and provides a [`Sender`] for
/// asynchronous message delivery.
pub struct PeerConnection {
    sender: Sender,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

impl PeerConnection {
    /// Returns a cloneable [`Sender`] for this connection.
    pub fn sender(&self) -> Sender {
        self.sender.clone()
    }

    /// Signals both pumps to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Waits until the read pump and the disconnect hook have finished.
    pub async fn closed(self) {
        if let Err(e) = self.reader.await {
            tracing::error!(conn = %self.sender.conn_id(), "read pump task failed: {e}");
        }
    }
}

/// Runs the read and write pumps for a WebSocket connection.
///
/// Returns the [`PeerConnection`] handle. The pumps run as background
/// tokio tasks and stop when the connection is closed or the cancel
/// token is triggered.
pub fn spawn_connection<S, H>(
    ws_stream: S,
    remote_addr: String,
    handler: Arc<H>,
    server_cancel: CancellationToken,
) -> PeerConnection
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error>
        + Send
        + 'static,
    H: Handler,
{
    let (tx, rx) = mpsc::channel::<WsMessage>(SEND_BUFFER_SIZE);
    let cancel = server_cancel.child_token();
    let sender = Sender::new(tx, remote_addr);

    let (ws_sink, ws_stream) = ws_stream.split();

    tokio::spawn(write_pump(ws_sink, rx, cancel.clone()));

    let read_cancel = cancel.clone();
    let read_sender = sender.clone();
    let reader = tokio::spawn(async move {
        read_pump(ws_stream, read_sender.clone(), Arc::clone(&handler), read_cancel.clone()).await;
        // When read pump exits, cancel the write pump too.
        read_cancel.cancel();
        handler.on_disconnected(read_sender.clone()).await;
        tracing::info!(
            conn = %read_sender.conn_id(),
            user = read_sender.user_id().unwrap_or("-"),
            "uploader disconnected"
        );
    });

    PeerConnection {
        sender,
        cancel,
        reader,
    }
}

/// Write pump: drains the send channel and sends WS pings.
async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<WsMessage>, cancel: CancellationToken)
where
    S: futures_util::Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Send + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                match msg {
                    Some(ws_msg) => {
                        if let Err(e) = sink.send(ws_msg).await {
                            tracing::error!("write pump send error: {e}");
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Vec::new().into())).await {
                    tracing::error!("write pump ping error: {e}");
                    break;
                }
            }
        }
    }

    // Best-effort close frame.
    let _ = sink.close().await;
}

/// Read pump: reads WS frames and dispatches to the handler.
async fn read_pump<S, H>(mut stream: S, sender: Sender, handler: Arc<H>, cancel: CancellationToken)
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Send
        + Unpin,
    H: Handler,
{
    let mut pong_deadline = tokio::time::interval(WS_PONG_WAIT);
    pong_deadline.reset();
    let mut got_pong = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = pong_deadline.tick() => {
                if !got_pong {
                    tracing::warn!(conn = %sender.conn_id(), "pong timeout, closing connection");
                    break;
                }
                got_pong = false;
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(ws_msg)) => match ws_msg {
                        WsMessage::Text(text) => {
                            if text.len() > WS_MAX_MESSAGE_SIZE {
                                tracing::error!("message exceeds max size ({} > {})", text.len(), WS_MAX_MESSAGE_SIZE);
                                continue;
                            }
                            dispatch_text(&handler, &sender, &text).await;
                        }
                        WsMessage::Binary(data) => {
                            if data.len() > WS_MAX_MESSAGE_SIZE {
                                tracing::error!("binary message exceeds max size ({} > {})", data.len(), WS_MAX_MESSAGE_SIZE);
                                continue;
                            }
                            dispatch_binary(&handler, &sender, &data).await;
                        }
                        WsMessage::Pong(_) => {
                            got_pong = true;
                            pong_deadline.reset();
                        }
                        WsMessage::Ping(data) => {
                            let _ = sender.tx.try_send(WsMessage::Pong(data));
                        }
                        WsMessage::Close(_) => {
                            tracing::debug!(conn = %sender.conn_id(), "received close frame");
                            break;
                        }
                        WsMessage::Frame(_) => {}
                    },
                    Some(Err(e)) => {
                        tracing::error!(conn = %sender.conn_id(), "read pump error: {e}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Dispatches a text (JSON) message to the appropriate handler method.
async fn dispatch_text<H: Handler>(handler: &Arc<H>, sender: &Sender, text: &str) {
    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(conn = %sender.conn_id(), "invalid message JSON: {e}");
            let reply = Message::error("", WS_ERR_CODE_BAD_REQUEST, None, format!("invalid message: {e}"));
            let _ = sender.send_msg(reply);
            return;
        }
    };

    let s = sender.clone();
    match msg.msg_type {
        MessageType::Hello => handler.on_hello(s, msg).await,
        MessageType::Ping => handler.on_ping(s, msg).await,
        MessageType::UploadChunk => handler.on_upload_chunk(s, msg).await,
        MessageType::UploadStatus => handler.on_upload_status(s, msg).await,
        MessageType::CancelUpload => handler.on_cancel_upload(s, msg).await,
        _ => {
            tracing::warn!(msg_type = ?msg.msg_type, "unhandled message type");
            let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_IMPLEMENTED, None, "unknown message type");
        }
    }
}

/// Dispatches a binary WebSocket frame to the handler.
async fn dispatch_binary<H: Handler>(handler: &Arc<H>, sender: &Sender, data: &[u8]) {
    match parse_binary_chunk(data) {
        Ok((header, payload)) => {
            handler.on_binary_chunk(sender.clone(), header, payload).await;
        }
        Err(e) => {
            // No message id to correlate with.
            tracing::error!(conn = %sender.conn_id(), "failed to parse binary message: {e}");
            let reply = Message::error("", WS_ERR_CODE_BAD_REQUEST, None, e.to_string());
            let _ = sender.send_msg(reply);
        }
    }
}
