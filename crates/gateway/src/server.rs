//! Upload WebSocket server.
//!
//! Listens on a TCP port, upgrades every connection to WebSocket and runs
//! it until the uploader leaves or the server shuts down.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::accept_async_with_config;
use tokio_util::sync::CancellationToken;

use chatdrop_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::ServerError;
use crate::connection::{self, Sender};
use crate::handler::Handler;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

/// The upload WebSocket server.
///
/// Serves any number of uploader connections concurrently and dispatches
/// their messages to the shared [`Handler`].
pub struct UploadServer<H: Handler> {
    config: ServerConfig,
    handler: Arc<H>,
    /// Open connections by connection id.
    peers: Mutex<HashMap<String, Sender>>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<H: Handler> UploadServer<H> {
    pub fn new(config: ServerConfig, handler: H) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler: Arc::new(handler),
            peers: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    /// Number of open uploader connections.
    pub async fn connection_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Senders of connections whose `hello` bound `user_id`.
    pub async fn senders_for(&self, user_id: &str) -> Vec<Sender> {
        self.peers
            .lock()
            .await
            .values()
            .filter(|s| s.user_id() == Some(user_id))
            .cloned()
            .collect()
    }

    /// Gracefully shuts down the server and every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the server until cancellation.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        if self.cancel.is_cancelled() {
            return Err(ServerError::ShuttingDown);
        }
        let addr = SocketAddr::new(self.config.host, self.config.port);
        let listener = TcpListener::bind(addr).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("upload server listening on {local_addr}");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                                    tracing::error!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Upgrades one TCP connection to WS and serves it until it closes.
    async fn handle_connection(
        self: &Arc<Self>,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ServerError> {
        // WebSocket upgrade with size limits matching our protocol constants.
        let mut ws_config = tokio_tungstenite::tungstenite::protocol::WebSocketConfig::default();
        ws_config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
        ws_config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
        let ws_stream = accept_async_with_config(stream, Some(ws_config)).await?;

        let conn = connection::spawn_connection(
            ws_stream,
            peer_addr.to_string(),
            Arc::clone(&self.handler),
            self.cancel.clone(),
        );
        let sender = conn.sender();
        let conn_id = sender.conn_id().to_string();
        tracing::info!(%peer_addr, conn = %conn_id, "uploader connected");

        self.peers.lock().await.insert(conn_id.clone(), sender);
        conn.closed().await;
        self.peers.lock().await.remove(&conn_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chatdrop_protocol::{Message, MessageType};
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use super::*;
    use crate::binary::{BinaryChunkHeader, encode_binary_chunk};
    use crate::handler::HandlerFuture;

    /// Replies `welcome` to hello and echoes binary chunk sizes back.
    struct TestHandler;

    impl Handler for TestHandler {
        fn on_hello(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
            Box::pin(async move {
                let user: serde_json::Value = msg.parse_payload().unwrap().unwrap();
                sender.bind_user(user["userId"].as_str().unwrap()).unwrap();
                let reply = msg.reply(MessageType::Welcome, Option::<&()>::None).unwrap();
                let _ = sender.send_msg(reply);
            })
        }

        fn on_binary_chunk(
            &self,
            sender: Sender,
            header: BinaryChunkHeader,
            data: Vec<u8>,
        ) -> HandlerFuture<'_> {
            Box::pin(async move {
                let ack = serde_json::json!({ "bytes": data.len(), "index": header.chunk.chunk_index });
                let reply = Message::new(header.id, MessageType::ChunkAck, Some(&ack)).unwrap();
                let _ = sender.send_msg(reply);
            })
        }
    }

    async fn start() -> (Arc<UploadServer<TestHandler>>, tokio::task::JoinHandle<()>, String) {
        let config = ServerConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        };
        let server = UploadServer::new(config, TestHandler);
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        // Wait for the server to bind.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let url = format!("ws://127.0.0.1:{}", server.port().await);
        (server, handle, url)
    }

    /// Next JSON message from the server, skipping pings.
    async fn next_msg<S>(ws: &mut S) -> Message
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = frame {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    fn text(value: serde_json::Value) -> WsMessage {
        WsMessage::Text(value.to_string().into())
    }

    #[tokio::test]
    async fn server_binds_dynamic_port() {
        let (server, handle, _) = start().await;
        assert!(server.port().await > 0);
        assert_eq!(server.connection_count().await, 0);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn serves_many_connections() {
        let (server, handle, url) = start().await;

        let (mut a, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (mut b, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connection_count().await, 2);

        a.send(text(serde_json::json!({"id": "h1", "type": "hello", "payload": {"userId": "alice"}})))
            .await
            .unwrap();
        b.send(text(serde_json::json!({"id": "h2", "type": "hello", "payload": {"userId": "bob"}})))
            .await
            .unwrap();
        assert_eq!(next_msg(&mut a).await.msg_type, MessageType::Welcome);
        assert_eq!(next_msg(&mut b).await.id, "h2");

        assert_eq!(server.senders_for("alice").await.len(), 1);
        assert_eq!(server.senders_for("carol").await.len(), 0);

        a.close(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(server.connection_count().await, 1);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn default_replies() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        ws.send(text(serde_json::json!({"id": "p1", "type": "ping"})))
            .await
            .unwrap();
        let pong = next_msg(&mut ws).await;
        assert_eq!(pong.msg_type, MessageType::Pong);
        assert_eq!(pong.id, "p1");

        // Not overridden by the test handler.
        ws.send(text(serde_json::json!({"id": "s1", "type": "upload_status", "payload": {"uploadId": "u"}})))
            .await
            .unwrap();
        let reply = next_msg(&mut ws).await;
        assert_eq!(reply.error.unwrap().code, 501);

        ws.send(text(serde_json::json!({"id": "x1", "type": "teleport"})))
            .await
            .unwrap();
        let reply = next_msg(&mut ws).await;
        assert_eq!(reply.id, "x1");
        assert_eq!(reply.error.unwrap().code, 501);

        ws.send(WsMessage::Text("{not json".to_string().into())).await.unwrap();
        assert_eq!(next_msg(&mut ws).await.error.unwrap().code, 400);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn dispatches_binary_chunks() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        let header = BinaryChunkHeader {
            id: "c1".into(),
            chunk: chatdrop_protocol::ChunkHeader {
                upload_id: None,
                target_room_id: "general".into(),
                chunk_index: 1,
                total_chunks: 1,
                declared_file_name: "a.bin".into(),
                declared_content_type: "application/octet-stream".into(),
                declared_total_size: 5,
            },
        };
        let frame = encode_binary_chunk(&header, b"hello").unwrap();
        ws.send(WsMessage::Binary(frame.into())).await.unwrap();

        let ack = next_msg(&mut ws).await;
        assert_eq!(ack.id, "c1");
        let body: serde_json::Value = ack.parse_payload().unwrap().unwrap();
        assert_eq!(body["bytes"], 5);

        // Garbage binary frames get a 400.
        ws.send(WsMessage::Binary(vec![0u8, 1].into())).await.unwrap();
        assert_eq!(next_msg(&mut ws).await.error.unwrap().code, 400);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_connections() {
        let (server, handle, url) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown();
        handle.await.unwrap();

        // The client sees the stream end (close frame or EOF).
        let end = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match ws.next().await {
                    Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(end.is_ok());
    }
}
