//! Application orchestrator: wires storage, the upload coordinator and the
//! WebSocket server together.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use chatdrop_gateway::{BinaryChunkHeader, Handler, HandlerFuture, Sender, ServerConfig, UploadServer};
use chatdrop_ingest::{AttachmentBus, EventSink, UploadCoordinator};
use chatdrop_protocol::constants::{
    PROTOCOL_VERSION, WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_CONFLICT, WS_ERR_CODE_NOT_FOUND,
    WS_ERR_CODE_UNAUTHORIZED, WS_MAX_MESSAGE_SIZE,
};
use chatdrop_protocol::messages::{
    CancelUploadRequest, CancelUploadResponse, HelloRequest, UploadChunkRequest,
    UploadStatusRequest, UploadStatusResponse, WelcomeResponse,
};
use chatdrop_protocol::{ChunkHeader, Message, MessageType, UploadEvent};
use chatdrop_storage::{DedupIndex, MemoryRecordStore, RecordStore, StoragePlacer};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Record journal file name under the storage root.
const RECORDS_FILE: &str = "records.jsonl";

/// Runs the daemon until shutdown is requested.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let coordinator = Arc::new(build_coordinator(&config)?);
    let sweeper = coordinator.spawn_sweeper(cancel.clone());
    let announcer = tokio::spawn(log_attachments(Arc::clone(&coordinator), cancel.clone()));

    // -- WS server --
    let server_config = ServerConfig {
        host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        port: config.listen_port,
    };
    let server = UploadServer::new(server_config, IngestHandler::new(Arc::clone(&coordinator)));
    let server_run = Arc::clone(&server);
    let server_task = tokio::spawn(async move {
        if let Err(e) = server_run.run().await {
            tracing::error!("server error: {e}");
        }
    });

    // Wait for the server to bind.
    let port = loop {
        let p = server.port().await;
        if p > 0 {
            break p;
        }
        if server_task.is_finished() {
            anyhow::bail!("upload server failed to start");
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    };
    tracing::info!(port, "daemon ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {e}");
    }
    tracing::info!("shutdown signal received");

    // -- Graceful shutdown --
    server.shutdown();
    cancel.cancel();
    let _ = server_task.await;
    let _ = sweeper.await;
    let _ = announcer.await;
    tracing::info!(live = coordinator.live_sessions(), "uploads in flight dropped");

    Ok(())
}

/// Opens the record journal and builds the upload pipeline on top of it.
pub fn build_coordinator(config: &Config) -> anyhow::Result<UploadCoordinator> {
    std::fs::create_dir_all(&config.storage_root)?;

    let store = MemoryRecordStore::open(config.storage_root.join(RECORDS_FILE))?;
    tracing::info!(records = store.len(), "record journal loaded");

    let roster = config.roster();
    if roster.room_count() == 0 {
        tracing::warn!("no rooms configured, every upload will be refused");
    }

    let index = Arc::new(DedupIndex::new(Arc::new(store)));
    let placer = Arc::new(StoragePlacer::new(&config.storage_root, &config.download_prefix));
    Ok(UploadCoordinator::new(
        config.to_policy(),
        Arc::new(roster),
        index,
        placer,
        AttachmentBus::default(),
    ))
}

/// Stand-in consumer of attachment announcements until a messaging
/// subsystem subscribes.
async fn log_attachments(coordinator: Arc<UploadCoordinator>, cancel: CancellationToken) {
    let mut rx = coordinator.subscribe();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            evt = rx.recv() => match evt {
                Ok(evt) => tracing::info!(
                    room = %evt.room_id,
                    resource_id = %evt.resource_id,
                    uploader = %evt.uploader_id,
                    content_type = %evt.content_type,
                    "attachment available"
                ),
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(missed = n, "attachment log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

/// Forwards a session's events to the uploader's current connection.
struct PeerSink(Sender);

impl EventSink for PeerSink {
    fn emit(&self, event: UploadEvent) {
        if self.0.send_event(&event).is_err() {
            tracing::debug!(
                conn = %self.0.conn_id(),
                upload_id = %event.upload_id(),
                "event dropped, uploader not reachable"
            );
        }
    }
}

/// Message handler feeding the upload coordinator.
pub struct IngestHandler {
    coordinator: Arc<UploadCoordinator>,
}

impl IngestHandler {
    pub fn new(coordinator: Arc<UploadCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Hands one chunk to the coordinator and replies with an ack or error.
    async fn accept(&self, sender: Sender, msg_id: &str, header: ChunkHeader, payload: Vec<u8>) {
        let Some(user_id) = sender.user_id().map(str::to_string) else {
            let reply = Message::error(msg_id, WS_ERR_CODE_UNAUTHORIZED, None, "hello required");
            let _ = sender.send_msg(reply);
            return;
        };

        let sink: Arc<dyn EventSink> = Arc::new(PeerSink(sender.clone()));
        let reply = match self
            .coordinator
            .accept_chunk(&user_id, header, payload, sink)
            .await
        {
            Ok(ack) => Message::new(msg_id, MessageType::ChunkAck, Some(&ack)),
            Err(e) => Ok(Message::error(msg_id, e.code(), e.kind(), e.to_string())),
        };
        match reply {
            Ok(reply) => {
                let _ = sender.send_msg(reply);
            }
            Err(e) => tracing::error!("failed to build reply: {e}"),
        }
    }
}

/// Decodes a request payload, replying 400 when it is missing or malformed.
fn payload<T: DeserializeOwned>(sender: &Sender, msg: &Message) -> Option<T> {
    match msg.parse_payload() {
        Ok(Some(p)) => Some(p),
        Ok(None) => {
            let _ = sender.send_error(msg, WS_ERR_CODE_BAD_REQUEST, None, "missing payload");
            None
        }
        Err(e) => {
            let _ = sender.send_error(msg, WS_ERR_CODE_BAD_REQUEST, None, &format!("invalid payload: {e}"));
            None
        }
    }
}

fn send_reply<T: serde::Serialize>(sender: &Sender, msg: &Message, msg_type: MessageType, body: &T) {
    match msg.reply(msg_type, Some(body)) {
        Ok(reply) => {
            let _ = sender.send_msg(reply);
        }
        Err(e) => tracing::error!("failed to build reply: {e}"),
    }
}

impl Handler for IngestHandler {
    fn on_hello(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = payload::<HelloRequest>(&sender, &msg) else {
                return;
            };
            if req.user_id.trim().is_empty() {
                let _ = sender.send_error(&msg, WS_ERR_CODE_BAD_REQUEST, None, "empty userId");
                return;
            }
            if let Err(e) = sender.bind_user(&req.user_id) {
                let _ = sender.send_error(&msg, WS_ERR_CODE_CONFLICT, None, &e.to_string());
                return;
            }
            tracing::info!(conn = %sender.conn_id(), user = %req.user_id, "uploader identified");

            let welcome = WelcomeResponse {
                user_id: req.user_id,
                protocol_version: PROTOCOL_VERSION,
                max_message_size: WS_MAX_MESSAGE_SIZE,
            };
            send_reply(&sender, &msg, MessageType::Welcome, &welcome);
        })
    }

    fn on_upload_chunk(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = payload::<UploadChunkRequest>(&sender, &msg) else {
                return;
            };
            self.accept(sender, &msg.id, req.header, req.payload).await;
        })
    }

    fn on_binary_chunk(
        &self,
        sender: Sender,
        header: BinaryChunkHeader,
        data: Vec<u8>,
    ) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.accept(sender, &header.id, header.chunk, data).await;
        })
    }

    fn on_upload_status(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(req) = payload::<UploadStatusRequest>(&sender, &msg) else {
                return;
            };
            match self.coordinator.status(&req.upload_id).await {
                Some(status) => {
                    let resp = UploadStatusResponse {
                        upload_id: req.upload_id,
                        status,
                    };
                    send_reply(&sender, &msg, MessageType::UploadStatusResponse, &resp);
                }
                None => {
                    let _ = sender.send_error(&msg, WS_ERR_CODE_NOT_FOUND, None, "unknown upload");
                }
            }
        })
    }

    fn on_cancel_upload(&self, sender: Sender, msg: Message) -> HandlerFuture<'_> {
        Box::pin(async move {
            let Some(user_id) = sender.user_id().map(str::to_string) else {
                let _ = sender.send_error(&msg, WS_ERR_CODE_UNAUTHORIZED, None, "hello required");
                return;
            };
            let Some(req) = payload::<CancelUploadRequest>(&sender, &msg) else {
                return;
            };
            match self.coordinator.cancel(&user_id, &req.upload_id).await {
                Ok(cancelled) => {
                    let resp = CancelUploadResponse {
                        upload_id: req.upload_id,
                        cancelled,
                    };
                    send_reply(&sender, &msg, MessageType::CancelUploadResponse, &resp);
                }
                Err(e) => {
                    let _ = sender.send_error(&msg, e.code(), e.kind(), &e.to_string());
                }
            }
        })
    }

    fn on_disconnected(&self, sender: Sender) -> HandlerFuture<'_> {
        Box::pin(async move {
            // Sessions outlive the connection; the sweep reclaims them.
            tracing::debug!(conn = %sender.conn_id(), live = self.coordinator.live_sessions(), "connection closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatdrop_gateway::encode_binary_chunk;
    use chatdrop_protocol::{ChunkAck, CompletionEvent, ErrorKind, SessionStatus};
    use chatdrop_protocol::messages::UploadStartedEvent;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    use crate::config::RoomConfig;

    struct Fixture {
        _tmp: tempfile::TempDir,
        handler: IngestHandler,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            storage_root: tmp.path().join("storage"),
            rooms: vec![RoomConfig {
                id: "general".into(),
                participants: vec!["alice".into(), "bob".into()],
            }],
            ..Config::default()
        };
        let coordinator = Arc::new(build_coordinator(&config).unwrap());
        Fixture {
            _tmp: tmp,
            handler: IngestHandler::new(coordinator),
        }
    }

    /// Drains every JSON message queued on a detached sender.
    fn drain(rx: &mut tokio::sync::mpsc::Receiver<WsMessage>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let text = frame.into_text().unwrap();
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    fn request<T: serde::Serialize>(id: &str, msg_type: MessageType, body: &T) -> Message {
        Message::new(id, msg_type, Some(body)).unwrap()
    }

    async fn hello(handler: &IngestHandler, sender: &Sender, user: &str) {
        let req = HelloRequest {
            user_id: user.into(),
            protocol_version: PROTOCOL_VERSION,
        };
        handler
            .on_hello(sender.clone(), request("h", MessageType::Hello, &req))
            .await;
    }

    fn chunk(upload_id: Option<&str>, index: u32, total: u32, size: u64) -> ChunkHeader {
        ChunkHeader {
            upload_id: upload_id.map(String::from),
            target_room_id: "general".into(),
            chunk_index: index,
            total_chunks: total,
            declared_file_name: "note.txt".into(),
            declared_content_type: "text/plain".into(),
            declared_total_size: size,
        }
    }

    #[tokio::test]
    async fn hello_binds_identity() {
        let f = fixture();
        let (sender, mut rx) = Sender::detached("peer");

        hello(&f.handler, &sender, "alice").await;
        let welcome = drain(&mut rx).remove(0);
        assert_eq!(welcome.msg_type, MessageType::Welcome);
        let body: WelcomeResponse = welcome.parse_payload().unwrap().unwrap();
        assert_eq!(body.user_id, "alice");
        assert_eq!(sender.user_id(), Some("alice"));

        hello(&f.handler, &sender, "bob").await;
        let reply = drain(&mut rx).remove(0);
        assert_eq!(reply.error.unwrap().code, WS_ERR_CODE_CONFLICT);
    }

    #[tokio::test]
    async fn chunks_need_hello() {
        let f = fixture();
        let (sender, mut rx) = Sender::detached("peer");

        let req = UploadChunkRequest {
            header: chunk(None, 1, 1, 2),
            payload: b"hi".to_vec(),
        };
        f.handler
            .on_upload_chunk(sender.clone(), request("c1", MessageType::UploadChunk, &req))
            .await;

        let reply = drain(&mut rx).remove(0);
        assert_eq!(reply.id, "c1");
        assert_eq!(reply.error.unwrap().code, WS_ERR_CODE_UNAUTHORIZED);
    }

    #[tokio::test]
    async fn text_and_binary_chunks_complete_an_upload() {
        let f = fixture();
        let (sender, mut rx) = Sender::detached("peer");
        hello(&f.handler, &sender, "alice").await;
        drain(&mut rx);

        let first = UploadChunkRequest {
            header: chunk(None, 1, 2, 11),
            payload: b"hello ".to_vec(),
        };
        f.handler
            .on_upload_chunk(sender.clone(), request("c1", MessageType::UploadChunk, &first))
            .await;

        let msgs = drain(&mut rx);
        let started = msgs
            .iter()
            .find(|m| m.msg_type == MessageType::UploadStarted)
            .unwrap();
        let started: UploadStartedEvent = started.parse_payload().unwrap().unwrap();
        let ack = msgs.iter().find(|m| m.id == "c1").unwrap();
        let ack: ChunkAck = ack.parse_payload().unwrap().unwrap();
        assert_eq!(ack.upload_id, started.upload_id);
        assert_eq!(ack.status, SessionStatus::Active);

        // Second chunk as a binary frame.
        let frame = encode_binary_chunk(
            &BinaryChunkHeader {
                id: "c2".into(),
                chunk: chunk(Some(&ack.upload_id), 2, 2, 11),
            },
            b"world",
        )
        .unwrap();
        let (header, data) = chatdrop_gateway::parse_binary_chunk(&frame).unwrap();
        f.handler.on_binary_chunk(sender.clone(), header, data).await;

        let msgs = drain(&mut rx);
        let done = msgs
            .iter()
            .find(|m| m.msg_type == MessageType::UploadComplete)
            .unwrap();
        let done: CompletionEvent = done.parse_payload().unwrap().unwrap();
        assert_eq!(done.size_bytes, 11);
        assert!(!done.is_duplicate);
        assert!(done.download_path.starts_with("/files/"));

        let ack: ChunkAck = msgs
            .iter()
            .find(|m| m.id == "c2")
            .unwrap()
            .parse_payload()
            .unwrap()
            .unwrap();
        assert_eq!(ack.status, SessionStatus::Complete);

        let status = UploadStatusRequest {
            upload_id: ack.upload_id.clone(),
        };
        f.handler
            .on_upload_status(sender.clone(), request("s1", MessageType::UploadStatus, &status))
            .await;
        let resp: UploadStatusResponse = drain(&mut rx).remove(0).parse_payload().unwrap().unwrap();
        assert_eq!(resp.status, SessionStatus::Complete);
    }

    #[tokio::test]
    async fn refused_upload_reports_kind() {
        let f = fixture();
        let (sender, mut rx) = Sender::detached("peer");
        hello(&f.handler, &sender, "mallory").await;
        drain(&mut rx);

        let req = UploadChunkRequest {
            header: chunk(None, 1, 1, 2),
            payload: b"hi".to_vec(),
        };
        f.handler
            .on_upload_chunk(sender.clone(), request("c1", MessageType::UploadChunk, &req))
            .await;

        let msgs = drain(&mut rx);
        assert!(msgs.iter().any(|m| m.msg_type == MessageType::UploadFailed));
        let reply = msgs.iter().find(|m| m.id == "c1").unwrap();
        let err = reply.error.as_ref().unwrap();
        assert_eq!(err.code, 403);
        assert_eq!(err.kind, Some(ErrorKind::AccessDenied));
    }

    #[tokio::test]
    async fn cancel_and_unknown_status() {
        let f = fixture();
        let (sender, mut rx) = Sender::detached("peer");
        hello(&f.handler, &sender, "alice").await;
        drain(&mut rx);

        let req = UploadChunkRequest {
            header: chunk(None, 1, 2, 4),
            payload: b"ab".to_vec(),
        };
        f.handler
            .on_upload_chunk(sender.clone(), request("c1", MessageType::UploadChunk, &req))
            .await;
        let ack: ChunkAck = drain(&mut rx)
            .into_iter()
            .find(|m| m.id == "c1")
            .unwrap()
            .parse_payload()
            .unwrap()
            .unwrap();

        let cancel = CancelUploadRequest {
            upload_id: ack.upload_id.clone(),
        };
        f.handler
            .on_cancel_upload(sender.clone(), request("x1", MessageType::CancelUpload, &cancel))
            .await;
        let msgs = drain(&mut rx);
        assert!(msgs.iter().any(|m| m.msg_type == MessageType::UploadFailed));
        let resp: CancelUploadResponse = msgs
            .iter()
            .find(|m| m.id == "x1")
            .unwrap()
            .parse_payload()
            .unwrap()
            .unwrap();
        assert!(resp.cancelled);

        let status = UploadStatusRequest {
            upload_id: "nope".into(),
        };
        f.handler
            .on_upload_status(sender.clone(), request("s1", MessageType::UploadStatus, &status))
            .await;
        assert_eq!(drain(&mut rx).remove(0).error.unwrap().code, WS_ERR_CODE_NOT_FOUND);
    }

    #[tokio::test]
    async fn records_survive_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            storage_root: tmp.path().to_path_buf(),
            rooms: vec![RoomConfig {
                id: "general".into(),
                participants: vec!["alice".into()],
            }],
            ..Config::default()
        };

        let first = Arc::new(build_coordinator(&config).unwrap());
        let (sender, mut rx) = Sender::detached("peer");
        let handler = IngestHandler::new(Arc::clone(&first));
        hello(&handler, &sender, "alice").await;
        let req = UploadChunkRequest {
            header: chunk(None, 1, 1, 2),
            payload: b"hi".to_vec(),
        };
        handler
            .on_upload_chunk(sender.clone(), request("c1", MessageType::UploadChunk, &req))
            .await;
        assert!(drain(&mut rx).iter().any(|m| m.msg_type == MessageType::UploadComplete));
        drop(handler);
        drop(first);

        let second = build_coordinator(&config).unwrap();
        assert_eq!(second.records().len(), 1);
    }
}
