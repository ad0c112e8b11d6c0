use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chatdrop_protocol::{
    AttachmentAvailable, ChunkAck, ChunkHeader, CompletionEvent, ErrorEvent, MilestoneEvent,
    ProgressEvent, SessionStatus, UploadEvent, UploadStartedEvent,
};
use chatdrop_storage::{
    DedupIndex, FileRecord, NewFileRecord, Registration, StorageCategory, StoragePlacer,
};
use chatdrop_transfer::{
    Assembler, ChunkBuffer, ChunkDescriptor, PROGRESS_BAR_WIDTH, ProgressSnapshot, TransferError,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::IngestError;
use crate::events::{AttachmentBus, EventSink};
use crate::guard::AccessGuard;
use crate::policy::UploadPolicy;
use crate::session::{SessionState, UploadSession, derive_upload_id};

/// Shortest sweep period, whatever the policy says.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Live sessions plus recently finished ones, by upload id.
#[derive(Default)]
struct Registry {
    live: HashMap<String, Arc<UploadSession>>,
    /// Terminal status and when it was reached.
    finished: HashMap<String, (SessionStatus, Instant)>,
}

impl Registry {
    fn retire(&mut self, upload_id: &str, status: SessionStatus) {
        self.live.remove(upload_id);
        self.finished
            .insert(upload_id.to_string(), (status, Instant::now()));
    }

    fn is_known(&self, upload_id: &str) -> bool {
        self.live.contains_key(upload_id) || self.finished.contains_key(upload_id)
    }

    /// Derives an id no current or recent session uses.
    fn unused_id(&self, uploader_id: &str, header: &ChunkHeader) -> String {
        let mut millis = chrono::Utc::now().timestamp_millis();
        loop {
            let id = derive_upload_id(
                &header.declared_file_name,
                uploader_id,
                header.total_chunks,
                millis,
            );
            if !self.is_known(&id) {
                return id;
            }
            millis += 1;
        }
    }
}

/// Runs the upload state machine for every session.
///
/// ```text
/// ACTIVE ──all chunks──▶ ASSEMBLING ──▶ COMPLETE
///   │                        └────────▶ FAILED
///   ├──overflow / cancel───────────────▶ FAILED
///   └──idle timeout────────────────────▶ ABANDONED
/// ```
///
/// Each session has its own lock, so chunks for different uploads never
/// contend. The registry lock is only held for map lookups and is always
/// taken after a session lock, never before one.
pub struct UploadCoordinator {
    policy: UploadPolicy,
    guard: Arc<dyn AccessGuard>,
    index: Arc<DedupIndex>,
    placer: Arc<StoragePlacer>,
    bus: AttachmentBus,
    registry: Mutex<Registry>,
}

impl UploadCoordinator {
    pub fn new(
        policy: UploadPolicy,
        guard: Arc<dyn AccessGuard>,
        index: Arc<DedupIndex>,
        placer: Arc<StoragePlacer>,
        bus: AttachmentBus,
    ) -> Self {
        Self {
            policy,
            guard,
            index,
            placer,
            bus,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Record lookups by id and by content hash.
    pub fn records(&self) -> &Arc<DedupIndex> {
        &self.index
    }

    pub fn placer(&self) -> &StoragePlacer {
        &self.placer
    }

    /// Receives [`AttachmentAvailable`] for every completed upload.
    pub fn subscribe(&self) -> broadcast::Receiver<AttachmentAvailable> {
        self.bus.subscribe()
    }

    /// Number of sessions that are active or assembling.
    pub fn live_sessions(&self) -> usize {
        self.registry.lock().live.len()
    }

    /// Accepts one chunk from `uploader_id`.
    ///
    /// Events for the session go to `sink`, which replaces the sink of
    /// earlier chunks. When this chunk completes the upload, the call
    /// returns after assembly and placement have finished.
    pub async fn accept_chunk(
        &self,
        uploader_id: &str,
        header: ChunkHeader,
        payload: Vec<u8>,
        sink: Arc<dyn EventSink>,
    ) -> Result<ChunkAck, IngestError> {
        let session = self.resolve_session(uploader_id, &header, &sink).await?;
        self.store_chunk(session, header, payload, sink).await
    }

    /// Finds the session a chunk belongs to, creating it for a first chunk.
    async fn resolve_session(
        &self,
        uploader_id: &str,
        header: &ChunkHeader,
        sink: &Arc<dyn EventSink>,
    ) -> Result<Arc<UploadSession>, IngestError> {
        if let Some(id) = header.upload_id.as_deref() {
            if let Some(session) = self.lookup(uploader_id, id)? {
                return Ok(session);
            }
        }

        let allowed = self
            .guard
            .is_participant(uploader_id, &header.target_room_id)
            .await;

        let mut registry = self.registry.lock();
        let upload_id = match header.upload_id.as_deref() {
            Some(id) => {
                // Another first chunk with the same id may have won while
                // the guard was consulted.
                if let Some(session) = lookup_in(&registry, uploader_id, id)? {
                    return Ok(session);
                }
                id.to_string()
            }
            None => registry.unused_id(uploader_id, header),
        };

        if !allowed {
            drop(registry);
            let err = IngestError::AccessDenied {
                user_id: uploader_id.to_string(),
                room_id: header.target_room_id.clone(),
            };
            warn!(upload_id = %upload_id, uploader = %uploader_id, room = %header.target_room_id, "upload refused: not a participant");
            sink.emit(failure_event(&upload_id, &err));
            return Err(err);
        }

        if let Err(err) = self.policy.validate(header) {
            registry.retire(&upload_id, SessionStatus::Failed);
            drop(registry);
            warn!(upload_id = %upload_id, error = %err, "upload refused by policy");
            sink.emit(failure_event(&upload_id, &err));
            return Err(err);
        }

        let session = Arc::new(UploadSession::new(
            upload_id.clone(),
            uploader_id,
            header,
            Arc::clone(sink),
        ));
        registry.live.insert(upload_id.clone(), Arc::clone(&session));
        drop(registry);

        info!(
            upload_id = %upload_id,
            uploader = %uploader_id,
            room = %header.target_room_id,
            file = %header.declared_file_name,
            bytes = header.declared_total_size,
            chunks = header.total_chunks,
            "upload session opened"
        );
        Ok(session)
    }

    fn lookup(
        &self,
        uploader_id: &str,
        upload_id: &str,
    ) -> Result<Option<Arc<UploadSession>>, IngestError> {
        lookup_in(&self.registry.lock(), uploader_id, upload_id)
    }

    async fn store_chunk(
        &self,
        session: Arc<UploadSession>,
        header: ChunkHeader,
        payload: Vec<u8>,
        sink: Arc<dyn EventSink>,
    ) -> Result<ChunkAck, IngestError> {
        let mut state = session.state.lock().await;
        if state.status != SessionStatus::Active {
            return Err(IngestError::SessionClosed {
                upload_id: session.id.clone(),
                status: state.status,
            });
        }
        if let Err(err) = session.check_metadata(&header) {
            warn!(upload_id = %session.id, chunk = header.chunk_index, error = %err, "chunk rejected");
            return Err(err);
        }

        state.sink = sink;

        let index = header.chunk_index;
        let chunk = ChunkDescriptor::new(&session.id, index, session.total_chunks, payload);
        let size = chunk.len();
        match state.buffer.store(chunk) {
            Ok(outcome) => {
                debug!(upload_id = %session.id, chunk = index, bytes = size, ?outcome, "stored chunk");
            }
            Err(e @ TransferError::IndexOutOfRange { .. }) => {
                warn!(upload_id = %session.id, chunk = index, error = %e, "chunk rejected");
                return Err(e.into());
            }
            Err(e) => {
                let err = IngestError::from(e);
                self.fail_locked(&session, &mut state, &err);
                return Err(err);
            }
        }
        // Only announced once a chunk has actually been stored.
        if !state.announced {
            state.announced = true;
            state.sink.emit(UploadEvent::Started(UploadStartedEvent {
                upload_id: session.id.clone(),
                file_name: session.file_name.clone(),
                total_chunks: session.total_chunks,
                total_bytes: session.declared_total,
            }));
        }

        let now = Instant::now();
        state.last_activity = now;
        let snapshot = ProgressSnapshot::compute(
            state.buffer.received_bytes(),
            state.buffer.received_chunks(),
            session.total_chunks,
            session.declared_total,
            now.saturating_duration_since(session.started_at),
        );
        self.report_progress(&session, &mut state, index, &snapshot);

        let ack = ChunkAck {
            upload_id: session.id.clone(),
            chunk_index: index,
            received_chunks: snapshot.received_chunks,
            received_bytes: snapshot.received_bytes,
            status: SessionStatus::Active,
        };
        if !state.buffer.is_complete() {
            return Ok(ack);
        }

        state.status = SessionStatus::Assembling;
        let buffer = std::mem::take(&mut state.buffer);
        drop(state);
        info!(upload_id = %session.id, bytes = snapshot.received_bytes, "all chunks received, assembling");

        let status = self.finish(&session, buffer).await?;
        Ok(ChunkAck { status, ..ack })
    }

    /// Progress event (only if `received_bytes` did not go down) and any
    /// newly reached milestones.
    fn report_progress(
        &self,
        session: &UploadSession,
        state: &mut SessionState,
        chunk_index: u32,
        snapshot: &ProgressSnapshot,
    ) {
        if snapshot.received_bytes >= state.last_reported_bytes {
            state.last_reported_bytes = snapshot.received_bytes;
            state.sink.emit(UploadEvent::Progress(ProgressEvent {
                upload_id: session.id.clone(),
                chunk_index,
                total_chunks: snapshot.total_chunks,
                received_chunks: snapshot.received_chunks,
                received_bytes: snapshot.received_bytes,
                total_bytes: snapshot.declared_total,
                percent: snapshot.percent(),
                bar: snapshot.bar(PROGRESS_BAR_WIDTH),
                rate_bytes_per_sec: snapshot.rate,
                eta_seconds: snapshot.eta.map(|d| d.as_secs_f64()),
            }));
        }

        for milestone in state.milestones.observe(snapshot) {
            state.sink.emit(UploadEvent::Milestone(MilestoneEvent {
                upload_id: session.id.clone(),
                milestone,
                received_bytes: snapshot.received_bytes,
                total_bytes: snapshot.declared_total,
            }));
        }
    }

    /// Assembles, deduplicates and places a complete upload, then emits its
    /// terminal event.
    async fn finish(
        &self,
        session: &Arc<UploadSession>,
        buffer: ChunkBuffer,
    ) -> Result<SessionStatus, IngestError> {
        let job = Settle {
            assembler: Assembler::new(self.placer.incoming_dir()),
            placer: Arc::clone(&self.placer),
            index: Arc::clone(&self.index),
            upload_id: session.id.clone(),
            uploader_id: session.owner_id.clone(),
            file_name: session.file_name.clone(),
            content_type: session.content_type.clone(),
            declared_total: session.declared_total,
        };
        let result = match tokio::task::spawn_blocking(move || job.run(buffer)).await {
            Ok(result) => result,
            Err(e) => Err(e.into()),
        };

        let mut state = session.state.lock().await;
        let settled = match result {
            Ok(settled) => settled,
            Err(err) => {
                self.fail_locked(session, &mut state, &err);
                return Err(err);
            }
        };

        state.status = SessionStatus::Complete;
        self.registry
            .lock()
            .retire(&session.id, SessionStatus::Complete);

        let resource_id = settled.resource.id;
        info!(
            upload_id = %session.id,
            record_id = %settled.record.id,
            resource_id = %resource_id,
            duplicate = settled.is_duplicate,
            "upload complete"
        );
        state.sink.emit(UploadEvent::Completed(CompletionEvent {
            upload_id: session.id.clone(),
            resource_id: resource_id.to_string(),
            download_path: self.placer.download_path(resource_id),
            content_type: session.content_type.clone(),
            size_bytes: settled.record.size_bytes,
            is_duplicate: settled.is_duplicate,
        }));
        drop(state);

        self.bus.publish(AttachmentAvailable {
            room_id: session.room_id.clone(),
            resource_id: resource_id.to_string(),
            uploader_id: session.owner_id.clone(),
            content_type: session.content_type.clone(),
        });
        Ok(SessionStatus::Complete)
    }

    /// Moves a session to FAILED, releases its buffer and emits its one
    /// error event.
    fn fail_locked(&self, session: &UploadSession, state: &mut SessionState, err: &IngestError) {
        state.status = SessionStatus::Failed;
        state.buffer.clear();
        self.registry
            .lock()
            .retire(&session.id, SessionStatus::Failed);

        match err {
            IngestError::Cancelled => info!(upload_id = %session.id, "upload cancelled"),
            _ => warn!(upload_id = %session.id, error = %err, "upload failed"),
        }
        state.sink.emit(failure_event(&session.id, err));
    }

    /// Cancels an active upload owned by `uploader_id`.
    ///
    /// Returns `false` when the session is assembling or already finished.
    pub async fn cancel(&self, uploader_id: &str, upload_id: &str) -> Result<bool, IngestError> {
        let session = {
            let registry = self.registry.lock();
            match registry.live.get(upload_id) {
                Some(session) => Arc::clone(session),
                None if registry.finished.contains_key(upload_id) => return Ok(false),
                None => return Err(IngestError::UnknownUpload(upload_id.to_string())),
            }
        };
        if session.owner_id != uploader_id {
            return Err(IngestError::NotOwner(upload_id.to_string()));
        }

        let mut state = session.state.lock().await;
        if state.status != SessionStatus::Active {
            return Ok(false);
        }
        self.fail_locked(&session, &mut state, &IngestError::Cancelled);
        Ok(true)
    }

    /// Current status of a live session, or the terminal status of one
    /// that finished within the retention window.
    pub async fn status(&self, upload_id: &str) -> Option<SessionStatus> {
        let session = {
            let registry = self.registry.lock();
            match registry.live.get(upload_id) {
                Some(session) => Arc::clone(session),
                None => {
                    return registry
                        .finished
                        .get(upload_id)
                        .filter(|(_, at)| at.elapsed() < self.policy.status_retention)
                        .map(|(status, _)| *status);
                }
            }
        };
        let status = session.state.lock().await.status;
        Some(status)
    }

    /// Abandons active sessions idle for longer than the policy allows and
    /// forgets expired terminal statuses. Returns the number abandoned.
    ///
    /// Abandonment is silent: no event is emitted. Assembling sessions are
    /// never touched.
    pub async fn sweep(&self) -> usize {
        let sessions: Vec<_> = {
            let mut registry = self.registry.lock();
            let retention = self.policy.status_retention;
            registry
                .finished
                .retain(|_, (_, at)| at.elapsed() < retention);
            registry.live.values().cloned().collect()
        };

        let mut abandoned = 0;
        for session in sessions {
            let mut state = session.state.lock().await;
            let idle = Instant::now().saturating_duration_since(state.last_activity);
            if state.status != SessionStatus::Active || idle < self.policy.idle_timeout {
                continue;
            }
            state.status = SessionStatus::Abandoned;
            state.buffer.clear();
            self.registry
                .lock()
                .retire(&session.id, SessionStatus::Abandoned);
            info!(
                upload_id = %session.id,
                idle_secs = idle.as_secs(),
                "upload abandoned after inactivity"
            );
            abandoned += 1;
        }
        abandoned
    }

    /// Runs [`sweep`](Self::sweep) every `sweep_interval` until `cancel`
    /// fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let period = this.policy.sweep_interval.max(MIN_SWEEP_INTERVAL);
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let n = this.sweep().await;
                        if n > 0 {
                            debug!(abandoned = n, "sweep finished");
                        }
                    }
                }
            }
            debug!("sweeper stopped");
        })
    }
}

fn lookup_in(
    registry: &Registry,
    uploader_id: &str,
    upload_id: &str,
) -> Result<Option<Arc<UploadSession>>, IngestError> {
    if let Some(session) = registry.live.get(upload_id) {
        if session.owner_id != uploader_id {
            return Err(IngestError::NotOwner(upload_id.to_string()));
        }
        return Ok(Some(Arc::clone(session)));
    }
    if let Some((status, _)) = registry.finished.get(upload_id) {
        return Err(IngestError::SessionClosed {
            upload_id: upload_id.to_string(),
            status: *status,
        });
    }
    Ok(None)
}

fn failure_event(upload_id: &str, err: &IngestError) -> UploadEvent {
    UploadEvent::Failed(ErrorEvent {
        upload_id: upload_id.to_string(),
        error_kind: err.kind().unwrap_or(chatdrop_protocol::ErrorKind::StorageFailure),
        message: err.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Assembly, dedup and placement
// ---------------------------------------------------------------------------

/// Records produced for one completed upload.
struct Settled {
    /// This upload's own record.
    record: FileRecord,
    /// The canonical record holding the bytes.
    resource: FileRecord,
    is_duplicate: bool,
}

/// Blocking half of completion, run on the blocking pool.
struct Settle {
    assembler: Assembler,
    placer: Arc<StoragePlacer>,
    index: Arc<DedupIndex>,
    upload_id: String,
    uploader_id: String,
    file_name: String,
    content_type: String,
    declared_total: u64,
}

impl Settle {
    /// Every exit path leaves either a record pointing at an existing file
    /// or no trace at all: the temporary file is removed when dropped, and
    /// a promoted file is removed again if no record ends up owning it.
    fn run(self, buffer: ChunkBuffer) -> Result<Settled, IngestError> {
        let chunks = buffer.into_ordered()?;
        let file = self.assembler.assemble(chunks, self.declared_total)?;
        debug!(upload_id = %self.upload_id, hash = %file.content_hash, bytes = file.size, "assembled");

        let record = NewFileRecord {
            canonical_path: PathBuf::new(),
            original_file_name: self.file_name.clone(),
            content_type: self.content_type.clone(),
            size_bytes: file.size,
            content_hash: file.content_hash.clone(),
            storage_category: StorageCategory::from_content_type(&self.content_type),
            is_duplicate_of: None,
            uploader_id: self.uploader_id.clone(),
        };

        if let Some(canonical) = self.index.canonical_for(&file.content_hash) {
            drop(file);
            let own = self.index.register_duplicate(record, &canonical)?;
            return Ok(Settled {
                record: own,
                resource: canonical,
                is_duplicate: true,
            });
        }

        let placed = self
            .placer
            .promote(file, &self.file_name, &self.content_type)?;
        let record = NewFileRecord {
            canonical_path: placed.path.clone(),
            storage_category: placed.category,
            ..record
        };

        match self.index.register_canonical(record) {
            Ok(Registration::Canonical(own)) => Ok(Settled {
                resource: own.clone(),
                record: own,
                is_duplicate: false,
            }),
            Ok(Registration::LostRace { own, winner }) => {
                self.discard(&placed.path);
                Ok(Settled {
                    record: own,
                    resource: winner,
                    is_duplicate: true,
                })
            }
            Err(e) => {
                self.discard(&placed.path);
                Err(e.into())
            }
        }
    }

    fn discard(&self, path: &Path) {
        if let Err(e) = self.placer.discard(path) {
            warn!(upload_id = %self.upload_id, path = %path.display(), error = %e, "failed to remove unreferenced file");
        }
    }
}
