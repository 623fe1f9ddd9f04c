//! Chunked upload sessions.
//!
//! A session moves through `OPEN → ASSEMBLING → COMPLETE` on success. Any
//! non-terminal session may become `CANCELLED` or `EXPIRED`, and those
//! states are final.
//!
//! Each session carries a lifecycle lock. Chunk admission holds it shared,
//! so chunks with different numbers are written in parallel. Completion,
//! cancellation and expiry hold it exclusively, which makes the
//! check-and-transition of completion observe a consistent chunk count.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use uuid::Uuid;

use crate::chunk_store::ChunkStore;
use crate::config::ChunkedUploadConfig;
use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::progress::percentage;
use arrears::api::v1::upload::{SessionStatus, UploadStatus};
use arrears::hash::Hash;

/// Longest accepted filename, in bytes.
const MAX_FILENAME_LEN: usize = 255;

/// A chunked upload session.
#[derive(Debug)]
pub struct UploadSession {
    /// Unique session ID.
    pub session_id: String,

    /// Name of the file being uploaded.
    pub filename: String,

    /// Size of the file declared by the client.
    pub declared_size: u64,

    /// Total number of chunks expected.
    pub total_chunks: u32,

    /// Recommended size of each chunk (except possibly the last).
    pub chunk_size: u64,

    /// Hash of the whole file declared by the client, if any.
    pub sha256: Option<Hash>,

    /// When this session was created.
    pub created_at: DateTime<Utc>,

    status: RwLock<SessionStatus>,

    ledger: Mutex<ChunkLedger>,
}

/// Bookkeeping of received chunks.
#[derive(Debug)]
struct ChunkLedger {
    received: BTreeMap<u32, ChunkReceipt>,
    bytes_received: u64,

    /// Bytes of chunks being written to the store.
    bytes_reserved: u64,

    /// Serializes writes to the same chunk number.
    slots: HashMap<u32, Arc<AsyncMutex<()>>>,

    expires_at: DateTime<Utc>,

    /// When the session reached a terminal state.
    finished_at: Option<DateTime<Utc>>,
}

/// Receipt for a stored chunk.
#[derive(Debug, Clone)]
pub struct ChunkReceipt {
    pub size: u64,
    pub sha256: Hash,
    pub received_at: DateTime<Utc>,
}

/// A newly opened session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub chunk_size: u64,
    pub expires_at: DateTime<Utc>,
}

/// Acknowledgement of an admitted chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkAck {
    pub chunk_number: u32,
    pub chunks_received: u32,
    pub chunks_remaining: u32,
    pub percentage: f64,
}

/// A file reassembled from its chunks.
#[derive(Debug, Clone)]
pub struct AssembledFile {
    pub session_id: String,
    pub filename: String,
    pub data: Bytes,
    pub sha256: Hash,
}

/// Outcome of one reaper sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapStats {
    /// Sessions that were moved to `EXPIRED`.
    pub expired: usize,

    /// Terminal sessions dropped from the table.
    pub removed: usize,
}

impl UploadSession {
    fn new(
        filename: String,
        declared_size: u64,
        total_chunks: u32,
        chunk_size: u64,
        sha256: Option<Hash>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();

        Self {
            session_id: Uuid::new_v4().to_string(),
            filename,
            declared_size,
            total_chunks,
            chunk_size,
            sha256,
            created_at: now,
            status: RwLock::new(SessionStatus::Open),
            ledger: Mutex::new(ChunkLedger {
                received: BTreeMap::new(),
                bytes_received: 0,
                bytes_reserved: 0,
                slots: HashMap::new(),
                expires_at: now + ttl,
                finished_at: None,
            }),
        }
    }

    fn ledger(&self) -> std::sync::MutexGuard<'_, ChunkLedger> {
        // The ledger is never left inconsistent by a panic.
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the number of distinct chunks received.
    pub fn chunks_received(&self) -> u32 {
        self.ledger().received.len() as u32
    }

    /// Returns the receipt of a chunk, if it was received.
    pub fn receipt(&self, chunk_number: u32) -> Option<ChunkReceipt> {
        self.ledger().received.get(&chunk_number).cloned()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.ledger().expires_at
    }

    fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.ledger().expires_at
    }

    /// Returns the write lock of a chunk number.
    fn slot(&self, chunk_number: u32) -> Arc<AsyncMutex<()>> {
        self.ledger()
            .slots
            .entry(chunk_number)
            .or_default()
            .clone()
    }

    /// Reserves room for a chunk within the declared size.
    ///
    /// The caller holds the chunk's slot, so the bytes it replaces cannot
    /// change until the reservation is recorded or released.
    fn reserve(&self, chunk_number: u32, size: u64) -> ServerResult<()> {
        let mut ledger = self.ledger();
        let replaced = ledger
            .received
            .get(&chunk_number)
            .map(|receipt| receipt.size)
            .unwrap_or(0);

        if ledger.bytes_received - replaced + ledger.bytes_reserved + size > self.declared_size {
            return Err(ServerError::validation(format!(
                "Chunk {} would exceed the declared file size of {} bytes",
                chunk_number, self.declared_size
            )));
        }

        ledger.bytes_reserved += size;
        Ok(())
    }

    fn release_reservation(&self, size: u64) {
        self.ledger().bytes_reserved -= size;
    }

    /// Records a stored chunk and pushes the expiry forward.
    fn record_chunk(&self, chunk_number: u32, receipt: ChunkReceipt, ttl: Duration) -> ChunkAck {
        let mut ledger = self.ledger();

        ledger.expires_at = receipt.received_at + ttl;
        ledger.bytes_reserved -= receipt.size;
        ledger.bytes_received += receipt.size;
        if let Some(previous) = ledger.received.insert(chunk_number, receipt) {
            ledger.bytes_received -= previous.size;
        }

        let chunks_received = ledger.received.len() as u32;

        ChunkAck {
            chunk_number,
            chunks_received,
            chunks_remaining: self.total_chunks - chunks_received,
            percentage: percentage(chunks_received as u64, self.total_chunks as u64),
        }
    }

    fn mark_finished(&self, now: DateTime<Utc>) {
        self.ledger().finished_at = Some(now);
    }

    fn status_snapshot(&self, status: SessionStatus) -> UploadStatus {
        let ledger = self.ledger();
        let chunks_uploaded = ledger.received.len() as u32;
        let missing_chunks = (1..=self.total_chunks)
            .filter(|n| !ledger.received.contains_key(n))
            .collect();

        UploadStatus {
            session_id: self.session_id.clone(),
            filename: self.filename.clone(),
            status,
            chunks_uploaded,
            total_chunks: self.total_chunks,
            percentage: percentage(chunks_uploaded as u64, self.total_chunks as u64),
            missing_chunks,
            expires_at: ledger.expires_at,
        }
    }
}

/// Manages chunked upload sessions.
#[derive(Debug)]
pub struct UploadSessionManager {
    sessions: DashMap<String, Arc<UploadSession>>,
    store: Arc<dyn ChunkStore>,
    config: ChunkedUploadConfig,
}

impl UploadSessionManager {
    /// Creates a new session manager.
    pub fn new(config: ChunkedUploadConfig, store: Arc<dyn ChunkStore>) -> Self {
        Self {
            sessions: DashMap::new(),
            store,
            config,
        }
    }

    /// Opens a new upload session.
    pub fn initiate(
        &self,
        filename: &str,
        declared_size: u64,
        total_chunks: u32,
        sha256: Option<Hash>,
    ) -> ServerResult<SessionHandle> {
        validate_filename(filename, &self.config.allowed_extensions)?;

        if declared_size == 0 {
            return Err(ServerError::validation("total_size must be positive"));
        }

        if declared_size > self.config.max_upload_size {
            return Err(ServerError::validation(format!(
                "File too large. Maximum size: {} bytes",
                self.config.max_upload_size
            )));
        }

        if total_chunks == 0 {
            return Err(ServerError::validation("total_chunks must be at least 1"));
        }

        if total_chunks > self.config.max_chunks {
            return Err(ServerError::validation(format!(
                "total_chunks must not exceed {}",
                self.config.max_chunks
            )));
        }

        let chunk_size = declared_size.div_ceil(total_chunks as u64);
        if chunk_size > self.config.max_chunk_size {
            return Err(ServerError::validation(format!(
                "{} chunks of at most {} bytes cannot carry {} bytes",
                total_chunks, self.config.max_chunk_size, declared_size
            )));
        }

        let session = UploadSession::new(
            filename.to_string(),
            declared_size,
            total_chunks,
            chunk_size,
            sha256,
            self.config.session_ttl(),
        );

        let handle = SessionHandle {
            session_id: session.session_id.clone(),
            chunk_size,
            expires_at: session.expires_at(),
        };

        tracing::info!(
            "Upload session {} opened for {} ({} bytes in {} chunks)",
            handle.session_id,
            filename,
            declared_size,
            total_chunks
        );

        self.sessions
            .insert(handle.session_id.clone(), Arc::new(session));

        Ok(handle)
    }

    /// Admits a chunk into a session.
    ///
    /// Uploading a chunk number again replaces the earlier bytes without
    /// counting the chunk twice.
    pub async fn put_chunk(
        &self,
        session_id: &str,
        chunk_number: u32,
        data: Bytes,
        expected_hash: Option<Hash>,
    ) -> ServerResult<ChunkAck> {
        let session = self.get(session_id)?;

        {
            let status = session.status.read().await;

            match *status {
                SessionStatus::Open => {}
                SessionStatus::Expired => return Err(not_found(session_id)),
                other => return Err(ErrorKind::InvalidState { status: other }.into()),
            }

            if !session.is_past_expiry(Utc::now()) {
                return self
                    .admit_chunk(&session, chunk_number, data, expected_hash)
                    .await;
            }
        }

        // Expired but not reaped yet.
        self.expire(&session).await;
        Err(not_found(session_id))
    }

    /// Stores a chunk. The caller holds the session's lifecycle lock shared.
    async fn admit_chunk(
        &self,
        session: &UploadSession,
        chunk_number: u32,
        data: Bytes,
        expected_hash: Option<Hash>,
    ) -> ServerResult<ChunkAck> {
        if chunk_number == 0 || chunk_number > session.total_chunks {
            return Err(ErrorKind::OutOfRange {
                chunk_number,
                total_chunks: session.total_chunks,
            }
            .into());
        }

        let size = data.len() as u64;
        if size > self.config.max_chunk_size {
            return Err(ServerError::validation(format!(
                "Chunk {} is {} bytes, the maximum is {}",
                chunk_number, size, self.config.max_chunk_size
            )));
        }

        let sha256 = Hash::sha256_from_bytes(&data);
        if let Some(expected) = expected_hash {
            if expected != sha256 {
                return Err(ErrorKind::Integrity {
                    expected,
                    actual: sha256,
                }
                .into());
            }
        }

        let slot = session.slot(chunk_number);
        let _slot = slot.lock().await;

        session.reserve(chunk_number, size)?;

        if let Err(e) = self
            .store
            .put(&session.session_id, chunk_number, data)
            .await
        {
            session.release_reservation(size);
            return Err(e);
        }

        let receipt = ChunkReceipt {
            size,
            sha256,
            received_at: Utc::now(),
        };
        let ack = session.record_chunk(chunk_number, receipt, self.config.session_ttl());

        tracing::debug!(
            "Chunk {} stored for session {} ({}/{})",
            chunk_number,
            session.session_id,
            ack.chunks_received,
            session.total_chunks
        );

        Ok(ack)
    }

    /// Assembles the file once every chunk has arrived.
    ///
    /// Completion happens at most once. Chunk storage is released as soon
    /// as the assembled file exists.
    pub async fn complete(&self, session_id: &str) -> ServerResult<AssembledFile> {
        let session = self.get(session_id)?;
        let mut status = session.status.write().await;

        match *status {
            SessionStatus::Open => {}
            SessionStatus::Complete => return Err(ErrorKind::AlreadyCompleted.into()),
            SessionStatus::Expired => return Err(not_found(session_id)),
            other => return Err(ErrorKind::InvalidState { status: other }.into()),
        }

        let now = Utc::now();
        if session.is_past_expiry(now) {
            *status = SessionStatus::Expired;
            self.finish(&session, now).await;
            return Err(not_found(session_id));
        }

        let received = session.chunks_received();
        if received != session.total_chunks {
            return Err(ErrorKind::Incomplete {
                received,
                total: session.total_chunks,
            }
            .into());
        }

        *status = SessionStatus::Assembling;
        tracing::info!("Upload complete for session {}, assembling", session_id);

        match self.assemble(&session).await {
            Ok(file) => {
                *status = SessionStatus::Complete;
                self.finish(&session, Utc::now()).await;

                tracing::info!(
                    "Assembled {} ({} bytes, {}) for session {}",
                    file.filename,
                    file.data.len(),
                    file.sha256,
                    session_id
                );

                Ok(file)
            }
            Err(e) => {
                tracing::warn!("Assembly failed for session {}: {}", session_id, e);

                *status = SessionStatus::Cancelled;
                self.finish(&session, Utc::now()).await;

                Err(e)
            }
        }
    }

    async fn assemble(&self, session: &UploadSession) -> ServerResult<AssembledFile> {
        let data = self
            .store
            .assemble(&session.session_id, session.total_chunks)
            .await?;
        let sha256 = Hash::sha256_from_bytes(&data);

        if let Some(expected) = session.sha256 {
            if expected != sha256 {
                return Err(ErrorKind::Integrity {
                    expected,
                    actual: sha256,
                }
                .into());
            }
        }

        Ok(AssembledFile {
            session_id: session.session_id.clone(),
            filename: session.filename.clone(),
            data,
            sha256,
        })
    }

    /// Cancels a session and releases its chunks.
    ///
    /// Cancelling a session that already reached a terminal state is a
    /// no-op. In particular, a completed session stays completed.
    pub async fn cancel(&self, session_id: &str) -> ServerResult<()> {
        let session = self.get(session_id)?;
        let mut status = session.status.write().await;

        if status.is_terminal() {
            tracing::debug!("Session {} is already {}, not cancelling", session_id, *status);
            return Ok(());
        }

        *status = SessionStatus::Cancelled;
        self.finish(&session, Utc::now()).await;

        tracing::info!("Upload session {} cancelled", session_id);

        Ok(())
    }

    /// Returns the status of a session.
    ///
    /// An idle session found past its expiry is expired on the spot.
    pub async fn status(&self, session_id: &str) -> ServerResult<UploadStatus> {
        let session = self.get(session_id)?;

        if session.is_past_expiry(Utc::now()) {
            self.expire(&session).await;
        }

        let status = *session.status.read().await;

        Ok(session.status_snapshot(status))
    }

    /// Expires idle sessions and drops old terminal sessions.
    pub async fn reap_expired(&self) -> ReapStats {
        self.reap_expired_at(Utc::now()).await
    }

    /// Sweeps the session table as of `now`.
    ///
    /// Terminal sessions are kept for one more TTL so that status lookups
    /// still report how they ended.
    pub async fn reap_expired_at(&self, now: DateTime<Utc>) -> ReapStats {
        let sessions: Vec<Arc<UploadSession>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut stats = ReapStats::default();
        let tombstone_ttl = self.config.session_ttl();

        for session in sessions {
            let mut status = session.status.write().await;

            if !status.is_terminal() {
                if session.is_past_expiry(now) {
                    tracing::info!("Upload session {} expired", session.session_id);

                    *status = SessionStatus::Expired;
                    self.finish(&session, now).await;
                    stats.expired += 1;
                }
                continue;
            }

            let finished_at = session.ledger().finished_at;
            if let Some(finished_at) = finished_at {
                if now >= finished_at + tombstone_ttl {
                    self.sessions.remove(&session.session_id);
                    stats.removed += 1;
                }
            }
        }

        if stats.expired > 0 || stats.removed > 0 {
            tracing::debug!(
                "Reaper expired {} and removed {} upload sessions",
                stats.expired,
                stats.removed
            );
        }

        stats
    }

    /// Gets the current number of sessions in the table.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn get(&self, session_id: &str) -> ServerResult<Arc<UploadSession>> {
        self.sessions
            .get(session_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found(session_id))
    }

    /// Moves a session to `EXPIRED` if it is still open past its expiry.
    async fn expire(&self, session: &UploadSession) {
        let mut status = session.status.write().await;
        let now = Utc::now();

        if !status.is_terminal() && session.is_past_expiry(now) {
            tracing::info!("Upload session {} expired", session.session_id);

            *status = SessionStatus::Expired;
            self.finish(session, now).await;
        }
    }

    /// Releases the chunks of a session that just became terminal.
    async fn finish(&self, session: &UploadSession, now: DateTime<Utc>) {
        session.mark_finished(now);

        if let Err(e) = self.store.release(&session.session_id).await {
            tracing::warn!(
                "Failed to release chunks of session {}: {}",
                session.session_id,
                e
            );
        }
    }
}

/// Enforces the safe-name policy on an uploaded filename.
pub fn validate_filename(filename: &str, allowed_extensions: &[String]) -> ServerResult<()> {
    if filename.is_empty() || filename.len() > MAX_FILENAME_LEN {
        return Err(ServerError::validation(format!(
            "Filename must be between 1 and {} bytes",
            MAX_FILENAME_LEN
        )));
    }

    if filename.starts_with('.') {
        return Err(ServerError::validation(
            "Filename must not start with a dot",
        ));
    }

    let safe = filename
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'));
    if !safe {
        return Err(ServerError::validation(
            "Filename may only contain letters, digits, spaces, '-', '_' and '.'",
        ));
    }

    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    if !allowed_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
    {
        return Err(ServerError::validation(format!(
            "Invalid file type '{}'. Allowed: {}",
            extension,
            allowed_extensions.join(", ")
        )));
    }

    Ok(())
}

fn not_found(session_id: &str) -> ServerError {
    ServerError::not_found(format!("Upload session {}", session_id))
}
