//! Chunked uploads.
//!
//! A file is uploaded in four steps:
//!
//! 1. `POST /_api/v1/uploads` declares the file and opens a session
//! 2. `PUT /_api/v1/uploads/{session_id}/chunks/{chunk_number}` sends each
//!    chunk, in any order and as many times as needed
//! 3. `POST /_api/v1/uploads/{session_id}/complete` assembles the file and
//!    launches processing
//! 4. The returned operation ID is used to poll progress and page results

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::Hash;
use crate::report::ReportKind;

/// Header containing the hash of a chunk.
///
/// Optional. When present, the server verifies the chunk before
/// admitting it.
pub const ARREARS_CHUNK_HASH: &str = "X-Arrears-Chunk-Hash";

/// Request to open an upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateUploadRequest {
    /// The name of the file being uploaded.
    pub filename: String,

    /// The total size of the file, in bytes.
    pub total_size: u64,

    /// The number of chunks the file will be sent in.
    pub total_chunks: u32,

    /// The hash of the whole file.
    ///
    /// When set, the assembled file is verified against it.
    #[serde(default)]
    pub sha256: Option<Hash>,
}

/// Response to opening an upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiateUploadResponse {
    /// The session to send chunks to.
    pub session_id: String,

    /// The recommended chunk size, in bytes.
    pub chunk_size: u64,

    /// When the session expires if no chunk arrives.
    pub expires_at: DateTime<Utc>,
}

/// Response to uploading a chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunkResponse {
    /// The chunk that was admitted.
    pub chunk_number: u32,

    /// The number of distinct chunks received so far.
    pub chunks_received: u32,

    /// The number of chunks still missing.
    pub chunks_remaining: u32,

    /// Upload progress, from 0 to 100.
    pub percentage: f64,
}

/// Request to complete an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteUploadRequest {
    /// The report to produce from the assembled file.
    pub report: ReportKind,
}

/// Response to completing an upload.
///
/// Processing has been launched but not finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteUploadResponse {
    /// The operation to poll for progress and results.
    pub operation_id: String,

    pub session_id: String,

    pub filename: String,

    /// The size of the assembled file, in bytes.
    pub size: u64,

    /// The hash of the assembled file.
    pub sha256: Hash,
}

/// The state of an upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    /// Accepting chunks.
    Open,

    /// Chunks are being concatenated.
    Assembling,

    /// The file was assembled and handed off.
    Complete,

    /// Cancelled by the client or by a failed assembly.
    Cancelled,

    /// No activity before the expiry deadline.
    Expired,
}

impl SessionStatus {
    /// Returns whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Expired)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "OPEN",
            Self::Assembling => "ASSEMBLING",
            Self::Complete => "COMPLETE",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}

/// Status of an upload session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadStatus {
    pub session_id: String,

    pub filename: String,

    pub status: SessionStatus,

    pub chunks_uploaded: u32,

    pub total_chunks: u32,

    /// Upload progress, from 0 to 100.
    pub percentage: f64,

    /// Chunk numbers not received yet, in ascending order.
    pub missing_chunks: Vec<u32>,

    pub expires_at: DateTime<Utc>,
}
