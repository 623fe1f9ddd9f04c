//! Chunked file uploader.
//!
//! A file is split into fixed-size chunks which are sent concurrently.
//! Each chunk carries its own hash and is retried with exponential
//! backoff. Once every chunk is in, the upload is completed and the
//! server launches processing.

use std::fmt::Write;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use indicatif::{HumanBytes, ProgressBar, ProgressState, ProgressStyle};

use crate::api::{ApiClient, ApiError};
use arrears::api::v1::operation::ProgressResponse;
use arrears::api::v1::upload::{CompleteUploadResponse, InitiateUploadRequest};
use arrears::hash::Hash;
use arrears::report::ReportKind;

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Seconds to hold each progress poll open on the server.
const PROGRESS_POLL_WAIT: u64 = 10;

/// Upper bound on the delay between two attempts at a chunk.
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Configuration for uploading a file.
#[derive(Clone, Copy, Debug)]
pub struct UploadConfig {
    /// Size of each chunk but the last, in bytes.
    pub chunk_size: u64,

    /// Retries per chunk after the first attempt.
    pub max_retries: u32,

    /// Number of chunks in flight at once.
    pub concurrency: usize,

    /// Delay before the first retry. Doubles on every further attempt.
    pub retry_base: Duration,

    /// Suppress progress bars.
    pub quiet: bool,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: 3,
            concurrency: 4,
            retry_base: Duration::from_secs(1),
            quiet: false,
        }
    }
}

/// How a file is split into chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
}

impl ChunkPlan {
    /// Returns the byte range of a 1-based chunk number.
    pub fn range(&self, chunk_number: u32) -> Range<usize> {
        let start = (chunk_number as u64 - 1) * self.chunk_size;
        let end = (start + self.chunk_size).min(self.total_size);
        start as usize..end as usize
    }

    pub fn chunk_numbers(&self) -> impl Iterator<Item = u32> {
        1..=self.total_chunks
    }
}

/// Splits `total_size` bytes into chunks of `chunk_size`.
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Result<ChunkPlan> {
    if total_size == 0 {
        return Err(anyhow!("Cannot upload an empty file"));
    }

    if chunk_size == 0 {
        return Err(anyhow!("Chunk size must be positive"));
    }

    let total_chunks = u32::try_from(total_size.div_ceil(chunk_size))
        .map_err(|_| anyhow!("Too many chunks; use a larger chunk size"))?;

    Ok(ChunkPlan {
        total_size,
        chunk_size,
        total_chunks,
    })
}

/// Uploads a file and launches the given report on it.
pub async fn upload_file(
    api: &ApiClient,
    path: &Path,
    report: ReportKind,
    config: UploadConfig,
) -> Result<CompleteUploadResponse> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow!("{} has no valid file name", path.display()))?
        .to_string();

    let data = Bytes::from(tokio::fs::read(path).await?);
    let plan = plan_chunks(data.len() as u64, config.chunk_size)?;

    let session = api
        .initiate_upload(&InitiateUploadRequest {
            filename: filename.clone(),
            total_size: plan.total_size,
            total_chunks: plan.total_chunks,
            sha256: Some(Hash::sha256_from_bytes(&data)),
        })
        .await?;

    let pb = if config.quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(plan.total_size)
    };
    pb.set_style(upload_style(&filename)?);

    let uploaded = stream::iter(plan.chunk_numbers())
        .map(|chunk_number| {
            let chunk = data.slice(plan.range(chunk_number));
            let session_id = session.session_id.as_str();
            let pb = &pb;

            async move {
                let len = chunk.len() as u64;
                upload_chunk_with_retry(api, session_id, chunk_number, chunk, &config).await?;
                pb.inc(len);
                Ok::<(), anyhow::Error>(())
            }
        })
        .buffer_unordered(config.concurrency.max(1))
        .try_collect::<Vec<()>>()
        .await;

    if let Err(e) = uploaded {
        pb.abandon();

        if let Err(cancel_err) = api.cancel_upload(&session.session_id).await {
            eprintln!(
                "Failed to cancel upload session {}: {}",
                session.session_id, cancel_err
            );
        }

        return Err(e);
    }

    let completed = api.complete_upload(&session.session_id, report).await?;
    pb.finish();

    Ok(completed)
}

/// Uploads a single chunk with retry logic.
async fn upload_chunk_with_retry(
    api: &ApiClient,
    session_id: &str,
    chunk_number: u32,
    chunk: Bytes,
    config: &UploadConfig,
) -> Result<()> {
    let hash = Hash::sha256_from_bytes(&chunk);
    let mut attempt = 0;

    loop {
        match api
            .upload_chunk(session_id, chunk_number, chunk.clone(), &hash)
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if attempt < config.max_retries && is_retryable(&e) => {
                attempt += 1;
                tokio::time::sleep(retry_delay(config.retry_base, attempt)).await;
            }
            Err(e) => {
                return Err(e.context(format!("Failed to upload chunk {}", chunk_number)));
            }
        }
    }
}

/// Returns the delay before the given 1-based retry.
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

/// Client errors are final. Transport errors and server errors are not.
fn is_retryable(e: &anyhow::Error) -> bool {
    match e.downcast_ref::<ApiError>() {
        Some(api_error) => api_error.is_retryable(),
        None => true,
    }
}

/// Follows an operation until it finishes.
pub async fn watch_progress(
    api: &ApiClient,
    operation_id: &str,
    quiet: bool,
) -> Result<ProgressResponse> {
    let pb = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(100)
    };
    pb.set_style(
        ProgressStyle::with_template("{spinner} {bar:40.cyan/blue} {pos:>3}% {wide_msg}")?
            .progress_chars("██ "),
    );

    loop {
        let progress = api
            .get_progress(operation_id, Some(PROGRESS_POLL_WAIT))
            .await?;

        pb.set_position(progress.percentage.floor() as u64);
        pb.set_message(progress.message.clone());

        if progress.completed || progress.failed {
            if progress.completed {
                pb.finish();
            } else {
                pb.abandon();
            }
            return Ok(progress);
        }
    }
}

fn upload_style(filename: &str) -> Result<ProgressStyle> {
    let template = format!(
        "{{spinner}} {: <20.20} {{bar:40.green/blue}} {{human_bytes:10}} ({{average_speed}})",
        filename,
    );

    let style = ProgressStyle::with_template(&template)?
        .progress_chars("██ ")
        .with_key("human_bytes", |state: &ProgressState, w: &mut dyn Write| {
            let _ = write!(w, "{}", HumanBytes(state.pos()));
        })
        .with_key(
            "average_speed",
            |state: &ProgressState, w: &mut dyn Write| match (state.pos(), state.elapsed()) {
                (pos, elapsed) if elapsed > Duration::ZERO => {
                    let bytes_per_sec = pos as f64 / elapsed.as_secs_f64();
                    let _ = write!(w, "{}/s", HumanBytes(bytes_per_sec as u64));
                }
                _ => {
                    let _ = write!(w, "-");
                }
            },
        );

    Ok(style)
}
