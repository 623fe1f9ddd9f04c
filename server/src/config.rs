//! Server configuration.
//!
//! The configuration is a TOML document. It is looked up, in order, from
//! the path given on the command line (or `ARREARS_SERVER_CONFIG`), from a
//! base64-encoded document in `ARREARS_SERVER_CONFIG_BASE64`, and finally
//! falls back to the built-in defaults.

use std::env;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use serde::Deserialize;

/// Environment variable storing the Base64-encoded TOML configuration.
///
/// This is useful for deploying to certain application platforms.
const ENV_CONFIG_BASE64: &str = "ARREARS_SERVER_CONFIG_BASE64";

/// Configuration for the Arrears server.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address to listen on.
    #[serde(default = "default_listen_address")]
    pub listen: SocketAddr,

    /// Chunked upload configuration.
    #[serde(rename = "chunked-upload", default)]
    pub chunked_upload: ChunkedUploadConfig,

    /// Progress tracking configuration.
    #[serde(default)]
    pub progress: ProgressConfig,

    /// Result retention configuration.
    #[serde(default)]
    pub results: ResultsConfig,

    /// Pagination configuration.
    #[serde(default)]
    pub pagination: PaginationConfig,
}

/// Chunked upload configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkedUploadConfig {
    /// Seconds of inactivity after which an open session expires.
    #[serde(rename = "session-ttl", default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// Seconds between two sweeps of the session reaper.
    #[serde(rename = "reaper-interval", default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,

    /// Largest file that may be declared, in bytes.
    #[serde(rename = "max-upload-size", default = "default_max_upload_size")]
    pub max_upload_size: u64,

    /// Largest single chunk, in bytes.
    #[serde(rename = "max-chunk-size", default = "default_max_chunk_size")]
    pub max_chunk_size: u64,

    /// Largest number of chunks a file may be split into.
    #[serde(rename = "max-chunks", default = "default_max_chunks")]
    pub max_chunks: u32,

    /// File extensions accepted for upload, without the dot.
    #[serde(rename = "allowed-extensions", default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Where chunks are kept until assembly.
    #[serde(default)]
    pub storage: ChunkStorageConfig,
}

/// Scratch storage for chunks.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChunkStorageConfig {
    /// Keep chunks in memory.
    #[default]
    Memory,

    /// Keep chunks in a local directory.
    Local(LocalChunkStorageConfig),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalChunkStorageConfig {
    /// Directory that holds one subdirectory per upload session.
    pub path: PathBuf,
}

/// Progress tracking configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgressConfig {
    /// Seconds a finished operation's progress stays readable.
    #[serde(rename = "retention", default = "default_progress_retention")]
    pub retention_secs: u64,

    /// Seconds between two eviction sweeps.
    #[serde(rename = "sweep-interval", default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Longest a progress poll may wait for a change, in seconds.
    #[serde(rename = "max-wait", default = "default_max_wait")]
    pub max_wait_secs: u64,
}

/// Result retention configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultsConfig {
    /// Seconds a result set stays available after it was produced.
    #[serde(rename = "retention", default = "default_results_retention")]
    pub retention_secs: u64,
}

/// Pagination configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PaginationConfig {
    /// Page size when the client does not ask for one.
    #[serde(rename = "default-limit", default = "default_page_limit")]
    pub default_limit: usize,

    /// Largest page size a client may ask for.
    #[serde(rename = "max-limit", default = "default_max_page_limit")]
    pub max_limit: usize,
}

impl Config {
    /// Checks invariants that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let upload = &self.chunked_upload;

        if upload.session_ttl_secs == 0 {
            return Err(anyhow!("chunked-upload.session-ttl must be positive"));
        }

        if upload.reaper_interval_secs == 0 || self.progress.sweep_interval_secs == 0 {
            return Err(anyhow!("Sweep intervals must be positive"));
        }

        if upload.max_chunk_size == 0 || upload.max_chunks == 0 {
            return Err(anyhow!("Chunk limits must be positive"));
        }

        if upload.max_chunk_size > upload.max_upload_size {
            return Err(anyhow!(
                "chunked-upload.max-chunk-size must not exceed max-upload-size"
            ));
        }

        let pagination = &self.pagination;
        if pagination.max_limit == 0
            || pagination.default_limit == 0
            || pagination.default_limit > pagination.max_limit
        {
            return Err(anyhow!(
                "pagination.default-limit must be between 1 and max-limit"
            ));
        }

        Ok(())
    }
}

impl ChunkedUploadConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

impl ProgressConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl ResultsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen_address(),
            chunked_upload: ChunkedUploadConfig::default(),
            progress: ProgressConfig::default(),
            results: ResultsConfig::default(),
            pagination: PaginationConfig::default(),
        }
    }
}

impl Default for ChunkedUploadConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
            reaper_interval_secs: default_reaper_interval(),
            max_upload_size: default_max_upload_size(),
            max_chunk_size: default_max_chunk_size(),
            max_chunks: default_max_chunks(),
            allowed_extensions: default_allowed_extensions(),
            storage: ChunkStorageConfig::default(),
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_progress_retention(),
            sweep_interval_secs: default_sweep_interval(),
            max_wait_secs: default_max_wait(),
        }
    }
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_results_retention(),
        }
    }
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_limit: default_page_limit(),
            max_limit: default_max_page_limit(),
        }
    }
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from((Ipv6Addr::UNSPECIFIED, 8080))
}

fn default_session_ttl() -> u64 {
    60 * 60
}

fn default_reaper_interval() -> u64 {
    60
}

fn default_max_upload_size() -> u64 {
    50 * 1024 * 1024
}

fn default_max_chunk_size() -> u64 {
    8 * 1024 * 1024
}

fn default_max_chunks() -> u32 {
    10_000
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["csv".to_string()]
}

fn default_progress_retention() -> u64 {
    10 * 60
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_max_wait() -> u64 {
    30
}

fn default_results_retention() -> u64 {
    60 * 60
}

fn default_page_limit() -> usize {
    20
}

fn default_max_page_limit() -> usize {
    100
}

/// Loads the configuration.
pub async fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let config: Config = if let Some(path) = config_path {
        let s = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        toml::from_str(&s)?
    } else if let Ok(encoded) = env::var(ENV_CONFIG_BASE64) {
        let decoded = String::from_utf8(BASE64_STANDARD.decode(encoded.as_bytes())?)?;
        toml::from_str(&decoded)?
    } else {
        tracing::info!("No configuration given, using defaults");
        Config::default()
    };

    config.validate()?;

    Ok(config)
}
