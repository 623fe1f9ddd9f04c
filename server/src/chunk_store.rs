//! Scratch storage for chunks of uploads in progress.
//!
//! Chunks are addressed by `(session ID, chunk number)`. Writing a chunk
//! number twice replaces the earlier bytes. Assembly reads chunks in
//! chunk-number order, never in arrival order.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::fs;
use uuid::Uuid;

use crate::config::ChunkStorageConfig;
use crate::error::{ServerError, ServerResult};

/// Prefix of the file holding one chunk in a session directory.
const CHUNK_FILE_PREFIX: &str = "chunk_";

/// A store of chunks.
#[async_trait]
pub trait ChunkStore: Send + Sync + Debug + 'static {
    /// Stores a chunk, replacing any previous bytes for the same number.
    async fn put(&self, session_id: &str, chunk_number: u32, data: Bytes) -> ServerResult<()>;

    /// Concatenates chunks `1..=total_chunks` in chunk-number order.
    async fn assemble(&self, session_id: &str, total_chunks: u32) -> ServerResult<Bytes>;

    /// Releases all chunks of a session.
    ///
    /// Releasing a session with no chunks is not an error.
    async fn release(&self, session_id: &str) -> ServerResult<()>;

    /// Returns the chunk numbers held for a session, in ascending order.
    async fn stored_chunks(&self, session_id: &str) -> ServerResult<Vec<u32>>;
}

/// Creates the chunk store described by the configuration.
pub async fn from_config(config: &ChunkStorageConfig) -> ServerResult<Arc<dyn ChunkStore>> {
    match config {
        ChunkStorageConfig::Memory => Ok(Arc::new(MemoryChunkStore::new())),
        ChunkStorageConfig::Local(local) => {
            Ok(Arc::new(LocalChunkStore::new(local.path.clone()).await?))
        }
    }
}

/// Keeps chunks in memory.
#[derive(Debug, Default)]
pub struct MemoryChunkStore {
    sessions: DashMap<String, BTreeMap<u32, Bytes>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn put(&self, session_id: &str, chunk_number: u32, data: Bytes) -> ServerResult<()> {
        self.sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(chunk_number, data);
        Ok(())
    }

    async fn assemble(&self, session_id: &str, total_chunks: u32) -> ServerResult<Bytes> {
        let chunks = self
            .sessions
            .get(session_id)
            .ok_or_else(|| ServerError::storage_error(anyhow!("No chunks for {}", session_id)))?;

        let size = chunks.values().map(Bytes::len).sum();
        let mut buffer = BytesMut::with_capacity(size);

        for chunk_number in 1..=total_chunks {
            let chunk = chunks.get(&chunk_number).ok_or_else(|| {
                ServerError::storage_error(anyhow!("Missing chunk {}", chunk_number))
            })?;
            buffer.extend_from_slice(chunk);
        }

        Ok(buffer.freeze())
    }

    async fn release(&self, session_id: &str) -> ServerResult<()> {
        self.sessions.remove(session_id);
        Ok(())
    }

    async fn stored_chunks(&self, session_id: &str) -> ServerResult<Vec<u32>> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|chunks| chunks.keys().copied().collect())
            .unwrap_or_default())
    }
}

/// Keeps chunks as files in a local directory.
///
/// Each session gets its own subdirectory with one file per chunk. Chunks
/// are written to a temporary file first and renamed into place, so a
/// re-uploaded chunk replaces the old one atomically.
#[derive(Debug)]
pub struct LocalChunkStore {
    root: PathBuf,
}

impl LocalChunkStore {
    pub async fn new(root: PathBuf) -> ServerResult<Self> {
        fs::create_dir_all(&root)
            .await
            .map_err(ServerError::storage_error)?;

        Ok(Self { root })
    }

    fn session_dir(&self, session_id: &str) -> ServerResult<PathBuf> {
        // Session IDs are server-generated, but never trust them as path components.
        let valid = !session_id.is_empty()
            && session_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-');

        if !valid {
            return Err(ServerError::storage_error(anyhow!(
                "Invalid session ID {:?}",
                session_id
            )));
        }

        Ok(self.root.join(session_id))
    }

    fn chunk_path(dir: &Path, chunk_number: u32) -> PathBuf {
        dir.join(format!("{}{}", CHUNK_FILE_PREFIX, chunk_number))
    }
}

#[async_trait]
impl ChunkStore for LocalChunkStore {
    async fn put(&self, session_id: &str, chunk_number: u32, data: Bytes) -> ServerResult<()> {
        let dir = self.session_dir(session_id)?;
        fs::create_dir_all(&dir)
            .await
            .map_err(ServerError::storage_error)?;

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, &data)
            .await
            .map_err(ServerError::storage_error)?;

        if let Err(e) = fs::rename(&temp_path, Self::chunk_path(&dir, chunk_number)).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(ServerError::storage_error(e));
        }

        Ok(())
    }

    async fn assemble(&self, session_id: &str, total_chunks: u32) -> ServerResult<Bytes> {
        let dir = self.session_dir(session_id)?;
        let mut buffer = BytesMut::new();

        for chunk_number in 1..=total_chunks {
            let chunk = fs::read(Self::chunk_path(&dir, chunk_number))
                .await
                .map_err(|e| {
                    ServerError::storage_error(
                        anyhow!(e).context(format!("Failed to read chunk {}", chunk_number)),
                    )
                })?;
            buffer.extend_from_slice(&chunk);
        }

        Ok(buffer.freeze())
    }

    async fn release(&self, session_id: &str) -> ServerResult<()> {
        let dir = self.session_dir(session_id)?;

        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::storage_error(e)),
        }
    }

    async fn stored_chunks(&self, session_id: &str) -> ServerResult<Vec<u32>> {
        let dir = self.session_dir(session_id)?;

        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ServerError::storage_error(e)),
        };

        let mut chunks = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(ServerError::storage_error)?
        {
            let name = entry.file_name();
            if let Some(number) = name
                .to_str()
                .and_then(|name| name.strip_prefix(CHUNK_FILE_PREFIX))
                .and_then(|number| number.parse::<u32>().ok())
            {
                chunks.push(number);
            }
        }

        chunks.sort_unstable();
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise_store(store: &dyn ChunkStore) {
        store.put("s-1", 3, Bytes::from_static(b"CCC")).await.unwrap();
        store.put("s-1", 1, Bytes::from_static(b"AAA")).await.unwrap();
        store.put("s-1", 2, Bytes::from_static(b"xxx")).await.unwrap();
        store.put("s-1", 2, Bytes::from_static(b"BBB")).await.unwrap();
        store.put("s-2", 1, Bytes::from_static(b"other")).await.unwrap();

        assert_eq!(store.stored_chunks("s-1").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(
            store.assemble("s-1", 3).await.unwrap(),
            Bytes::from_static(b"AAABBBCCC")
        );

        store.release("s-1").await.unwrap();
        assert!(store.stored_chunks("s-1").await.unwrap().is_empty());
        assert!(store.assemble("s-1", 3).await.is_err());

        // Releasing twice is harmless, and other sessions are untouched.
        store.release("s-1").await.unwrap();
        assert_eq!(store.stored_chunks("s-2").await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise_store(&MemoryChunkStore::new()).await;
    }

    #[tokio::test]
    async fn test_local_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(dir.path().join("chunks")).await.unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_missing_chunk_fails_assembly() {
        let store = MemoryChunkStore::new();
        store.put("s-1", 1, Bytes::from_static(b"AAA")).await.unwrap();
        store.put("s-1", 3, Bytes::from_static(b"CCC")).await.unwrap();

        assert!(store.assemble("s-1", 3).await.is_err());
    }

    #[tokio::test]
    async fn test_local_store_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalChunkStore::new(dir.path().to_path_buf()).await.unwrap();

        assert!(store
            .put("../escape", 1, Bytes::from_static(b"x"))
            .await
            .is_err());
    }
}
