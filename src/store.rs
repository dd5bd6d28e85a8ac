//! Durable collaborators: the chunk store and the archive store.
//!
//! Both are traits so a deployment can back them with a document database
//! and an object store; the in-memory and filesystem implementations here
//! serve the CLI, embedding, and tests.
//!
//! ## Write discipline
//!
//! [`ChunkStore::write_result`] is an upsert keyed by `(job_id, index)`: a
//! chunk reprocessed after a redelivery overwrites its earlier terminal
//! record instead of adding a second one, so at-least-once delivery still
//! leaves exactly one effective result per chunk.

use crate::error::Script2JsonError;
use crate::model::{Chunk, ChunkResult, ChunkStatus, Job};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Ordered chunk records per job.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Register a job and its chunks (all `pending`).
    async fn create_job(&self, job: &Job, chunks: Vec<Chunk>) -> Result<(), Script2JsonError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, Script2JsonError>;

    /// All chunks of a job in ascending index order.
    async fn get_chunks(&self, job_id: &str) -> Result<Vec<Chunk>, Script2JsonError>;

    async fn get_chunk(&self, job_id: &str, index: usize) -> Result<Option<Chunk>, Script2JsonError>;

    /// Flag a chunk as claimed. Terminal chunks are left untouched.
    async fn mark_in_progress(&self, job_id: &str, index: usize) -> Result<(), Script2JsonError>;

    /// Idempotent upsert of a chunk's terminal result.
    async fn write_result(&self, job_id: &str, index: usize, result: &ChunkResult) -> Result<(), Script2JsonError>;

    /// Mark every still-`pending` chunk `canceled`; returns their indices.
    async fn cancel_pending(&self, job_id: &str) -> Result<Vec<usize>, Script2JsonError>;

    async fn mark_job_terminal(&self, job_id: &str) -> Result<(), Script2JsonError>;

    /// Destroy a job and its chunks. Returns `false` if it did not exist.
    async fn remove_job(&self, job_id: &str) -> Result<bool, Script2JsonError>;
}

struct JobEntry {
    job: Job,
    chunks: Vec<Chunk>,
}

/// [`ChunkStore`] held in process memory.
#[derive(Default)]
pub struct MemoryChunkStore {
    jobs: RwLock<HashMap<String, JobEntry>>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(job_id: &str) -> Script2JsonError {
    Script2JsonError::JobNotFound {
        job_id: job_id.to_string(),
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn create_job(&self, job: &Job, mut chunks: Vec<Chunk>) -> Result<(), Script2JsonError> {
        chunks.sort_by_key(|c| c.index);
        let mut jobs = self.jobs.write().await;
        jobs.insert(
            job.job_id.clone(),
            JobEntry {
                job: job.clone(),
                chunks,
            },
        );
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, Script2JsonError> {
        Ok(self.jobs.read().await.get(job_id).map(|e| e.job.clone()))
    }

    async fn get_chunks(&self, job_id: &str) -> Result<Vec<Chunk>, Script2JsonError> {
        let jobs = self.jobs.read().await;
        let entry = jobs.get(job_id).ok_or_else(|| not_found(job_id))?;
        Ok(entry.chunks.clone())
    }

    async fn get_chunk(&self, job_id: &str, index: usize) -> Result<Option<Chunk>, Script2JsonError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .get(job_id)
            .and_then(|e| e.chunks.iter().find(|c| c.index == index))
            .cloned())
    }

    async fn mark_in_progress(&self, job_id: &str, index: usize) -> Result<(), Script2JsonError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        if let Some(chunk) = entry.chunks.iter_mut().find(|c| c.index == index) {
            if !chunk.status.is_terminal() {
                chunk.status = ChunkStatus::InProgress;
            }
        }
        Ok(())
    }

    async fn write_result(&self, job_id: &str, index: usize, result: &ChunkResult) -> Result<(), Script2JsonError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        let chunk = entry
            .chunks
            .iter_mut()
            .find(|c| c.index == index)
            .ok_or_else(|| Script2JsonError::Internal(format!("job {job_id} has no chunk {index}")))?;
        chunk.status = result.status;
        chunk.attempts = result.attempts;
        chunk.payload = result.payload.clone();
        chunk.last_error = result.error.clone();
        debug!(job_id, chunk = index, status = result.status.as_str(), "chunk result stored");
        Ok(())
    }

    async fn cancel_pending(&self, job_id: &str) -> Result<Vec<usize>, Script2JsonError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        let mut canceled = Vec::new();
        for chunk in entry.chunks.iter_mut().filter(|c| c.status == ChunkStatus::Pending) {
            chunk.status = ChunkStatus::Canceled;
            chunk.last_error = Some("canceled".to_string());
            canceled.push(chunk.index);
        }
        Ok(canceled)
    }

    async fn mark_job_terminal(&self, job_id: &str) -> Result<(), Script2JsonError> {
        let mut jobs = self.jobs.write().await;
        let entry = jobs.get_mut(job_id).ok_or_else(|| not_found(job_id))?;
        entry.job.terminal = true;
        Ok(())
    }

    async fn remove_job(&self, job_id: &str) -> Result<bool, Script2JsonError> {
        Ok(self.jobs.write().await.remove(job_id).is_some())
    }
}

// ── Archive store ────────────────────────────────────────────────────────

/// Destination for exported NDJSON and archives, addressed by key.
///
/// Keys are relative, `/`-separated paths such as `job-…/scenes.ndjson`.
/// Writing an existing key replaces it.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), Script2JsonError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Script2JsonError>;
}

/// [`ArchiveStore`] held in process memory.
#[derive(Default)]
pub struct MemoryArchiveStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), Script2JsonError> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Script2JsonError> {
        Ok(self.objects.read().await.get(key).cloned())
    }
}

/// [`ArchiveStore`] rooted at a directory. Writes are atomic (temp file + rename).
#[derive(Debug, Clone)]
pub struct FsArchiveStore {
    root: PathBuf,
}

impl FsArchiveStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem location of `key`. Rejects absolute keys and `..`.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, Script2JsonError> {
        let rel = Path::new(key);
        let safe = !key.is_empty() && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(Script2JsonError::ArchiveFailed {
                key: key.to_string(),
                detail: "key must be a relative path without '..'".to_string(),
            });
        }
        Ok(self.root.join(rel))
    }
}

fn archive_err(key: &str, e: std::io::Error) -> Script2JsonError {
    Script2JsonError::ArchiveFailed {
        key: key.to_string(),
        detail: e.to_string(),
    }
}

#[async_trait]
impl ArchiveStore for FsArchiveStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), Script2JsonError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| archive_err(key, e))?;
        }

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| archive_err(key, e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| archive_err(key, e))?;

        debug!(key, bytes = bytes.len(), "archive object written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Script2JsonError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(archive_err(key, e)),
        }
    }
}
