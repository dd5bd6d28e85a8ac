//! Core records shared by every pipeline stage: jobs, chunks, work items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A screenplay processing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub total_chunks: usize,
    pub created_at: DateTime<Utc>,
    /// Set once every chunk is terminal or the job hit a fatal error.
    pub terminal: bool,
    /// Where the script came from (file path, URL, or `"<text>"`).
    pub source: String,
}

impl Job {
    /// Create a job with a fresh `job-<uuid>` identifier.
    pub fn new(total_chunks: usize, source: impl Into<String>) -> Self {
        Self {
            job_id: format!("job-{}", uuid::Uuid::new_v4()),
            total_chunks,
            created_at: Utc::now(),
            terminal: false,
            source: source.into(),
        }
    }
}

/// Processing status of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    /// Accepted on a primary extraction attempt.
    Validated,
    /// Accepted after a fallback strategy fixed the payload.
    Repaired,
    Failed,
    Canceled,
}

impl ChunkStatus {
    /// No further automatic transition happens from a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChunkStatus::Validated | ChunkStatus::Repaired | ChunkStatus::Failed | ChunkStatus::Canceled
        )
    }

    pub fn is_accepted(self) -> bool {
        matches!(self, ChunkStatus::Validated | ChunkStatus::Repaired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::InProgress => "in_progress",
            ChunkStatus::Validated => "validated",
            ChunkStatus::Repaired => "repaired",
            ChunkStatus::Failed => "failed",
            ChunkStatus::Canceled => "canceled",
        }
    }
}

/// One unit of screenplay text (normally one scene).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    pub job_id: String,
    /// 0-based position in the script; stable ordering key.
    pub index: usize,
    /// `S{n}` for heading-split scenes, `C{n}` for size-split fallback chunks.
    pub id: String,
    pub title: String,
    pub text: String,
    pub status: ChunkStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Accepted structured payload; `None` until validated.
    pub payload: Option<Value>,
}

impl Chunk {
    pub fn pending(
        job_id: impl Into<String>,
        index: usize,
        id: impl Into<String>,
        title: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            index,
            id: id.into(),
            title: title.into(),
            text: text.into(),
            status: ChunkStatus::Pending,
            attempts: 0,
            last_error: None,
            payload: None,
        }
    }
}

/// The terminal result written back to the chunk store for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    pub status: ChunkStatus,
    pub attempts: u32,
    pub payload: Option<Value>,
    pub error: Option<String>,
}

/// A stream entry referencing a chunk. Append-only, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub job_id: String,
    pub chunk_index: usize,
}

impl WorkItem {
    pub fn new(job_id: impl Into<String>, chunk_index: usize) -> Self {
        Self {
            job_id: job_id.into(),
            chunk_index,
        }
    }
}
