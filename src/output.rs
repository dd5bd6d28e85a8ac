//! Result types returned by the eager entry points.

use crate::pipeline::assemble::SceneLine;
use crate::progress::JobSummary;
use serde::{Deserialize, Serialize};

pub use crate::pipeline::text::DocumentMetadata;

/// Everything produced for one finished job.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    pub job_id: String,
    /// One record per chunk in script order, failures included.
    pub scenes: Vec<SceneLine>,
    /// `scenes` as newline-delimited JSON, exactly as exported.
    pub ndjson: String,
    /// `.tar.gz` bundle of `scenes.ndjson` and `summary.json`.
    pub archive: Vec<u8>,
    /// Final progress summary (`complete`).
    pub summary: JobSummary,
    pub stats: ConversionStats,
}

impl ConversionOutput {
    /// Parsed payloads of accepted scenes, in order.
    pub fn accepted(&self) -> impl Iterator<Item = &serde_json::Value> {
        self.scenes.iter().filter_map(|s| s.parsed.as_ref())
    }
}

/// Aggregate statistics for a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionStats {
    pub total_chunks: usize,
    pub validated: usize,
    pub repaired: usize,
    pub failed: usize,
    pub canceled: usize,
    /// Extraction + repair calls across all chunks.
    pub total_attempts: u64,
    /// Characters of script text fed to the splitter.
    pub script_chars: usize,
    pub total_duration_ms: u64,
}

impl ConversionStats {
    pub fn from_scenes(scenes: &[SceneLine], script_chars: usize, total_duration_ms: u64) -> Self {
        use crate::model::ChunkStatus;
        let count = |s: ChunkStatus| scenes.iter().filter(|l| l.status == s).count();
        Self {
            total_chunks: scenes.len(),
            validated: count(ChunkStatus::Validated),
            repaired: count(ChunkStatus::Repaired),
            failed: count(ChunkStatus::Failed),
            canceled: count(ChunkStatus::Canceled),
            total_attempts: scenes.iter().map(|l| l.attempts as u64).sum(),
            script_chars,
            total_duration_ms,
        }
    }
}
