//! Result assembler: NDJSON export plus a `.tar.gz` bundle per job.
//!
//! Output is a pure function of the stored chunk records, so re-running the
//! assembler for the same terminal job overwrites the archive objects with
//! byte-identical content. Every chunk gets a record; failed and canceled
//! chunks carry an error marker instead of a payload.

use crate::error::Script2JsonError;
use crate::model::{Chunk, ChunkStatus};
use crate::store::{ArchiveStore, ChunkStore};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Fixed mtime written into every archive entry (2024-01-01T00:00:00Z).
const ARCHIVE_MTIME: u64 = 1_704_067_200;

/// One line of `scenes.ndjson`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneLine {
    pub index: usize,
    pub id: String,
    pub title: String,
    pub status: ChunkStatus,
    pub attempts: u32,
    pub repaired: bool,
    pub parsed: Option<Value>,
    pub error: Option<String>,
}

impl From<&Chunk> for SceneLine {
    fn from(chunk: &Chunk) -> Self {
        let accepted = chunk.status.is_accepted();
        Self {
            index: chunk.index,
            id: chunk.id.clone(),
            title: chunk.title.clone(),
            status: chunk.status,
            attempts: chunk.attempts,
            repaired: chunk.status == ChunkStatus::Repaired,
            parsed: if accepted { chunk.payload.clone() } else { None },
            error: if accepted {
                None
            } else {
                Some(chunk.last_error.clone().unwrap_or_else(|| chunk.status.as_str().to_string()))
            },
        }
    }
}

/// Per-job counts written to `summary.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub job_id: String,
    pub total: usize,
    pub validated: usize,
    pub repaired: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl ExportSummary {
    pub fn from_chunks(job_id: &str, chunks: &[Chunk]) -> Self {
        let count = |s: ChunkStatus| chunks.iter().filter(|c| c.status == s).count();
        Self {
            job_id: job_id.to_string(),
            total: chunks.len(),
            validated: count(ChunkStatus::Validated),
            repaired: count(ChunkStatus::Repaired),
            failed: count(ChunkStatus::Failed),
            canceled: count(ChunkStatus::Canceled),
        }
    }

    pub fn accepted(&self) -> usize {
        self.validated + self.repaired
    }
}

/// Everything produced for one job.
#[derive(Debug, Clone)]
pub struct Assembled {
    pub ndjson: String,
    pub archive: Vec<u8>,
    pub summary: ExportSummary,
}

pub fn ndjson_key(job_id: &str) -> String {
    format!("{job_id}/scenes.ndjson")
}

pub fn archive_key(job_id: &str) -> String {
    format!("{job_id}/{job_id}.tar.gz")
}

/// Render chunks as NDJSON, one line per chunk in ascending index order.
pub fn render_ndjson(chunks: &[Chunk]) -> Result<String, Script2JsonError> {
    let mut sorted: Vec<&Chunk> = chunks.iter().collect();
    sorted.sort_by_key(|c| c.index);

    let mut out = String::new();
    for chunk in sorted {
        let line = serde_json::to_string(&SceneLine::from(chunk))
            .map_err(|e| Script2JsonError::Internal(format!("ndjson encode: {e}")))?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

/// Bundle the NDJSON and summary into a deterministic `.tar.gz`.
pub fn build_archive(ndjson: &str, summary: &ExportSummary) -> Result<Vec<u8>, Script2JsonError> {
    let summary_json = serde_json::to_vec_pretty(summary)
        .map_err(|e| Script2JsonError::Internal(format!("summary encode: {e}")))?;
    let key = archive_key(&summary.job_id);
    let io_err = |e: std::io::Error| Script2JsonError::ArchiveFailed {
        key: key.clone(),
        detail: e.to_string(),
    };

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    for (name, data) in [("scenes.ndjson", ndjson.as_bytes()), ("summary.json", summary_json.as_slice())] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(ARCHIVE_MTIME);
        header.set_uid(0);
        header.set_gid(0);
        builder.append_data(&mut header, name, data).map_err(io_err)?;
    }

    let encoder = builder.into_inner().map_err(io_err)?;
    encoder.finish().map_err(io_err)
}

/// Assemble a terminal job and write both exports to the archive store.
///
/// Safe to call repeatedly: the objects are overwritten with identical bytes.
pub async fn assemble(
    job_id: &str,
    chunks: &dyn ChunkStore,
    archive: &dyn ArchiveStore,
) -> Result<Assembled, Script2JsonError> {
    let records = chunks.get_chunks(job_id).await?;
    let summary = ExportSummary::from_chunks(job_id, &records);
    let ndjson = render_ndjson(&records)?;
    let bundle = build_archive(&ndjson, &summary)?;

    archive.put(&ndjson_key(job_id), ndjson.clone().into_bytes()).await?;
    archive.put(&archive_key(job_id), bundle.clone()).await?;

    info!(
        job_id,
        accepted = summary.accepted(),
        failed = summary.failed,
        "assembled {} records",
        summary.total
    );

    Ok(Assembled {
        ndjson,
        archive: bundle,
        summary,
    })
}
