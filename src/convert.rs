//! Eager entry points: submit, wait, return everything.
//!
//! Each call builds a short-lived in-memory [`Pipeline`], runs
//! `config.workers` workers until the job is terminal, then shuts them down.
//! Long-running services should hold one [`Pipeline`] instead and use
//! [`Pipeline::subscribe`] for progress.

use crate::config::PipelineConfig;
use crate::error::Script2JsonError;
use crate::job::Pipeline;
use crate::output::{ConversionOutput, ConversionStats, DocumentMetadata};
use crate::pipeline::assemble::SceneLine;
use crate::pipeline::extract::{ExtractionClient, LlmExtractor};
use crate::pipeline::{input, text};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Convert a screenplay PDF (path or URL) to per-scene JSON.
///
/// # Returns
/// `Ok(ConversionOutput)` once every chunk is terminal, even if some chunks
/// failed (check `output.stats.failed`).
///
/// # Errors
/// Only job-fatal problems: unreadable input, no provider, an empty script,
/// or an unreachable collaborator.
pub async fn convert(input_str: impl AsRef<str>, config: &PipelineConfig) -> Result<ConversionOutput, Script2JsonError> {
    let input_str = input_str.as_ref();
    info!("Starting conversion: {}", input_str);

    let resolved = input::resolve_input(input_str, config.download_timeout_secs).await?;
    let script = text::extract_text(resolved.path(), config.password.as_deref()).await?;
    let client: Arc<dyn ExtractionClient> = Arc::new(LlmExtractor::from_config(config)?);
    convert_text_with(&script, input_str, config, client).await
}

/// Convert already-extracted screenplay text.
pub async fn convert_text(script: &str, config: &PipelineConfig) -> Result<ConversionOutput, Script2JsonError> {
    let client: Arc<dyn ExtractionClient> = Arc::new(LlmExtractor::from_config(config)?);
    convert_text_with(script, "<text>", config, client).await
}

/// Convert screenplay text with a caller-supplied extraction client.
pub async fn convert_text_with(
    script: &str,
    source: &str,
    config: &PipelineConfig,
    client: Arc<dyn ExtractionClient>,
) -> Result<ConversionOutput, Script2JsonError> {
    let start = Instant::now();
    let pipeline = Pipeline::in_memory(config.clone(), client);
    pipeline.bootstrap().await?;
    let workers = pipeline.spawn_workers(config.workers);

    let result = async {
        let job_id = pipeline.submit_text(script, source).await?;
        let summary = pipeline.wait(&job_id).await?;
        let ndjson = pipeline.ndjson(&job_id).await?;
        let archive = pipeline.download(&job_id).await?;
        Ok::<_, Script2JsonError>((job_id, summary, ndjson, archive))
    }
    .await;
    workers.shutdown().await;
    let (job_id, summary, ndjson, archive) = result?;

    let scenes = ndjson
        .lines()
        .map(serde_json::from_str::<SceneLine>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Script2JsonError::Internal(format!("ndjson decode: {e}")))?;
    let stats = ConversionStats::from_scenes(&scenes, script.chars().count(), start.elapsed().as_millis() as u64);

    info!(
        "Conversion complete: {} scenes ({} repaired, {} failed), {} calls, {}ms",
        stats.total_chunks, stats.repaired, stats.failed, stats.total_attempts, stats.total_duration_ms
    );

    Ok(ConversionOutput {
        job_id,
        scenes,
        ndjson,
        archive,
        summary,
        stats,
    })
}

/// Convert PDF bytes held in memory.
///
/// The bytes are written to a managed [`tempfile`] that is removed on return.
pub async fn convert_from_bytes(bytes: &[u8], config: &PipelineConfig) -> Result<ConversionOutput, Script2JsonError> {
    let mut tmp = tempfile::NamedTempFile::new().map_err(|e| Script2JsonError::Internal(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .map_err(|e| Script2JsonError::Internal(format!("tempfile write: {e}")))?;
    let path = tmp.path().to_string_lossy().to_string();
    convert(&path, config).await
}

/// Paths written by [`convert_to_file`].
#[derive(Debug, Clone)]
pub struct WrittenFiles {
    pub ndjson: PathBuf,
    pub archive: PathBuf,
}

/// Convert and write `<stem>.ndjson` and `<stem>.tar.gz` into `out_dir`.
///
/// Each file is written atomically (temp file + rename).
pub async fn convert_to_file(
    input_str: impl AsRef<str>,
    out_dir: impl AsRef<Path>,
    config: &PipelineConfig,
) -> Result<(ConversionOutput, WrittenFiles), Script2JsonError> {
    let input_str = input_str.as_ref();
    let output = convert(input_str, config).await?;
    let files = write_outputs(&output.ndjson, &output.archive, &output_stem(input_str), out_dir.as_ref()).await?;
    Ok((output, files))
}

/// Write NDJSON and archive bytes into `out_dir` as `<stem>.ndjson` / `<stem>.tar.gz`.
pub async fn write_outputs(
    ndjson: &str,
    archive: &[u8],
    stem: &str,
    out_dir: &Path,
) -> Result<WrittenFiles, Script2JsonError> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .map_err(|e| Script2JsonError::OutputWriteFailed {
            path: out_dir.to_path_buf(),
            source: e,
        })?;

    let files = WrittenFiles {
        ndjson: out_dir.join(format!("{stem}.ndjson")),
        archive: out_dir.join(format!("{stem}.tar.gz")),
    };
    write_atomic(&files.ndjson, ndjson.as_bytes()).await?;
    write_atomic(&files.archive, archive).await?;
    Ok(files)
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), Script2JsonError> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| Script2JsonError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Script2JsonError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })
}

/// File stem for outputs: the input's file name without extension.
pub fn output_stem(input_str: &str) -> String {
    let name = if input::is_url(input_str) {
        input::filename_from_url(input_str)
    } else {
        Path::new(input_str)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    };
    let stem = Path::new(&name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    if stem.is_empty() {
        "screenplay".to_string()
    } else {
        stem
    }
}

/// Read PDF metadata without extracting scenes.
///
/// Does not require an LLM provider or API key.
pub async fn inspect(input_str: impl AsRef<str>) -> Result<DocumentMetadata, Script2JsonError> {
    let resolved = input::resolve_input(input_str.as_ref(), 120).await?;
    text::extract_metadata(resolved.path(), None).await
}
