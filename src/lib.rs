//! # edgequake-script2json
//!
//! Turn screenplay PDFs into validated, per-scene JSON using LLMs.
//!
//! ## Why this crate?
//!
//! An LLM asked for JSON returns JSON most of the time. Over a 120-scene
//! feature script "most of the time" means a dozen scenes with missing
//! fields, numbers where strings belong, or a response cut off mid-object.
//! This crate treats every scene as an independent unit of work on a durable
//! queue, validates each answer against a fixed schema, retries with
//! backoff, asks the model to repair what it cannot get right, and records
//! whatever still fails instead of silently dropping it.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input     resolve local file or download from URL
//!  ├─ 2. Text      page text via pdfium (CPU-bound, spawn_blocking)
//!  ├─ 3. Split     one chunk per scene heading (INT. / EXT. …)
//!  ├─ 4. Enqueue   one work item per chunk on the work stream
//!  ├─ 5. Workers   consumer group: extract → validate → retry → repair
//!  ├─ 6. Progress  per-job percent + stage, pushed to subscribers
//!  └─ 7. Assemble  ordered NDJSON + .tar.gz archive
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_script2json::{convert, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / …
//!     let config = PipelineConfig::default();
//!     let output = convert("screenplay.pdf", &config).await?;
//!     print!("{}", output.ndjson);
//!     eprintln!("{} scenes, {} repaired, {} failed",
//!         output.stats.total_chunks, output.stats.repaired, output.stats.failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Running as a service
//!
//! ```rust,no_run
//! use edgequake_script2json::{LlmExtractor, Pipeline, PipelineConfig};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! # async fn run(script: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let config = PipelineConfig::default();
//! let client = Arc::new(LlmExtractor::from_config(&config)?);
//! let pipeline = Pipeline::in_memory(config, client);
//! pipeline.bootstrap().await?;
//! let workers = pipeline.spawn_workers(pipeline.config().workers);
//!
//! let job_id = pipeline.submit_text(script, "upload").await?;
//! let mut progress = pipeline.subscribe(&job_id)?;
//! while let Some(update) = progress.next().await {
//!     println!("{:?} {}% {}", update.stage, update.percent, update.message);
//! }
//! let archive = pipeline.download(&job_id).await?;
//! # let _ = archive;
//! workers.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `script2json` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! edgequake-script2json = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod convert;
pub mod error;
pub mod job;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod store;
pub mod stream;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{PipelineConfig, PipelineConfigBuilder, DEFAULT_GROUP, DEFAULT_STREAM};
pub use convert::{
    convert, convert_from_bytes, convert_text, convert_text_with, convert_to_file, inspect, output_stem, write_outputs,
    WrittenFiles,
};
pub use error::{AttemptError, ChunkError, Script2JsonError};
pub use job::{Pipeline, PipelineBuilder, WorkerPool};
pub use model::{Chunk, ChunkResult, ChunkStatus, Job, WorkItem};
pub use output::{ConversionOutput, ConversionStats, DocumentMetadata};
pub use pipeline::assemble::SceneLine;
pub use pipeline::extract::{ExtractionClient, LlmExtractor};
pub use pipeline::fallback::{FallbackStrategy, JsonRepair, RepairContext, StrictReextract};
pub use pipeline::orchestrator::{ChunkOutcome, Orchestrator};
pub use pipeline::validate::{SceneRecord, SceneValidator, Validator};
pub use progress::{JobSummary, ProgressAggregator, ProgressEvent, ProgressStream, Stage};
pub use store::{ArchiveStore, ChunkStore, FsArchiveStore, MemoryArchiveStore, MemoryChunkStore};
pub use stream::{Delivery, MemoryWorkStream, WorkStream};
