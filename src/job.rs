//! The pipeline service: job submission, worker pool, cancellation, export.
//!
//! A [`Pipeline`] owns every collaborator explicitly: the work stream, the
//! chunk store, the archive store, the orchestrator and the progress
//! aggregator are constructed once and shared by reference with the workers
//! it spawns. Nothing is global.
//!
//! ## Worker loop
//!
//! ```text
//! claim ──▶ load chunk ──▶ terminal already? ──yes──▶ re-emit event ──▶ ack
//!                                │ no
//!                                ▼
//!                    mark in_progress ──▶ orchestrate ──▶ still holder? ──no──▶ drop
//!                                    (heartbeat)                │ yes
//!                                                               ▼
//!                                 ack ◀── publish event ◀── write result
//! ```
//!
//! While a chunk is being orchestrated its worker touches the stream entry
//! every third of `claim_idle_ms`, so only a dead worker's entry goes idle
//! long enough to be reclaimed.
//!
//! The event that makes a job fully terminal is reported to exactly one
//! worker, which assembles the exports and publishes the final summary.
//! Chunk store, work stream and archive store failures are job-fatal: the job
//! is marked `error` and its remaining chunks stop retrying.

use crate::config::PipelineConfig;
use crate::error::Script2JsonError;
use crate::model::{Chunk, Job, WorkItem};
use crate::pipeline::assemble::{self, archive_key, ndjson_key};
use crate::pipeline::extract::ExtractionClient;
use crate::pipeline::orchestrator::Orchestrator;
use crate::pipeline::splitter::split_scenes;
use crate::pipeline::validate::{SceneValidator, Validator};
use crate::pipeline::{input, text};
use crate::progress::{EventEffect, JobSummary, ProgressAggregator, ProgressEvent, ProgressStream, Stage};
use crate::store::{ArchiveStore, ChunkStore, MemoryArchiveStore, MemoryChunkStore};
use crate::stream::{Delivery, MemoryWorkStream, WorkStream};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Builder for [`Pipeline`]. Collaborators not set default to in-memory ones.
pub struct PipelineBuilder {
    config: PipelineConfig,
    client: Arc<dyn ExtractionClient>,
    validator: Arc<dyn Validator>,
    stream: Option<Arc<dyn WorkStream>>,
    store: Option<Arc<dyn ChunkStore>>,
    archive: Option<Arc<dyn ArchiveStore>>,
}

impl PipelineBuilder {
    pub fn stream(mut self, stream: Arc<dyn WorkStream>) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn store(mut self, store: Arc<dyn ChunkStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn archive(mut self, archive: Arc<dyn ArchiveStore>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn build(self) -> Pipeline {
        let config = Arc::new(self.config);
        let orchestrator = Orchestrator::new(self.client, self.validator, Arc::clone(&config));
        let progress = ProgressAggregator::new(Duration::from_millis(config.progress_min_interval_ms));
        Pipeline {
            inner: Arc::new(Inner {
                stream: self.stream.unwrap_or_else(|| Arc::new(MemoryWorkStream::new())),
                store: self.store.unwrap_or_else(|| Arc::new(MemoryChunkStore::new())),
                archive: self.archive.unwrap_or_else(|| Arc::new(MemoryArchiveStore::new())),
                orchestrator,
                progress,
                controls: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                config,
            }),
        }
    }
}

struct Inner {
    config: Arc<PipelineConfig>,
    stream: Arc<dyn WorkStream>,
    store: Arc<dyn ChunkStore>,
    archive: Arc<dyn ArchiveStore>,
    orchestrator: Orchestrator,
    progress: ProgressAggregator,
    /// Per-job cancel signals. Independent of `shutdown`: stopping workers
    /// must not cancel jobs.
    controls: Mutex<HashMap<String, JobControl>>,
    shutdown: CancellationToken,
}

#[derive(Clone, Default)]
struct JobControl {
    token: CancellationToken,
    /// Set by [`Pipeline::cancel`]; a token fired by a fatal error leaves it unset.
    user_canceled: bool,
}

/// Durable chunk-processing pipeline. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig, client: Arc<dyn ExtractionClient>) -> PipelineBuilder {
        PipelineBuilder {
            config,
            client,
            validator: Arc::new(SceneValidator),
            stream: None,
            store: None,
            archive: None,
        }
    }

    /// Pipeline with in-memory stream, chunk store and archive store.
    pub fn in_memory(config: PipelineConfig, client: Arc<dyn ExtractionClient>) -> Self {
        Self::builder(config, client).build()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Create the work stream and consumer group. Idempotent.
    pub async fn bootstrap(&self) -> Result<(), Script2JsonError> {
        let c = &self.inner.config;
        self.inner.stream.ensure_stream(&c.stream_name).await?;
        self.inner.stream.ensure_group(&c.stream_name, &c.group_name).await?;
        info!(stream = %c.stream_name, group = %c.group_name, "work stream ready");
        Ok(())
    }

    /// Start `n` workers in the consumer group.
    pub fn spawn_workers(&self, n: usize) -> WorkerPool {
        let token = self.inner.shutdown.child_token();
        let pool_id = uuid::Uuid::new_v4().simple().to_string();
        let handles = (0..n.max(1))
            .map(|i| {
                let name = format!("worker-{}-{}", &pool_id[..8], i);
                tokio::spawn(run_worker(Arc::clone(&self.inner), name, token.clone()))
            })
            .collect();
        info!(workers = n.max(1), "worker pool started");
        WorkerPool { handles, token }
    }

    /// Signal every worker pool to stop claiming work.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Split a script, persist its chunks and enqueue one work item per chunk.
    ///
    /// Returns the new job id.
    pub async fn submit_text(&self, script: &str, source: &str) -> Result<String, Script2JsonError> {
        let inner = &self.inner;
        let scenes = split_scenes(script, inner.config.max_chunk_tokens);
        if scenes.is_empty() {
            return Err(Script2JsonError::EmptyScript);
        }

        let job = Job::new(scenes.len(), source);
        let job_id = job.job_id.clone();
        let chunks: Vec<Chunk> = scenes
            .into_iter()
            .map(|s| Chunk::pending(&job_id, s.index, s.id, s.title, s.text))
            .collect();
        let total = chunks.len();

        inner.store.create_job(&job, chunks).await?;
        inner.progress.register(&job_id, total);
        inner.lock_controls().insert(job_id.clone(), JobControl::default());

        for index in 0..total {
            let item = WorkItem::new(&job_id, index);
            if let Err(e) = inner.stream.append(&inner.config.stream_name, &item).await {
                inner.fail_job(&job_id, &e).await;
                return Err(e);
            }
        }
        inner.progress.begin(&job_id);

        info!(job_id = %job_id, chunks = total, source, "job submitted");
        Ok(job_id)
    }

    /// Resolve a PDF path or URL, extract its text and submit it.
    pub async fn submit_pdf(&self, input_str: &str) -> Result<String, Script2JsonError> {
        let c = &self.inner.config;
        let resolved = input::resolve_input(input_str, c.download_timeout_secs).await?;
        let script = text::extract_text(resolved.path(), c.password.as_deref()).await?;
        self.submit_text(&script, input_str).await
    }

    /// Live progress for a job; ends after its `complete` or `error` summary.
    pub fn subscribe(&self, job_id: &str) -> Result<ProgressStream, Script2JsonError> {
        self.inner.progress.subscribe(job_id).ok_or_else(|| not_found(job_id))
    }

    pub fn summary(&self, job_id: &str) -> Result<JobSummary, Script2JsonError> {
        self.inner.progress.summary(job_id).ok_or_else(|| not_found(job_id))
    }

    /// Wait for the final summary. A job ending in `error` is returned as `Err`.
    pub async fn wait(&self, job_id: &str) -> Result<JobSummary, Script2JsonError> {
        let mut updates = self.subscribe(job_id)?;
        let mut last = None;
        while let Some(summary) = updates.next().await {
            last = Some(summary);
        }
        let summary = last.ok_or_else(|| not_found(job_id))?;
        match summary.stage {
            Stage::Complete => Ok(summary),
            Stage::Error if self.inner.is_canceled(job_id) => Err(Script2JsonError::JobCanceled {
                job_id: job_id.to_string(),
            }),
            Stage::Error => Err(Script2JsonError::JobFailed {
                job_id: job_id.to_string(),
                reason: summary.message,
            }),
            // Subscription closed early: the job was removed.
            _ => Err(not_found(job_id)),
        }
    }

    /// Cancel a job: in-flight chunks finish their current call and stop,
    /// pending chunks are marked `canceled`. No-op on a finished job.
    pub async fn cancel(&self, job_id: &str) -> Result<(), Script2JsonError> {
        let inner = &self.inner;
        if inner.job_token(job_id).is_none() {
            return Err(not_found(job_id));
        }
        if inner.progress.summary(job_id).map(|s| s.stage.is_terminal()).unwrap_or(true) {
            return Ok(());
        }
        if let Some(control) = inner.lock_controls().get_mut(job_id) {
            control.user_canceled = true;
            control.token.cancel();
        }
        info!(job_id, "job cancel requested");

        let canceled = match inner.store.cancel_pending(job_id).await {
            Ok(c) => c,
            Err(e) => {
                inner.fail_job(job_id, &e).await;
                return Err(e);
            }
        };
        for index in canceled {
            let event = ProgressEvent::new(job_id, index, crate::model::ChunkStatus::Canceled);
            if let Err(e) = inner.record(&event).await {
                inner.fail_job(job_id, &e).await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// The job's `.tar.gz` export.
    pub async fn download(&self, job_id: &str) -> Result<Vec<u8>, Script2JsonError> {
        self.inner.export(job_id, &archive_key(job_id)).await
    }

    /// The job's NDJSON export.
    pub async fn ndjson(&self, job_id: &str) -> Result<String, Script2JsonError> {
        let bytes = self.inner.export(job_id, &ndjson_key(job_id)).await?;
        String::from_utf8(bytes).map_err(|e| Script2JsonError::Internal(format!("ndjson is not UTF-8: {e}")))
    }

    /// Ordered chunk records of a job.
    pub async fn chunks(&self, job_id: &str) -> Result<Vec<Chunk>, Script2JsonError> {
        self.inner.store.get_chunks(job_id).await
    }

    /// Destroy a job's chunks and progress state. Exports stay in the
    /// archive store. Returns `false` if the job was unknown.
    pub async fn remove_job(&self, job_id: &str) -> Result<bool, Script2JsonError> {
        let removed = self.inner.store.remove_job(job_id).await?;
        let forgotten = self.inner.progress.forget(job_id);
        self.inner.lock_controls().remove(job_id);
        if removed {
            info!(job_id, "job removed");
        }
        Ok(removed || forgotten)
    }
}

fn not_found(job_id: &str) -> Script2JsonError {
    Script2JsonError::JobNotFound {
        job_id: job_id.to_string(),
    }
}

impl Inner {
    fn lock_controls(&self) -> std::sync::MutexGuard<'_, HashMap<String, JobControl>> {
        self.controls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn job_token(&self, job_id: &str) -> Option<CancellationToken> {
        self.lock_controls().get(job_id).map(|c| c.token.clone())
    }

    fn is_canceled(&self, job_id: &str) -> bool {
        self.lock_controls().get(job_id).map(|c| c.user_canceled).unwrap_or(false)
    }

    /// Fold an event into progress; the worker that completes the job finalises it.
    async fn record(&self, event: &ProgressEvent) -> Result<(), Script2JsonError> {
        if self.progress.on_event(event) == EventEffect::JobTerminal {
            self.finalize(&event.job_id).await?;
        }
        Ok(())
    }

    async fn finalize(&self, job_id: &str) -> Result<(), Script2JsonError> {
        let assembled = assemble::assemble(job_id, self.store.as_ref(), self.archive.as_ref()).await?;
        self.store.mark_job_terminal(job_id).await?;
        self.progress.finish(job_id);
        debug!(job_id, records = assembled.summary.total, "job finalised");
        Ok(())
    }

    async fn fail_job(&self, job_id: &str, err: &Script2JsonError) {
        error!(job_id, "job-fatal error: {err}");
        if let Some(token) = self.job_token(job_id) {
            token.cancel();
        }
        self.progress.fail(job_id, &err.to_string());
        if let Err(e) = self.store.mark_job_terminal(job_id).await {
            warn!(job_id, "could not mark failed job terminal: {e}");
        }
    }

    async fn export(&self, job_id: &str, key: &str) -> Result<Vec<u8>, Script2JsonError> {
        match self.archive.get(key).await? {
            Some(bytes) => Ok(bytes),
            None if self.progress.summary(job_id).is_none() && self.store.get_job(job_id).await?.is_none() => {
                Err(not_found(job_id))
            }
            None => Err(Script2JsonError::ArchiveFailed {
                key: key.to_string(),
                detail: "export not produced yet".to_string(),
            }),
        }
    }

    /// Refresh this worker's claim; `false` once another consumer has taken it.
    async fn still_holds(&self, worker: &str, delivery: &Delivery) -> Result<bool, Script2JsonError> {
        let c = &self.config;
        let held = self
            .stream
            .touch(&c.stream_name, &c.group_name, &delivery.entry_id, worker)
            .await?;
        if !held {
            warn!(
                worker, job_id = %delivery.item.job_id, chunk = delivery.item.chunk_index,
                entry = %delivery.entry_id, "claim lost; dropping chunk without writing"
            );
        }
        Ok(held)
    }

    /// Process one delivery end to end; acknowledges only after the chunk
    /// is terminal and its event is published.
    async fn handle(&self, worker: &str, delivery: &Delivery) -> Result<(), Script2JsonError> {
        let c = &self.config;
        let job_id = delivery.item.job_id.as_str();
        let index = delivery.item.chunk_index;

        let Some(chunk) = self.store.get_chunk(job_id, index).await? else {
            debug!(worker, job_id, chunk = index, "chunk gone; dropping entry");
            return self.stream.ack(&c.stream_name, &c.group_name, &delivery.entry_id).await;
        };

        if chunk.status.is_terminal() {
            debug!(
                worker, job_id, chunk = index, status = chunk.status.as_str(),
                deliveries = delivery.delivery_count, "chunk already terminal; re-emitting"
            );
            self.record(&ProgressEvent::new(job_id, index, chunk.status)).await?;
            return self.stream.ack(&c.stream_name, &c.group_name, &delivery.entry_id).await;
        }

        self.store.mark_in_progress(job_id, index).await?;
        let cancel = self.job_token(job_id).unwrap_or_default();

        let work = self.orchestrator.process(&chunk, &cancel);
        tokio::pin!(work);
        let period = heartbeat_period(c.claim_idle());
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let outcome = loop {
            tokio::select! {
                outcome = &mut work => break outcome,
                _ = heartbeat.tick() => {
                    if !self.still_holds(worker, delivery).await? {
                        return Ok(());
                    }
                }
            }
        };
        info!(
            worker, job_id, chunk = index, status = outcome.status().as_str(),
            attempts = outcome.attempts(), "chunk finished"
        );

        // Only the current holder may write the record and acknowledge.
        if !self.still_holds(worker, delivery).await? {
            return Ok(());
        }
        self.store.write_result(job_id, index, &outcome.to_result()).await?;
        self.record(&ProgressEvent::new(job_id, index, outcome.status())).await?;
        self.stream.ack(&c.stream_name, &c.group_name, &delivery.entry_id).await
    }
}

/// Heartbeat often enough that a live holder never looks idle for `claim_idle`.
fn heartbeat_period(claim_idle: Duration) -> Duration {
    (claim_idle / 3).max(Duration::from_millis(1))
}

async fn run_worker(inner: Arc<Inner>, name: String, token: CancellationToken) {
    let c = Arc::clone(&inner.config);
    debug!(worker = %name, "worker started");

    while !token.is_cancelled() {
        let claimed = inner
            .stream
            .claim(&c.stream_name, &c.group_name, &name, c.claim_idle())
            .await;

        match claimed {
            Ok(Some(delivery)) => {
                if let Err(e) = inner.handle(&name, &delivery).await {
                    let job_id = delivery.item.job_id.as_str();
                    if matches!(e, Script2JsonError::JobNotFound { .. }) {
                        warn!(worker = %name, job_id, "job removed mid-delivery: {e}");
                    } else {
                        inner.fail_job(job_id, &e).await;
                    }
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = tokio::time::sleep(c.poll_interval()) => {}
                    _ = token.cancelled() => break,
                }
            }
            Err(e) => {
                error!(worker = %name, "claim failed: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(c.poll_interval() * 10) => {}
                    _ = token.cancelled() => break,
                }
            }
        }
    }

    debug!(worker = %name, "worker stopped");
}

/// Handle to a set of running workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    token: CancellationToken,
}

impl WorkerPool {
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop claiming, let in-flight chunks finish, and join every worker.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        for handle in std::mem::take(&mut self.handles) {
            if let Err(e) = handle.await {
                warn!("worker task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
