//! Progress aggregation: per-chunk events in, per-job summaries out.
//!
//! Workers report one [`ProgressEvent`] per terminal chunk transition. The
//! [`ProgressAggregator`] reduces them into a [`JobSummary`] and pushes
//! summaries to subscribers over a broadcast channel.
//!
//! ## Reduction
//!
//! Each job keeps a map from chunk index to the *first* terminal outcome seen
//! for it. Counts and percentage are recomputed from that map on every event,
//! so duplicates (a redelivered chunk reprocessed by a second worker) and
//! out-of-order arrivals cannot double-count, and the percentage never
//! decreases. All mutation happens under one lock, so concurrent publishers
//! observe a single order.
//!
//! ## Publication
//!
//! A summary is pushed when the percentage changes or when
//! `min_interval` has elapsed since the previous push. The final `complete`
//! or `error` summary is pushed exactly once per job, after which
//! subscriptions end.

use crate::model::ChunkStatus;
use chrono::{DateTime, Utc};
use futures::stream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tokio_stream::Stream;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 256;

/// Lifecycle stage of a job as seen by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Uploading,
    Processing,
    Analyzing,
    Complete,
    Error,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Complete | Stage::Error)
    }
}

/// Immutable fact: chunk `chunk_index` of `job_id` reached `outcome`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: String,
    pub chunk_index: usize,
    pub outcome: ChunkStatus,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(job_id: impl Into<String>, chunk_index: usize, outcome: ChunkStatus) -> Self {
        Self {
            job_id: job_id.into(),
            chunk_index,
            outcome,
            timestamp: Utc::now(),
        }
    }
}

/// Derived view of a job's progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub job_id: String,
    /// `floor(100 * terminal / total)`; 100 once complete.
    pub percent: u8,
    pub stage: Stage,
    pub message: String,
    pub total: usize,
    pub accepted: usize,
    pub repaired: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl JobSummary {
    pub fn terminal_chunks(&self) -> usize {
        self.accepted + self.failed + self.canceled
    }
}

/// Push stream of summaries for one job. Ends after `complete` or `error`.
pub type ProgressStream = Pin<Box<dyn Stream<Item = JobSummary> + Send>>;

/// What an event did to its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventEffect {
    /// Unknown job, duplicate chunk, finished job, or non-terminal outcome.
    Ignored,
    Counted,
    /// This event made every chunk terminal. Returned once per job.
    JobTerminal,
}

struct JobProgress {
    total: usize,
    outcomes: BTreeMap<usize, ChunkStatus>,
    stage: Stage,
    message: String,
    published_percent: u8,
    last_published: Option<Instant>,
    tx: broadcast::Sender<JobSummary>,
}

impl JobProgress {
    fn count(&self, f: impl Fn(ChunkStatus) -> bool) -> usize {
        self.outcomes.values().filter(|s| f(**s)).count()
    }

    fn percent(&self) -> u8 {
        if self.stage == Stage::Complete {
            return 100;
        }
        if self.total == 0 {
            return 0;
        }
        ((100 * self.outcomes.len()) / self.total).min(100) as u8
    }

    fn summary(&self, job_id: &str) -> JobSummary {
        JobSummary {
            job_id: job_id.to_string(),
            percent: self.percent(),
            stage: self.stage,
            message: self.message.clone(),
            total: self.total,
            accepted: self.count(ChunkStatus::is_accepted),
            repaired: self.count(|s| s == ChunkStatus::Repaired),
            failed: self.count(|s| s == ChunkStatus::Failed),
            canceled: self.count(|s| s == ChunkStatus::Canceled),
        }
    }

    fn publish(&mut self, job_id: &str) -> JobSummary {
        let summary = self.summary(job_id);
        self.published_percent = summary.percent;
        self.last_published = Some(Instant::now());
        // No receivers is fine: progress is also readable by polling.
        let _ = self.tx.send(summary.clone());
        summary
    }
}

/// Reduces [`ProgressEvent`]s into [`JobSummary`]s and publishes them.
pub struct ProgressAggregator {
    jobs: Mutex<HashMap<String, JobProgress>>,
    min_interval: Duration,
}

impl ProgressAggregator {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            min_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, JobProgress>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track a new job in stage `uploading`. Re-registering is a no-op.
    pub fn register(&self, job_id: &str, total: usize) {
        let mut jobs = self.lock();
        if jobs.contains_key(job_id) {
            return;
        }
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let mut job = JobProgress {
            total,
            outcomes: BTreeMap::new(),
            stage: Stage::Uploading,
            message: format!("Uploading {total} chunks"),
            published_percent: 0,
            last_published: None,
            tx,
        };
        job.publish(job_id);
        jobs.insert(job_id.to_string(), job);
    }

    /// Move a registered job from `uploading` to `processing`.
    pub fn begin(&self, job_id: &str) {
        let mut jobs = self.lock();
        if let Some(job) = jobs.get_mut(job_id) {
            if job.stage == Stage::Uploading {
                job.stage = Stage::Processing;
                job.message = format!("Processing {} chunks", job.total);
                job.publish(job_id);
            }
        }
    }

    /// Fold one event into its job.
    pub fn on_event(&self, event: &ProgressEvent) -> EventEffect {
        if !event.outcome.is_terminal() {
            return EventEffect::Ignored;
        }
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(&event.job_id) else {
            warn!(job_id = %event.job_id, chunk = event.chunk_index, "event for unknown job");
            return EventEffect::Ignored;
        };
        if job.stage.is_terminal() || event.chunk_index >= job.total {
            return EventEffect::Ignored;
        }
        if job.outcomes.contains_key(&event.chunk_index) {
            debug!(job_id = %event.job_id, chunk = event.chunk_index, "duplicate event dropped");
            return EventEffect::Ignored;
        }
        job.outcomes.insert(event.chunk_index, event.outcome);

        if job.outcomes.len() == job.total {
            job.stage = Stage::Analyzing;
            job.message = "Assembling results".to_string();
            job.publish(&event.job_id);
            return EventEffect::JobTerminal;
        }

        let done = job.outcomes.len();
        job.message = format!("Processed {done}/{} chunks", job.total);
        let interval_elapsed = job
            .last_published
            .map(|t| t.elapsed() >= self.min_interval)
            .unwrap_or(true);
        if job.percent() != job.published_percent || interval_elapsed {
            job.publish(&event.job_id);
        }
        EventEffect::Counted
    }

    /// Publish the final summary of a fully terminal job.
    ///
    /// Jobs with canceled chunks end in `error`; all others in `complete`.
    /// Returns `None` if the job is unknown or already finished.
    pub fn finish(&self, job_id: &str) -> Option<JobSummary> {
        let mut jobs = self.lock();
        let job = jobs.get_mut(job_id)?;
        if job.stage.is_terminal() {
            return None;
        }
        let current = job.summary(job_id);
        if current.canceled > 0 {
            job.stage = Stage::Error;
            job.message = format!("Job canceled: {} chunks not processed", current.canceled);
        } else {
            job.stage = Stage::Complete;
            job.message = format!(
                "Completed: {} accepted ({} repaired), {} failed",
                current.accepted, current.repaired, current.failed
            );
        }
        let summary = job.publish(job_id);
        info!(job_id, stage = ?summary.stage, percent = summary.percent, "{}", summary.message);
        Some(summary)
    }

    /// Publish a final `error` summary. Returns `None` if already finished.
    pub fn fail(&self, job_id: &str, reason: &str) -> Option<JobSummary> {
        let mut jobs = self.lock();
        let job = jobs.get_mut(job_id)?;
        if job.stage.is_terminal() {
            return None;
        }
        job.stage = Stage::Error;
        job.message = reason.to_string();
        let summary = job.publish(job_id);
        warn!(job_id, "job failed: {reason}");
        Some(summary)
    }

    pub fn summary(&self, job_id: &str) -> Option<JobSummary> {
        self.lock().get(job_id).map(|job| job.summary(job_id))
    }

    /// Snapshot followed by every later publication; ends after the final one.
    pub fn subscribe(&self, job_id: &str) -> Option<ProgressStream> {
        let (snapshot, rx) = {
            let jobs = self.lock();
            let job = jobs.get(job_id)?;
            (job.summary(job_id), job.tx.subscribe())
        };

        let stream = stream::unfold((Some(snapshot), rx, false), |(first, mut rx, done)| async move {
            if done {
                return None;
            }
            if let Some(summary) = first {
                let finished = summary.stage.is_terminal();
                return Some((summary, (None, rx, finished)));
            }
            loop {
                match rx.recv().await {
                    Ok(summary) => {
                        let finished = summary.stage.is_terminal();
                        return Some((summary, (None, rx, finished)));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "progress subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });
        Some(Box::pin(stream))
    }

    /// Drop a job's state; open subscriptions end.
    pub fn forget(&self, job_id: &str) -> bool {
        self.lock().remove(job_id).is_some()
    }
}
