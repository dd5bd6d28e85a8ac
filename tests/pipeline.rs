//! Integration tests for the job pipeline.
//!
//! Every test drives a real [`Pipeline`] (stream, store, orchestrator,
//! progress, assembly) with a scripted [`ExtractionClient`], so no LLM or
//! pdfium is needed.
//!
//! Run with:
//!   cargo test --test pipeline

use async_trait::async_trait;
use edgequake_script2json::{
    AttemptError, Chunk, ChunkResult, ChunkStatus, ChunkStore, Delivery, ExtractionClient, Job, JobSummary,
    MemoryChunkStore, MemoryWorkStream, Pipeline, PipelineConfig, PipelineConfigBuilder, SceneLine,
    Script2JsonError, Stage, WorkItem, WorkStream, DEFAULT_GROUP, DEFAULT_STREAM,
};
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ── Test helpers ─────────────────────────────────────────────────────────────

/// `n` scenes, each headed `INT. ROOM {i} - DAY` (1-based).
fn script(n: usize) -> String {
    (1..=n)
        .map(|i| format!("INT. ROOM {i} - DAY\n\nANNA\nLine {i}.\n\n"))
        .collect()
}

fn valid_scene(room: usize) -> Value {
    json!({
        "sceneNumber": room.to_string(),
        "location": format!("ROOM {room}"),
        "timeOfDay": "DAY",
        "characters": ["ANNA"],
        "dialogues": [{ "character": "ANNA", "text": format!("Line {room}.") }]
    })
}

/// Parses but fails validation; keeps the room marker so repair calls can be routed.
fn invalid_scene(room: usize) -> Value {
    json!({ "location": format!("ROOM {room}"), "sceneNumber": room })
}

/// `RUST_LOG=edgequake_script2json=debug cargo test --test pipeline -- --nocapture`
/// shows the worker logs.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> PipelineConfigBuilder {
    init_tracing();
    PipelineConfig::builder()
        .workers(2)
        .retry_backoff_ms(1)
        .max_backoff_ms(5)
        .poll_interval_ms(5)
        .progress_min_interval_ms(0)
}

/// One call as seen by [`ScriptedClient`].
#[derive(Debug, Clone, Copy)]
struct Call {
    room: usize,
    /// 1-based call number for this room.
    n: u32,
    repair: bool,
}

type Plan = dyn Fn(Call) -> Result<Value, AttemptError> + Send + Sync;
type Delay = dyn Fn(usize) -> Duration + Send + Sync;

/// Answers each call from a plan keyed by the `ROOM n` marker in the prompt.
struct ScriptedClient {
    plan: Box<Plan>,
    delay: Box<Delay>,
    calls: Mutex<HashMap<usize, u32>>,
}

impl ScriptedClient {
    fn new(plan: impl Fn(Call) -> Result<Value, AttemptError> + Send + Sync + 'static) -> Arc<Self> {
        Self::with_delay(plan, |_| Duration::ZERO)
    }

    fn with_delay(
        plan: impl Fn(Call) -> Result<Value, AttemptError> + Send + Sync + 'static,
        delay: impl Fn(usize) -> Duration + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            plan: Box::new(plan),
            delay: Box::new(delay),
            calls: Mutex::new(HashMap::new()),
        })
    }

    /// Always returns a valid record.
    fn always_valid() -> Arc<Self> {
        Self::new(|c| Ok(valid_scene(c.room)))
    }

    fn calls_for(&self, room: usize) -> u32 {
        self.calls.lock().unwrap().get(&room).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }
}

fn room_of(haystack: &str) -> usize {
    haystack
        .split("ROOM ")
        .nth(1)
        .map(|rest| rest.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl ExtractionClient for ScriptedClient {
    async fn extract(&self, text: &str, _system_prompt: &str, user_prompt: &str) -> Result<Value, AttemptError> {
        let room = room_of(&format!("{text}\n{user_prompt}"));
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.entry(room).or_insert(0);
            *n += 1;
            *n
        };
        let delay = (self.delay)(room);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (self.plan)(Call {
            room,
            n,
            repair: text.is_empty(),
        })
    }
}

/// In-memory stream that counts acknowledgements.
#[derive(Default)]
struct CountingStream {
    inner: MemoryWorkStream,
    acks: AtomicUsize,
}

impl CountingStream {
    fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkStream for CountingStream {
    async fn ensure_stream(&self, stream: &str) -> Result<(), Script2JsonError> {
        self.inner.ensure_stream(stream).await
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), Script2JsonError> {
        self.inner.ensure_group(stream, group).await
    }

    async fn append(&self, stream: &str, item: &WorkItem) -> Result<String, Script2JsonError> {
        self.inner.append(stream, item).await
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<Delivery>, Script2JsonError> {
        self.inner.claim(stream, group, consumer, min_idle).await
    }

    async fn touch(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
        consumer: &str,
    ) -> Result<bool, Script2JsonError> {
        self.inner.touch(stream, group, entry_id, consumer).await
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), Script2JsonError> {
        self.acks.fetch_add(1, Ordering::SeqCst);
        self.inner.ack(stream, group, entry_id).await
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, Script2JsonError> {
        self.inner.pending_count(stream, group).await
    }
}

/// In-memory stream whose acknowledgements always fail.
#[derive(Default)]
struct UnackableStream {
    inner: MemoryWorkStream,
}

#[async_trait]
impl WorkStream for UnackableStream {
    async fn ensure_stream(&self, stream: &str) -> Result<(), Script2JsonError> {
        self.inner.ensure_stream(stream).await
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), Script2JsonError> {
        self.inner.ensure_group(stream, group).await
    }

    async fn append(&self, stream: &str, item: &WorkItem) -> Result<String, Script2JsonError> {
        self.inner.append(stream, item).await
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
    ) -> Result<Option<Delivery>, Script2JsonError> {
        self.inner.claim(stream, group, consumer, min_idle).await
    }

    async fn touch(
        &self,
        stream: &str,
        group: &str,
        entry_id: &str,
        consumer: &str,
    ) -> Result<bool, Script2JsonError> {
        self.inner.touch(stream, group, entry_id, consumer).await
    }

    async fn ack(&self, stream: &str, _group: &str, _entry_id: &str) -> Result<(), Script2JsonError> {
        Err(Script2JsonError::StreamUnavailable {
            stream: stream.to_string(),
            detail: "connection refused".into(),
        })
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, Script2JsonError> {
        self.inner.pending_count(stream, group).await
    }
}

/// Chunk store whose result writes always fail.
#[derive(Default)]
struct BrokenStore {
    inner: MemoryChunkStore,
}

#[async_trait]
impl ChunkStore for BrokenStore {
    async fn create_job(&self, job: &Job, chunks: Vec<Chunk>) -> Result<(), Script2JsonError> {
        self.inner.create_job(job, chunks).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, Script2JsonError> {
        self.inner.get_job(job_id).await
    }

    async fn get_chunks(&self, job_id: &str) -> Result<Vec<Chunk>, Script2JsonError> {
        self.inner.get_chunks(job_id).await
    }

    async fn get_chunk(&self, job_id: &str, index: usize) -> Result<Option<Chunk>, Script2JsonError> {
        self.inner.get_chunk(job_id, index).await
    }

    async fn mark_in_progress(&self, job_id: &str, index: usize) -> Result<(), Script2JsonError> {
        self.inner.mark_in_progress(job_id, index).await
    }

    async fn write_result(&self, _job_id: &str, _index: usize, _result: &ChunkResult) -> Result<(), Script2JsonError> {
        Err(Script2JsonError::StoreUnavailable {
            detail: "connection reset".into(),
        })
    }

    async fn cancel_pending(&self, job_id: &str) -> Result<Vec<usize>, Script2JsonError> {
        self.inner.cancel_pending(job_id).await
    }

    async fn mark_job_terminal(&self, job_id: &str) -> Result<(), Script2JsonError> {
        self.inner.mark_job_terminal(job_id).await
    }

    async fn remove_job(&self, job_id: &str) -> Result<bool, Script2JsonError> {
        self.inner.remove_job(job_id).await
    }
}

async fn wait_for(pipeline: &Pipeline, job_id: &str) -> Result<JobSummary, Script2JsonError> {
    tokio::time::timeout(Duration::from_secs(20), pipeline.wait(job_id))
        .await
        .expect("job did not finish in time")
}

fn parse_ndjson(ndjson: &str) -> Vec<SceneLine> {
    ndjson
        .lines()
        .map(|l| serde_json::from_str(l).expect("valid NDJSON line"))
        .collect()
}

fn stage_rank(stage: Stage) -> u8 {
    match stage {
        Stage::Uploading => 0,
        Stage::Processing => 1,
        Stage::Analyzing => 2,
        Stage::Complete | Stage::Error => 3,
    }
}

// ── Happy path and repair ────────────────────────────────────────────────────

#[tokio::test]
async fn invalid_scene_is_repaired_and_job_completes() {
    let client = ScriptedClient::new(|c| match (c.room, c.repair) {
        (2, false) => Ok(invalid_scene(2)),
        (room, _) => Ok(valid_scene(room)),
    });
    let config = fast_config().max_retries(1).build().unwrap();
    let pipeline = Pipeline::in_memory(config, client.clone());
    pipeline.bootstrap().await.unwrap();
    let workers = pipeline.spawn_workers(2);

    let job_id = pipeline.submit_text(&script(3), "three-scenes.pdf").await.unwrap();
    let summary = wait_for(&pipeline, &job_id).await.unwrap();
    workers.shutdown().await;

    assert_eq!(summary.stage, Stage::Complete);
    assert_eq!(summary.percent, 100);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.accepted, 3);
    assert_eq!(summary.repaired, 1);
    assert_eq!(summary.failed, 0);

    // Two primary attempts, then one repair call.
    assert_eq!(client.calls_for(2), 3);
    assert_eq!(client.calls_for(1), 1);

    let lines = parse_ndjson(&pipeline.ndjson(&job_id).await.unwrap());
    assert_eq!(lines.len(), 3);
    assert_eq!(lines.iter().map(|l| l.index).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(lines[0].status, ChunkStatus::Validated);
    assert_eq!(lines[1].status, ChunkStatus::Repaired);
    assert!(lines[1].repaired);
    assert_eq!(lines[1].attempts, 3);
    assert_eq!(lines[1].parsed.as_ref().unwrap()["location"], "ROOM 2");
    assert_eq!(lines[2].status, ChunkStatus::Validated);
}

#[tokio::test]
async fn archive_bundles_ndjson_and_summary() {
    let client = ScriptedClient::always_valid();
    let pipeline = Pipeline::in_memory(fast_config().build().unwrap(), client);
    pipeline.bootstrap().await.unwrap();
    let workers = pipeline.spawn_workers(2);

    let job_id = pipeline.submit_text(&script(2), "two.pdf").await.unwrap();
    wait_for(&pipeline, &job_id).await.unwrap();
    workers.shutdown().await;

    let ndjson = pipeline.ndjson(&job_id).await.unwrap();
    let archive = pipeline.download(&job_id).await.unwrap();

    let mut entries = HashMap::new();
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(archive.as_slice()));
    for entry in tar.entries().unwrap() {
        let mut entry = entry.unwrap();
        let name = entry.path().unwrap().to_string_lossy().to_string();
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        entries.insert(name, body);
    }

    assert_eq!(entries.get("scenes.ndjson"), Some(&ndjson));
    let summary: Value = serde_json::from_str(&entries["summary.json"]).unwrap();
    assert_eq!(summary["jobId"], job_id.as_str());
    assert_eq!(summary["total"], 2);
    assert_eq!(summary["validated"], 2);
}

#[tokio::test]
async fn progress_is_monotonic_and_ends_complete() {
    let client = ScriptedClient::with_delay(|c| Ok(valid_scene(c.room)), |_| Duration::from_millis(5));
    let pipeline = Pipeline::in_memory(fast_config().build().unwrap(), client);
    pipeline.bootstrap().await.unwrap();

    let job_id = pipeline.submit_text(&script(6), "six.pdf").await.unwrap();
    let updates = pipeline.subscribe(&job_id).unwrap();
    let workers = pipeline.spawn_workers(3);

    let seen: Vec<JobSummary> = tokio::time::timeout(Duration::from_secs(20), updates.collect())
        .await
        .expect("progress stream did not end");
    workers.shutdown().await;

    assert!(!seen.is_empty());
    for pair in seen.windows(2) {
        assert!(pair[0].percent <= pair[1].percent, "percent went backwards: {seen:?}");
        assert!(stage_rank(pair[0].stage) <= stage_rank(pair[1].stage), "stage went backwards: {seen:?}");
    }
    let last = seen.last().unwrap();
    assert_eq!(last.stage, Stage::Complete);
    assert_eq!(last.percent, 100);
    assert_eq!(last.accepted, 6);
    assert_eq!(seen.iter().filter(|s| s.stage.is_terminal()).count(), 1);
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn timed_out_scene_is_recorded_as_failed() {
    let client = ScriptedClient::with_delay(
        |c| Ok(valid_scene(c.room)),
        |room| if room == 1 { Duration::from_secs(10) } else { Duration::ZERO },
    );
    let config = fast_config().api_timeout_secs(1).build().unwrap();
    let max_calls = config.max_calls_per_chunk();
    let pipeline = Pipeline::in_memory(config, client.clone());
    pipeline.bootstrap().await.unwrap();
    let workers = pipeline.spawn_workers(2);

    let job_id = pipeline.submit_text(&script(2), "slow.pdf").await.unwrap();
    let summary = wait_for(&pipeline, &job_id).await.unwrap();
    workers.shutdown().await;

    assert_eq!(summary.stage, Stage::Complete);
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(client.calls_for(1), max_calls);

    let lines = parse_ndjson(&pipeline.ndjson(&job_id).await.unwrap());
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0].status, ChunkStatus::Failed);
    assert_eq!(lines[0].attempts, max_calls);
    assert!(lines[0].parsed.is_none());
    assert!(lines[0].error.as_deref().unwrap().contains("timed out"));
    assert_eq!(lines[1].status, ChunkStatus::Validated);
}

#[tokio::test]
async fn permanent_error_fails_scene_without_retrying() {
    let client = ScriptedClient::new(|c| match c.room {
        1 => Err(AttemptError::Permanent {
            detail: "401 invalid api key".into(),
        }),
        room => Ok(valid_scene(room)),
    });
    let pipeline = Pipeline::in_memory(fast_config().build().unwrap(), client.clone());
    pipeline.bootstrap().await.unwrap();
    let workers = pipeline.spawn_workers(2);

    let job_id = pipeline.submit_text(&script(2), "denied.pdf").await.unwrap();
    let summary = wait_for(&pipeline, &job_id).await.unwrap();
    workers.shutdown().await;

    assert_eq!(summary.failed, 1);
    assert_eq!(client.calls_for(1), 1);
    let chunks = pipeline.chunks(&job_id).await.unwrap();
    assert_eq!(chunks[0].status, ChunkStatus::Failed);
    assert!(chunks[0].last_error.as_deref().unwrap().contains("401"));
}

#[tokio::test]
async fn store_failure_fails_the_job() {
    let client = ScriptedClient::always_valid();
    let pipeline = Pipeline::builder(fast_config().build().unwrap(), client)
        .store(Arc::new(BrokenStore::default()))
        .build();
    pipeline.bootstrap().await.unwrap();
    let workers = pipeline.spawn_workers(2);

    let job_id = pipeline.submit_text(&script(2), "doomed.pdf").await.unwrap();
    let err = wait_for(&pipeline, &job_id).await.unwrap_err();
    workers.shutdown().await;

    match err {
        Script2JsonError::JobFailed { job_id: failed, reason } => {
            assert_eq!(failed, job_id);
            assert!(reason.contains("connection reset"), "reason: {reason}");
        }
        other => panic!("expected JobFailed, got {other:?}"),
    }
    assert_eq!(pipeline.summary(&job_id).unwrap().stage, Stage::Error);
}

#[tokio::test]
async fn stream_failure_fails_the_job() {
    let client = ScriptedClient::always_valid();
    let pipeline = Pipeline::builder(fast_config().build().unwrap(), client.clone())
        .stream(Arc::new(UnackableStream::default()))
        .build();
    pipeline.bootstrap().await.unwrap();
    let workers = pipeline.spawn_workers(1);

    let job_id = pipeline.submit_text(&script(2), "unacked.pdf").await.unwrap();
    let err = wait_for(&pipeline, &job_id).await.unwrap_err();
    workers.shutdown().await;

    match err {
        Script2JsonError::JobFailed { job_id: failed, reason } => {
            assert_eq!(failed, job_id);
            assert!(reason.contains("Work stream"), "reason: {reason}");
            assert!(reason.contains("connection refused"), "reason: {reason}");
        }
        other => panic!("expected JobFailed, got {other:?}"),
    }
    let summary = pipeline.summary(&job_id).unwrap();
    assert_eq!(summary.stage, Stage::Error);
    // The failure stops the job before the second scene is extracted.
    assert_eq!(client.calls_for(2), 0);
}

#[tokio::test]
async fn empty_script_is_rejected() {
    let pipeline = Pipeline::in_memory(fast_config().build().unwrap(), ScriptedClient::always_valid());
    tokio_test::assert_ok!(pipeline.bootstrap().await);
    let err = tokio_test::assert_err!(pipeline.submit_text("  \n\n  ", "blank.pdf").await);
    assert!(matches!(err, Script2JsonError::EmptyScript));
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let pipeline = Pipeline::in_memory(fast_config().build().unwrap(), ScriptedClient::always_valid());
    assert!(matches!(pipeline.subscribe("job-missing"), Err(Script2JsonError::JobNotFound { .. })));
    assert!(matches!(
        pipeline.download("job-missing").await,
        Err(Script2JsonError::JobNotFound { .. })
    ));
    assert!(matches!(
        pipeline.cancel("job-missing").await,
        Err(Script2JsonError::JobNotFound { .. })
    ));
}

// ── Delivery guarantees ──────────────────────────────────────────────────────

#[tokio::test]
async fn stale_delivery_is_reclaimed_and_counted_once() {
    let client = ScriptedClient::always_valid();
    let stream = Arc::new(CountingStream::default());
    let config = fast_config().claim_idle_ms(50).build().unwrap();
    let pipeline = Pipeline::builder(config, client.clone()).stream(stream.clone()).build();
    pipeline.bootstrap().await.unwrap();

    let job_id = pipeline.submit_text(&script(2), "crash.pdf").await.unwrap();

    // A consumer takes the first entry and dies without acknowledging it.
    let orphan = stream
        .claim(DEFAULT_STREAM, DEFAULT_GROUP, "dead-consumer", Duration::from_secs(3600))
        .await
        .unwrap()
        .expect("first entry");
    assert_eq!(orphan.item.chunk_index, 0);

    let workers = pipeline.spawn_workers(2);
    let summary = wait_for(&pipeline, &job_id).await.unwrap();
    workers.shutdown().await;

    assert_eq!(summary.total, 2);
    assert_eq!(summary.accepted, 2);
    assert_eq!(client.calls_for(1), 1);
    assert_eq!(client.calls_for(2), 1);
    assert_eq!(stream.acks(), 2);
    assert_eq!(stream.pending_count(DEFAULT_STREAM, DEFAULT_GROUP).await.unwrap(), 0);

    let lines = parse_ndjson(&pipeline.ndjson(&job_id).await.unwrap());
    assert_eq!(lines.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn slow_scene_keeps_its_claim_with_default_timeouts() {
    init_tracing();
    // The first call outlasts the default 30 s idle window but not the 60 s
    // call timeout. Any second call for the scene would fail it.
    let client = ScriptedClient::with_delay(
        |c| match c.n {
            1 => Ok(valid_scene(c.room)),
            _ => Err(AttemptError::Permanent {
                detail: "401 second holder".into(),
            }),
        },
        |_| Duration::from_secs(40),
    );
    let stream = Arc::new(CountingStream::default());
    let config = PipelineConfig::builder().workers(2).poll_interval_ms(5).build().unwrap();
    assert!(config.claim_idle() < Duration::from_secs(40));
    assert!(config.api_timeout() > Duration::from_secs(40));
    let pipeline = Pipeline::builder(config, client.clone()).stream(stream.clone()).build();
    pipeline.bootstrap().await.unwrap();
    let workers = pipeline.spawn_workers(2);

    let job_id = pipeline.submit_text(&script(1), "slow.pdf").await.unwrap();
    let summary = tokio::time::timeout(Duration::from_secs(600), pipeline.wait(&job_id))
        .await
        .expect("job did not finish in time")
        .unwrap();
    workers.shutdown().await;

    assert_eq!(client.calls_for(1), 1);
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(stream.acks(), 1);
    assert_eq!(stream.pending_count(DEFAULT_STREAM, DEFAULT_GROUP).await.unwrap(), 0);

    // Store and export agree on the single result.
    let chunks = pipeline.chunks(&job_id).await.unwrap();
    assert_eq!(chunks[0].status, ChunkStatus::Validated);
    let lines = parse_ndjson(&pipeline.ndjson(&job_id).await.unwrap());
    assert_eq!(lines[0].status, ChunkStatus::Validated);
}

#[tokio::test]
async fn duplicate_delivery_is_acknowledged_without_reprocessing() {
    let client = ScriptedClient::always_valid();
    let stream = Arc::new(CountingStream::default());
    let pipeline = Pipeline::builder(fast_config().build().unwrap(), client.clone())
        .stream(stream.clone())
        .build();
    pipeline.bootstrap().await.unwrap();
    let workers = pipeline.spawn_workers(2);

    let job_id = pipeline.submit_text(&script(2), "dup.pdf").await.unwrap();
    let before = wait_for(&pipeline, &job_id).await.unwrap();
    let ndjson_before = pipeline.ndjson(&job_id).await.unwrap();
    assert_eq!(stream.acks(), 2);

    stream
        .append(DEFAULT_STREAM, &WorkItem::new(&job_id, 0))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), async {
        while stream.acks() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("duplicate entry was never acknowledged");
    workers.shutdown().await;

    assert_eq!(client.total_calls(), 2);
    assert_eq!(pipeline.summary(&job_id).unwrap(), before);
    assert_eq!(pipeline.ndjson(&job_id).await.unwrap(), ndjson_before);
    assert_eq!(stream.pending_count(DEFAULT_STREAM, DEFAULT_GROUP).await.unwrap(), 0);
}

// ── Cancellation and lifecycle ───────────────────────────────────────────────

#[tokio::test]
async fn cancel_stops_pending_scenes() {
    let client = ScriptedClient::with_delay(|c| Ok(valid_scene(c.room)), |_| Duration::from_millis(300));
    let config = fast_config().workers(1).max_retries(0).build().unwrap();
    let pipeline = Pipeline::in_memory(config, client.clone());
    pipeline.bootstrap().await.unwrap();
    let workers = pipeline.spawn_workers(1);

    let job_id = pipeline.submit_text(&script(3), "cancel.pdf").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let chunks = pipeline.chunks(&job_id).await.unwrap();
            if chunks[0].status == ChunkStatus::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("first scene never started");

    pipeline.cancel(&job_id).await.unwrap();
    let err = wait_for(&pipeline, &job_id).await.unwrap_err();
    workers.shutdown().await;

    assert!(matches!(err, Script2JsonError::JobCanceled { .. }), "got {err:?}");
    let summary = pipeline.summary(&job_id).unwrap();
    assert_eq!(summary.stage, Stage::Error);
    assert_eq!(summary.canceled, 2);
    assert!(summary.message.contains("canceled"), "message: {}", summary.message);

    let chunks = pipeline.chunks(&job_id).await.unwrap();
    assert_eq!(chunks[1].status, ChunkStatus::Canceled);
    assert_eq!(chunks[2].status, ChunkStatus::Canceled);
    assert_eq!(client.calls_for(2) + client.calls_for(3), 0);

    // Canceled scenes keep their slot in the export.
    let lines = parse_ndjson(&pipeline.ndjson(&job_id).await.unwrap());
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[2].status, ChunkStatus::Canceled);
}

#[tokio::test]
async fn cancel_after_completion_is_a_no_op() {
    let pipeline = Pipeline::in_memory(fast_config().build().unwrap(), ScriptedClient::always_valid());
    pipeline.bootstrap().await.unwrap();
    let workers = pipeline.spawn_workers(2);

    let job_id = pipeline.submit_text(&script(2), "done.pdf").await.unwrap();
    wait_for(&pipeline, &job_id).await.unwrap();
    pipeline.cancel(&job_id).await.unwrap();
    workers.shutdown().await;

    let summary = wait_for(&pipeline, &job_id).await.unwrap();
    assert_eq!(summary.stage, Stage::Complete);
    assert_eq!(summary.canceled, 0);
}

#[tokio::test]
async fn removed_job_keeps_exports() {
    let pipeline = Pipeline::in_memory(fast_config().build().unwrap(), ScriptedClient::always_valid());
    pipeline.bootstrap().await.unwrap();
    let workers = pipeline.spawn_workers(2);

    let job_id = pipeline.submit_text(&script(1), "one.pdf").await.unwrap();
    wait_for(&pipeline, &job_id).await.unwrap();
    workers.shutdown().await;

    assert!(pipeline.remove_job(&job_id).await.unwrap());
    assert!(!pipeline.remove_job(&job_id).await.unwrap());
    assert!(matches!(pipeline.summary(&job_id), Err(Script2JsonError::JobNotFound { .. })));
    assert!(!pipeline.download(&job_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn eager_conversion_reports_stats() {
    let client = ScriptedClient::new(|c| match (c.room, c.n) {
        (3, 1) => Err(AttemptError::Transport {
            detail: "503 overloaded".into(),
        }),
        (room, _) => Ok(valid_scene(room)),
    });
    let config = fast_config().build().unwrap();
    let output = edgequake_script2json::convert_text_with(&script(3), "eager.pdf", &config, client)
        .await
        .unwrap();

    assert_eq!(output.stats.total_chunks, 3);
    assert_eq!(output.stats.validated, 3);
    assert_eq!(output.stats.total_attempts, 4);
    assert_eq!(output.summary.stage, Stage::Complete);
    assert_eq!(output.accepted().count(), 3);
    assert_eq!(output.ndjson.lines().count(), 3);
    assert!(!output.archive.is_empty());
}
