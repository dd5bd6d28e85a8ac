//! CLI binary for edgequake-script2json.
//!
//! Runs one job through an in-process [`Pipeline`] and renders its progress
//! stream as a terminal bar.

use anyhow::{Context, Result};
use clap::Parser;
use edgequake_script2json::{
    inspect, output_stem, write_outputs, ConversionStats, JobSummary, LlmExtractor, Pipeline, PipelineConfig,
    SceneLine, Script2JsonError, Stage, StrictReextract,
};
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── Progress bar fed by the job's summary stream ─────────────────────────────

struct CliProgress {
    bar: ProgressBar,
    active: bool,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Preparing");
        bar.set_message("Reading script…");
        bar.enable_steady_tick(Duration::from_millis(80));
        Self { bar, active: false }
    }

    fn activate(&mut self, total: usize) {
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} scenes  \
             ⏱ {elapsed_precise}  ETA {eta_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(total as u64);
        self.bar.set_style(style);
        self.bar.set_prefix("Extracting");
        self.bar.reset_eta();
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Starting extraction of {total} scenes…"))
        ));
        self.active = true;
    }

    fn update(&mut self, summary: &JobSummary) {
        if !self.active && summary.total > 0 {
            self.activate(summary.total);
        }
        self.bar.set_position(summary.terminal_chunks() as u64);
        if summary.failed > 0 {
            self.bar.set_message(red(&format!("{} failed", summary.failed)));
        } else if summary.stage == Stage::Analyzing {
            self.bar.set_message("assembling…");
        }
    }

    fn finish(&self, summary: &JobSummary) {
        self.bar.finish_and_clear();
        match summary.stage {
            Stage::Complete if summary.failed == 0 => eprintln!(
                "{} {} scenes extracted  ({} repaired)",
                green("✔"),
                bold(&summary.accepted.to_string()),
                summary.repaired
            ),
            Stage::Complete => eprintln!(
                "{} {}/{} scenes extracted  ({} failed)",
                if summary.accepted == 0 { red("✘") } else { cyan("⚠") },
                bold(&summary.accepted.to_string()),
                summary.total,
                red(&summary.failed.to_string()),
            ),
            _ => eprintln!("{} {}", red("✘"), summary.message),
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Per-scene NDJSON on stdout
  script2json screenplay.pdf

  # Write screenplay.ndjson and screenplay.tar.gz into ./out
  script2json screenplay.pdf -o out

  # More workers, more retries, a stricter second fallback
  script2json --workers 8 --max-retries 3 --strict-fallback heist.pdf -o out

  # Use a specific model
  script2json --model gpt-4.1-mini --provider openai screenplay.pdf

  # Convert from URL
  script2json https://example.com/scripts/alien.pdf -o out

  # Inspect PDF metadata (no API key needed)
  script2json --inspect-only screenplay.pdf

  # JSON report (stats + final summary) instead of NDJSON
  script2json --json screenplay.pdf > report.json

OUTPUT:
  One JSON object per scene, in script order:
    {"index":0,"id":"S1","title":"INT. KITCHEN - NIGHT","status":"validated",
     "attempts":1,"repaired":false,"parsed":{...},"error":null}
  Scenes that could not be extracted keep their slot with status "failed"
  and the last error, so downstream tools never see silent gaps.

EXIT STATUS:
  0  job complete (individual scenes may still have failed)
  1  job failed or was interrupted

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          OpenAI API key
  ANTHROPIC_API_KEY       Anthropic API key
  GEMINI_API_KEY          Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER  Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL         Override model ID
  PDFIUM_LIB_PATH         Path to libpdfium (default: system library)
"#;

/// Extract per-scene JSON from screenplay PDFs using LLMs.
#[derive(Parser, Debug)]
#[command(
    name = "script2json",
    version,
    about = "Extract per-scene JSON from screenplay PDFs using LLMs",
    long_about = "Split a screenplay PDF (local file or URL) into scenes and extract each scene \
into validated JSON with an LLM. Every scene is retried, repaired or recorded as failed; \
nothing is silently dropped. Supports OpenAI, Anthropic, Google Gemini, Azure OpenAI, and \
any OpenAI-compatible endpoint (Ollama, vLLM, LiteLLM, etc.).",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Write <stem>.ndjson and <stem>.tar.gz into this directory instead of stdout.
    #[arg(short, long, env = "SCRIPT2JSON_OUTPUT")]
    output: Option<PathBuf>,

    /// LLM model ID (e.g. gpt-4o-mini, gpt-4.1, claude-sonnet-4-20250514).
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(
        long,
        env = "EDGEQUAKE_PROVIDER",
        long_help = "LLM provider. Auto-detected from API key env vars if not set.\n\
          Supported: openai, anthropic, gemini, azure, ollama, or any OpenAI-compatible URL."
    )]
    provider: Option<String>,

    /// Number of concurrent chunk workers.
    #[arg(short, long, env = "SCRIPT2JSON_WORKERS", default_value_t = 4)]
    workers: usize,

    /// Extraction retries per scene before falling back to repair.
    #[arg(long, env = "SCRIPT2JSON_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Base retry backoff in milliseconds (doubles per retry).
    #[arg(long, env = "SCRIPT2JSON_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Add a strict re-extraction fallback after JSON repair.
    #[arg(long, env = "SCRIPT2JSON_STRICT_FALLBACK")]
    strict_fallback: bool,

    /// Approximate token ceiling per chunk; longer scenes are split.
    #[arg(long, env = "SCRIPT2JSON_MAX_CHUNK_TOKENS", default_value_t = 3000)]
    max_chunk_tokens: usize,

    /// PDF user password for encrypted documents.
    #[arg(long, env = "SCRIPT2JSON_PASSWORD")]
    password: Option<String>,

    /// Path to a text file containing a custom extraction system prompt.
    #[arg(long, env = "SCRIPT2JSON_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Max LLM output tokens per call.
    #[arg(long, env = "SCRIPT2JSON_MAX_TOKENS", default_value_t = 2048)]
    max_tokens: usize,

    /// LLM temperature (0.0–2.0).
    #[arg(long, env = "SCRIPT2JSON_TEMPERATURE", default_value_t = 0.2)]
    temperature: f32,

    /// Output a JSON report (stats + final summary) instead of NDJSON.
    #[arg(long, env = "SCRIPT2JSON_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "SCRIPT2JSON_NO_PROGRESS")]
    no_progress: bool,

    /// Print PDF metadata only, no extraction.
    #[arg(long)]
    inspect_only: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "SCRIPT2JSON_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "SCRIPT2JSON_QUIET")]
    quiet: bool,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "SCRIPT2JSON_DOWNLOAD_TIMEOUT", default_value_t = 120)]
    download_timeout: u64,

    /// Per-call LLM timeout in seconds.
    #[arg(long, env = "SCRIPT2JSON_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,
}

#[derive(serde::Serialize)]
struct Report<'a> {
    job_id: &'a str,
    summary: &'a JobSummary,
    stats: &'a ConversionStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    files: Option<[String; 2]>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(io::stderr)
        .init();

    // ── Inspect-only mode ────────────────────────────────────────────────
    if cli.inspect_only {
        let meta = inspect(&cli.input).await.context("Failed to inspect PDF")?;

        if cli.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&meta).context("Failed to serialize metadata")?
            );
        } else {
            println!("File:         {}", cli.input);
            if let Some(ref t) = meta.title {
                println!("Title:        {}", t);
            }
            if let Some(ref a) = meta.author {
                println!("Author:       {}", a);
            }
            println!("Pages:        {}", meta.page_count);
            println!("PDF Version:  {}", meta.pdf_version);
            if let Some(ref p) = meta.producer {
                println!("Producer:     {}", p);
            }
            if let Some(ref c) = meta.creator {
                println!("Creator:      {}", c);
            }
        }
        return Ok(());
    }

    // ── Build pipeline ───────────────────────────────────────────────────
    let config = build_config(&cli).await?;
    let client = Arc::new(LlmExtractor::from_config(&config).context("Failed to set up LLM provider")?);
    let pipeline = Pipeline::in_memory(config, client);
    pipeline.bootstrap().await.context("Failed to create work stream")?;
    let workers = pipeline.spawn_workers(cli.workers);

    // ── Run job ──────────────────────────────────────────────────────────
    let start = Instant::now();
    let mut progress = show_progress.then(CliProgress::new);
    let result = run_job(&pipeline, &cli.input, progress.as_mut()).await;
    workers.shutdown().await;
    let (job_id, summary) = result?;

    let ndjson = pipeline.ndjson(&job_id).await.context("Failed to read NDJSON export")?;
    let scenes = ndjson
        .lines()
        .map(serde_json::from_str::<SceneLine>)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to decode NDJSON export")?;
    let script_chars = pipeline
        .chunks(&job_id)
        .await
        .map(|chunks| chunks.iter().map(|c| c.text.chars().count()).sum())
        .unwrap_or(0);
    let stats = ConversionStats::from_scenes(&scenes, script_chars, start.elapsed().as_millis() as u64);

    // ── Outputs ──────────────────────────────────────────────────────────
    let files = if let Some(ref out_dir) = cli.output {
        let archive = pipeline.download(&job_id).await.context("Failed to read archive export")?;
        let written = write_outputs(&ndjson, &archive, &output_stem(&cli.input), out_dir)
            .await
            .context("Failed to write outputs")?;
        Some(written)
    } else {
        None
    };

    if cli.json {
        let report = Report {
            job_id: &job_id,
            summary: &summary,
            stats: &stats,
            files: files
                .as_ref()
                .map(|f| [f.ndjson.display().to_string(), f.archive.display().to_string()]),
        };
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialise report")?
        );
    } else if files.is_none() {
        let stdout = io::stdout();
        let mut handle = stdout.lock();
        handle
            .write_all(ndjson.as_bytes())
            .context("Failed to write to stdout")?;
    }

    // ── Summary ──────────────────────────────────────────────────────────
    if !cli.quiet && !cli.json {
        eprintln!(
            "{}  {}/{} scenes  {} repaired  {} calls  {}ms",
            if stats.failed == 0 { green("✔") } else { cyan("⚠") },
            stats.validated + stats.repaired,
            stats.total_chunks,
            stats.repaired,
            dim(&stats.total_attempts.to_string()),
            stats.total_duration_ms,
        );
        if let Some(ref f) = files {
            eprintln!("   →  {}", bold(&f.ndjson.display().to_string()));
            eprintln!("   →  {}", bold(&f.archive.display().to_string()));
        }
        if stats.failed > 0 {
            for scene in scenes.iter().filter(|s| s.error.is_some()) {
                eprintln!(
                    "   {} {} {}",
                    red("✘"),
                    scene.id,
                    dim(scene.error.as_deref().unwrap_or_default())
                );
            }
        }
    }

    Ok(())
}

/// Submit the input, follow its progress until terminal, cancel on Ctrl-C.
async fn run_job(
    pipeline: &Pipeline,
    input: &str,
    mut progress: Option<&mut CliProgress>,
) -> Result<(String, JobSummary)> {
    let job_id = match pipeline.submit_pdf(input).await {
        Ok(id) => id,
        Err(e) => {
            if let Some(p) = progress {
                p.bar.finish_and_clear();
            }
            return Err(e).context("Failed to submit script");
        }
    };

    let mut updates = pipeline.subscribe(&job_id)?;
    let mut interrupted = false;
    loop {
        tokio::select! {
            update = updates.next() => {
                let Some(summary) = update else { break };
                if let Some(p) = progress.as_deref_mut() {
                    p.update(&summary);
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                if let Some(p) = progress.as_deref() {
                    p.bar.println(format!("{} interrupted, canceling pending scenes…", cyan("⚠")));
                }
                pipeline.cancel(&job_id).await.context("Failed to cancel job")?;
            }
        }
    }

    let outcome = pipeline.wait(&job_id).await;
    if let Some(p) = progress.as_deref() {
        let last = pipeline.summary(&job_id).context("Job vanished")?;
        p.finish(&last);
    }
    match outcome {
        Ok(summary) => Ok((job_id, summary)),
        Err(Script2JsonError::JobCanceled { .. }) => anyhow::bail!("Job {job_id} canceled"),
        Err(e) => Err(e).context("Extraction failed"),
    }
}

/// Map CLI args to `PipelineConfig`.
async fn build_config(cli: &Cli) -> Result<PipelineConfig> {
    let system_prompt = if let Some(ref path) = cli.system_prompt {
        Some(
            tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read system prompt from {:?}", path))?,
        )
    } else {
        None
    };

    let mut builder = PipelineConfig::builder()
        .workers(cli.workers)
        .max_retries(cli.max_retries)
        .retry_backoff_ms(cli.retry_backoff_ms)
        .max_backoff_ms(cli.retry_backoff_ms.max(8000))
        .api_timeout_secs(cli.api_timeout)
        .max_chunk_tokens(cli.max_chunk_tokens)
        .max_tokens(cli.max_tokens)
        .temperature(cli.temperature)
        .download_timeout_secs(cli.download_timeout);

    if cli.strict_fallback {
        builder = builder.add_fallback(Arc::new(StrictReextract));
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(ref password) = cli.password {
        builder = builder.password(password);
    }
    if let Some(prompt) = system_prompt {
        builder = builder.system_prompt(prompt);
    }

    builder.build().context("Invalid configuration")
}
