//! Configuration types for the screenplay extraction pipeline.
//!
//! All pipeline behaviour is controlled through [`PipelineConfig`], built via
//! its [`PipelineConfigBuilder`]. One struct holds every knob so a config can
//! be shared across worker tasks, logged, and diffed between two runs.

use crate::error::Script2JsonError;
use crate::pipeline::fallback::{FallbackStrategy, JsonRepair};
use edgequake_llm::LLMProvider;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default work stream carrying one entry per chunk.
pub const DEFAULT_STREAM: &str = "stream_pdf_chunks";

/// Default consumer group shared by all chunk workers.
pub const DEFAULT_GROUP: &str = "group_chunk_workers";

/// Configuration for a screenplay extraction pipeline.
///
/// Built via [`PipelineConfig::builder()`] or using
/// [`PipelineConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_script2json::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .workers(8)
///     .max_retries(2)
///     .model("gpt-4o-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Number of concurrent chunk workers in the consumer group. Default: 4.
    ///
    /// Workers are network-bound; raise this until the provider starts
    /// answering with `429`.
    pub workers: usize,

    /// Primary extraction retries per chunk after the first attempt. Default: 2.
    ///
    /// A chunk gets `max_retries + 1` primary attempts, then one attempt per
    /// configured fallback strategy.
    pub max_retries: u32,

    /// Initial delay between attempts in milliseconds. Default: 500.
    ///
    /// Doubles after each failed attempt and is capped by `max_backoff_ms`.
    pub retry_backoff_ms: u64,

    /// Upper bound for a single backoff delay in milliseconds. Default: 8000.
    pub max_backoff_ms: u64,

    /// Hard timeout for each extraction or repair call in seconds. Default: 60.
    ///
    /// Exceeding it counts as one failed attempt.
    pub api_timeout_secs: u64,

    /// Repair strategies tried in order once primary retries are exhausted.
    /// Default: a single [`JsonRepair`].
    pub fallbacks: Vec<Arc<dyn FallbackStrategy>>,

    /// LLM model identifier, e.g. "gpt-4o-mini". If None, uses provider default.
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.2.
    pub temperature: f32,

    /// Maximum tokens the LLM may generate per chunk. Default: 2048.
    pub max_tokens: usize,

    /// Custom extraction system prompt. If None, uses the built-in default.
    pub system_prompt: Option<String>,

    /// Custom extraction user prompt (the chunk text is appended).
    pub user_prompt: Option<String>,

    /// Custom system prompt for the JSON repair fallback.
    pub repair_system_prompt: Option<String>,

    /// Size of fallback chunks (in approximate tokens) when the script has no
    /// scene headings. Default: 3000.
    pub max_chunk_tokens: usize,

    /// Idle time in milliseconds after which an unacknowledged delivery is
    /// considered abandoned and may be reclaimed by another worker. Default: 30000.
    ///
    /// Independent of `api_timeout_secs`: a worker heartbeats its delivery
    /// while the chunk is being processed, so only dead workers go idle.
    pub claim_idle_ms: u64,

    /// Sleep between empty polls of the work stream in milliseconds. Default: 200.
    pub poll_interval_ms: u64,

    /// Minimum interval between two progress publications for the same job
    /// when the percentage has not changed, in milliseconds. Default: 1000.
    pub progress_min_interval_ms: u64,

    /// Work stream name. Default: [`DEFAULT_STREAM`].
    pub stream_name: String,

    /// Consumer group name. Default: [`DEFAULT_GROUP`].
    pub group_name: String,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Download timeout for URL inputs in seconds. Default: 120.
    pub download_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 2,
            retry_backoff_ms: 500,
            max_backoff_ms: 8000,
            api_timeout_secs: 60,
            fallbacks: vec![Arc::new(JsonRepair::default())],
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.2,
            max_tokens: 2048,
            system_prompt: None,
            user_prompt: None,
            repair_system_prompt: None,
            max_chunk_tokens: 3000,
            claim_idle_ms: 30_000,
            poll_interval_ms: 200,
            progress_min_interval_ms: 1000,
            stream_name: DEFAULT_STREAM.to_string(),
            group_name: DEFAULT_GROUP.to_string(),
            password: None,
            download_timeout_secs: 120,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fallbacks: Vec<&str> = self.fallbacks.iter().map(|s| s.name()).collect();
        f.debug_struct("PipelineConfig")
            .field("workers", &self.workers)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("max_backoff_ms", &self.max_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("fallbacks", &fallbacks)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_chunk_tokens", &self.max_chunk_tokens)
            .field("claim_idle_ms", &self.claim_idle_ms)
            .field("stream_name", &self.stream_name)
            .field("group_name", &self.group_name)
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    /// Per-call timeout as a `Duration`.
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn claim_idle(&self) -> Duration {
        Duration::from_millis(self.claim_idle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Delay before attempt `n + 1` after `n` failed attempts (`n ≥ 1`).
    ///
    /// `retry_backoff_ms * 2^(n-1)`, capped at `max_backoff_ms`.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exp = failed_attempts.saturating_sub(1).min(20);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Upper bound on extraction + repair calls for one chunk.
    pub fn max_calls_per_chunk(&self) -> u32 {
        let fallbacks = u32::try_from(self.fallbacks.len()).unwrap_or(u32::MAX);
        self.max_retries.saturating_add(1).saturating_add(fallbacks)
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn workers(mut self, n: usize) -> Self {
        self.config.workers = n.max(1);
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.config.max_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    /// Replace the fallback list. An empty list disables fallback repair.
    pub fn fallbacks(mut self, strategies: Vec<Arc<dyn FallbackStrategy>>) -> Self {
        self.config.fallbacks = strategies;
        self
    }

    /// Append one strategy after the existing ones.
    pub fn add_fallback(mut self, strategy: Arc<dyn FallbackStrategy>) -> Self {
        self.config.fallbacks.push(strategy);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn user_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.user_prompt = Some(prompt.into());
        self
    }

    pub fn repair_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.repair_system_prompt = Some(prompt.into());
        self
    }

    pub fn max_chunk_tokens(mut self, n: usize) -> Self {
        self.config.max_chunk_tokens = n.max(1);
        self
    }

    pub fn claim_idle_ms(mut self, ms: u64) -> Self {
        self.config.claim_idle_ms = ms;
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms.max(1);
        self
    }

    pub fn progress_min_interval_ms(mut self, ms: u64) -> Self {
        self.config.progress_min_interval_ms = ms;
        self
    }

    pub fn stream_name(mut self, name: impl Into<String>) -> Self {
        self.config.stream_name = name.into();
        self
    }

    pub fn group_name(mut self, name: impl Into<String>) -> Self {
        self.config.group_name = name.into();
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, Script2JsonError> {
        let c = &self.config;
        if c.workers == 0 {
            return Err(Script2JsonError::InvalidConfig("Workers must be ≥ 1".into()));
        }
        if c.api_timeout_secs == 0 {
            return Err(Script2JsonError::InvalidConfig(
                "API timeout must be ≥ 1 second".into(),
            ));
        }
        if c.claim_idle_ms == 0 {
            return Err(Script2JsonError::InvalidConfig(
                "claim_idle_ms must be ≥ 1".into(),
            ));
        }
        if c.stream_name.trim().is_empty() || c.group_name.trim().is_empty() {
            return Err(Script2JsonError::InvalidConfig(
                "Stream and group names must not be empty".into(),
            ));
        }
        if c.max_backoff_ms < c.retry_backoff_ms {
            return Err(Script2JsonError::InvalidConfig(format!(
                "max_backoff_ms ({}) must be ≥ retry_backoff_ms ({})",
                c.max_backoff_ms, c.retry_backoff_ms
            )));
        }
        Ok(self.config)
    }
}
