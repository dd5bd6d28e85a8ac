//! Retry-fallback orchestrator: drives one chunk to a terminal outcome.
//!
//! ## State machine
//!
//! ```text
//!  Pending ──Started──▶ Attempting(1)
//!  Attempting(n) ──Valid──────────────────────▶ Accepted
//!  Attempting(n) ──ExtractFailed|Invalid──▶ Attempting(n+1)      if n ≤ max_retries
//!                                       └──▶ FallbackPending(0)  otherwise
//!                                       └──▶ Rejected            no fallbacks
//!  FallbackPending(i) ──RepairValid──▶ Accepted (repaired)
//!  FallbackPending(i) ──RepairFailed─▶ FallbackPending(i+1) | Rejected
//!  any non-terminal ──Permanent──▶ Rejected
//!  any non-terminal ──Canceled───▶ Canceled
//! ```
//!
//! The table lives in [`next_state`] as a pure function; [`Orchestrator`]
//! only performs the side effects (calls, sleeps, bookkeeping) that produce
//! the events. A chunk therefore issues at most `max_retries + 1` primary
//! calls plus one call per fallback strategy.
//!
//! Cancellation is observed between calls: an in-flight call is never
//! aborted, but no further call is issued once the token fires.

use crate::config::PipelineConfig;
use crate::error::{AttemptError, ChunkError};
use crate::model::{Chunk, ChunkResult, ChunkStatus};
use crate::pipeline::extract::ExtractionClient;
use crate::pipeline::fallback::{FallbackStrategy, RepairContext};
use crate::pipeline::validate::Validator;
use crate::prompts::{DEFAULT_SYSTEM_PROMPT, DEFAULT_USER_PROMPT, REPAIR_SYSTEM_PROMPT};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-chunk processing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    /// Primary extraction attempt `attempt` (1-based) is next.
    Attempting { attempt: u32 },
    /// Fallback strategy `strategy` (0-based index into the list) is next.
    FallbackPending { strategy: usize },
    Accepted { repaired: bool },
    Rejected,
    Canceled,
}

impl ChunkState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChunkState::Accepted { .. } | ChunkState::Rejected | ChunkState::Canceled
        )
    }
}

/// Events that move a chunk between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    /// Network error, timeout, or unparsable response.
    ExtractFailed,
    Valid,
    Invalid,
    RepairValid,
    RepairFailed,
    /// Error that no retry can fix.
    Permanent,
    Canceled,
}

/// The transition table.
///
/// Terminal states absorb every event. Pairs that cannot occur (e.g. a
/// repair verdict while attempting) leave the state unchanged.
pub fn next_state(state: ChunkState, event: Transition, max_retries: u32, fallbacks: usize) -> ChunkState {
    use ChunkState as S;
    use Transition as T;

    if state.is_terminal() {
        return state;
    }

    match (state, event) {
        (_, T::Canceled) => S::Canceled,
        (_, T::Permanent) => S::Rejected,

        (S::Pending, T::Started) => S::Attempting { attempt: 1 },

        (S::Attempting { .. }, T::Valid) => S::Accepted { repaired: false },
        (S::Attempting { attempt }, T::ExtractFailed | T::Invalid) => {
            if attempt <= max_retries {
                S::Attempting { attempt: attempt + 1 }
            } else if fallbacks > 0 {
                S::FallbackPending { strategy: 0 }
            } else {
                S::Rejected
            }
        }

        (S::FallbackPending { .. }, T::RepairValid) => S::Accepted { repaired: true },
        (S::FallbackPending { strategy }, T::RepairFailed) => {
            if strategy + 1 < fallbacks {
                S::FallbackPending { strategy: strategy + 1 }
            } else {
                S::Rejected
            }
        }

        (other, _) => other,
    }
}

/// Terminal outcome of [`Orchestrator::process`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    Accepted {
        payload: Value,
        repaired: bool,
        attempts: u32,
    },
    Rejected {
        error: ChunkError,
        attempts: u32,
    },
    Canceled {
        attempts: u32,
    },
}

impl ChunkOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            ChunkOutcome::Accepted { attempts, .. }
            | ChunkOutcome::Rejected { attempts, .. }
            | ChunkOutcome::Canceled { attempts } => *attempts,
        }
    }

    pub fn status(&self) -> ChunkStatus {
        match self {
            ChunkOutcome::Accepted { repaired: false, .. } => ChunkStatus::Validated,
            ChunkOutcome::Accepted { repaired: true, .. } => ChunkStatus::Repaired,
            ChunkOutcome::Rejected { .. } => ChunkStatus::Failed,
            ChunkOutcome::Canceled { .. } => ChunkStatus::Canceled,
        }
    }

    /// The record persisted to the chunk store.
    pub fn to_result(&self) -> ChunkResult {
        let (payload, error) = match self {
            ChunkOutcome::Accepted { payload, .. } => (Some(payload.clone()), None),
            ChunkOutcome::Rejected { error, .. } => (None, Some(error.to_string())),
            ChunkOutcome::Canceled { .. } => (None, Some("canceled".to_string())),
        };
        ChunkResult {
            status: self.status(),
            attempts: self.attempts(),
            payload,
            error,
        }
    }
}

/// What one call produced, reduced to the state machine's vocabulary.
enum Verdict {
    Valid(Value),
    Invalid,
    Failed,
    Permanent,
}

/// Everything learned from failed calls; feeds the fallback context.
#[derive(Default)]
struct Memo {
    last_error: String,
    last_payload: Option<Value>,
    last_raw: Option<String>,
}

/// Drives chunks through extraction, validation, retry and fallback repair.
pub struct Orchestrator {
    client: Arc<dyn ExtractionClient>,
    validator: Arc<dyn Validator>,
    fallbacks: Vec<Arc<dyn FallbackStrategy>>,
    max_retries: u32,
    timeout: Duration,
    config: Arc<PipelineConfig>,
    system_prompt: String,
    user_prompt: String,
    repair_system_prompt: String,
}

impl Orchestrator {
    pub fn new(client: Arc<dyn ExtractionClient>, validator: Arc<dyn Validator>, config: Arc<PipelineConfig>) -> Self {
        Self {
            client,
            validator,
            fallbacks: config.fallbacks.clone(),
            max_retries: config.max_retries,
            timeout: config.api_timeout(),
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            user_prompt: config
                .user_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_USER_PROMPT.to_string()),
            repair_system_prompt: config
                .repair_system_prompt
                .clone()
                .unwrap_or_else(|| REPAIR_SYSTEM_PROMPT.to_string()),
            config,
        }
    }

    /// Process one chunk to a terminal outcome.
    ///
    /// Never returns an error: every failure is folded into
    /// [`ChunkOutcome::Rejected`].
    pub async fn process(&self, chunk: &Chunk, cancel: &CancellationToken) -> ChunkOutcome {
        let fallbacks = self.fallbacks.len();
        let mut state = ChunkState::Pending;
        let mut attempts = 0u32;
        let mut memo = Memo::default();
        let mut accepted: Option<Value> = None;

        loop {
            let event = match state {
                ChunkState::Pending => Transition::Started,

                ChunkState::Attempting { attempt } => {
                    if attempt > 1 && !self.pause(attempts, cancel).await {
                        Transition::Canceled
                    } else if cancel.is_cancelled() {
                        Transition::Canceled
                    } else {
                        attempts += 1;
                        debug!(job_id = %chunk.job_id, chunk = chunk.index, attempt, "extracting");
                        let result = self
                            .timed(self.client.extract(&chunk.text, &self.system_prompt, &self.user_prompt))
                            .await;
                        match self.judge(result, &mut memo) {
                            Verdict::Valid(v) => {
                                accepted = Some(v);
                                Transition::Valid
                            }
                            Verdict::Invalid => {
                                warn!(
                                    job_id = %chunk.job_id, chunk = chunk.index, attempt,
                                    "payload rejected: {}", memo.last_error
                                );
                                Transition::Invalid
                            }
                            Verdict::Failed => {
                                warn!(
                                    job_id = %chunk.job_id, chunk = chunk.index, attempt,
                                    "attempt failed: {}", memo.last_error
                                );
                                Transition::ExtractFailed
                            }
                            Verdict::Permanent => Transition::Permanent,
                        }
                    }
                }

                ChunkState::FallbackPending { strategy } => {
                    if cancel.is_cancelled() {
                        Transition::Canceled
                    } else {
                        attempts += 1;
                        let fallback = &self.fallbacks[strategy];
                        info!(
                            job_id = %chunk.job_id, chunk = chunk.index,
                            strategy = fallback.name(), "running fallback"
                        );
                        let ctx = RepairContext {
                            chunk_text: &chunk.text,
                            last_payload: memo.last_payload.as_ref(),
                            last_raw: memo.last_raw.as_deref(),
                            system_prompt: &self.system_prompt,
                            user_prompt: &self.user_prompt,
                            repair_system_prompt: &self.repair_system_prompt,
                        };
                        let result = self.timed(fallback.attempt(self.client.as_ref(), &ctx)).await;
                        match self.judge(result, &mut memo) {
                            Verdict::Valid(v) => {
                                accepted = Some(v);
                                Transition::RepairValid
                            }
                            Verdict::Invalid | Verdict::Failed => {
                                warn!(
                                    job_id = %chunk.job_id, chunk = chunk.index,
                                    strategy = fallback.name(), "fallback failed: {}", memo.last_error
                                );
                                Transition::RepairFailed
                            }
                            Verdict::Permanent => Transition::Permanent,
                        }
                    }
                }

                ChunkState::Accepted { repaired } => {
                    let payload = accepted.take().unwrap_or(Value::Null);
                    return ChunkOutcome::Accepted {
                        payload,
                        repaired,
                        attempts,
                    };
                }

                ChunkState::Rejected => {
                    return ChunkOutcome::Rejected {
                        error: ChunkError::Rejected {
                            index: chunk.index,
                            attempts,
                            last_error: memo.last_error,
                        },
                        attempts,
                    };
                }

                ChunkState::Canceled => return ChunkOutcome::Canceled { attempts },
            };

            state = next_state(state, event, self.max_retries, fallbacks);
        }
    }

    /// Run a call under the hard per-call timeout.
    async fn timed<F>(&self, call: F) -> Result<Value, AttemptError>
    where
        F: Future<Output = Result<Value, AttemptError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(AttemptError::Timeout {
                secs: self.timeout.as_secs(),
            }),
        }
    }

    fn judge(&self, result: Result<Value, AttemptError>, memo: &mut Memo) -> Verdict {
        let err = match result {
            Ok(payload) => {
                let report = self.validator.validate(&payload);
                if report.valid {
                    return Verdict::Valid(payload);
                }
                memo.last_payload = Some(payload);
                memo.last_error = AttemptError::Invalid { errors: report.errors }.to_string();
                return Verdict::Invalid;
            }
            Err(e) => e,
        };

        if let Some(raw) = err.raw_response() {
            memo.last_raw = Some(raw.to_string());
        }
        memo.last_error = err.to_string();

        if matches!(err, AttemptError::Permanent { .. }) {
            Verdict::Permanent
        } else {
            Verdict::Failed
        }
    }

    /// Back off after `failed` attempts. Returns `false` if canceled meanwhile.
    async fn pause(&self, failed: u32, cancel: &CancellationToken) -> bool {
        let delay = self.config.backoff(failed);
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}
