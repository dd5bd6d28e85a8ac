//! Fallback strategies tried after primary extraction retries are exhausted.
//!
//! The orchestrator applies the configured list in order until one produces
//! a payload that validates or the list runs out. Each strategy issues exactly
//! one call per invocation.

use crate::error::AttemptError;
use crate::pipeline::extract::ExtractionClient;
use crate::prompts::{repair_user_prompt, STRICT_SCHEMA_SUFFIX};
use async_trait::async_trait;
use serde_json::Value;

/// Everything a strategy may need to know about the failed chunk.
#[derive(Debug, Clone, Copy)]
pub struct RepairContext<'a> {
    pub chunk_text: &'a str,
    /// Last payload that parsed but failed validation.
    pub last_payload: Option<&'a Value>,
    /// Last raw response that did not parse.
    pub last_raw: Option<&'a str>,
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub repair_system_prompt: &'a str,
}

impl RepairContext<'_> {
    /// The best available malformed input: parsed payload, raw text, or the
    /// chunk source when no answer was ever received.
    pub fn malformed_input(&self) -> String {
        if let Some(payload) = self.last_payload {
            return payload.to_string();
        }
        if let Some(raw) = self.last_raw {
            return raw.to_string();
        }
        self.chunk_text.to_string()
    }
}

#[async_trait]
pub trait FallbackStrategy: Send + Sync {
    /// Stable identifier used in logs and config dumps.
    fn name(&self) -> &str;

    async fn attempt(&self, client: &dyn ExtractionClient, ctx: &RepairContext<'_>) -> Result<Value, AttemptError>;
}

/// Ask the model to fix the last malformed payload without changing its values.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRepair;

#[async_trait]
impl FallbackStrategy for JsonRepair {
    fn name(&self) -> &str {
        "json_repair"
    }

    async fn attempt(&self, client: &dyn ExtractionClient, ctx: &RepairContext<'_>) -> Result<Value, AttemptError> {
        let user = repair_user_prompt(&ctx.malformed_input());
        client.extract("", ctx.repair_system_prompt, &user).await
    }
}

/// Re-extract from source with the schema spelled out as a hard requirement.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictReextract;

#[async_trait]
impl FallbackStrategy for StrictReextract {
    fn name(&self) -> &str {
        "strict_reextract"
    }

    async fn attempt(&self, client: &dyn ExtractionClient, ctx: &RepairContext<'_>) -> Result<Value, AttemptError> {
        let system = format!("{}{}", ctx.system_prompt, STRICT_SCHEMA_SUFFIX);
        client.extract(ctx.chunk_text, &system, ctx.user_prompt).await
    }
}
