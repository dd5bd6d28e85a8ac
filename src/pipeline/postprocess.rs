//! Post-processing: deterministic cleanup of raw model output before JSON parsing.
//!
//! Even with a "JSON only" prompt, models regularly wrap the object in
//! ` ```json ` fences, prefix it with a sentence of commentary, or leak a BOM
//! and zero-width characters. These rules strip that noise without touching
//! the JSON itself, so the validator judges the model's structure rather than
//! its formatting habits.
//!
//! ## Rule Order
//!
//! Invisible characters go first so fence detection sees clean input; fences
//! are stripped before the outermost-object scan so a fenced object with
//! trailing prose still resolves to the object.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Apply all cleanup rules to a raw model response.
///
/// 1. Remove invisible Unicode (BOM, zero-width spaces/joiners)
/// 2. Normalise line endings (CRLF → LF)
/// 3. Strip outer markdown fences (```json … ```)
/// 4. Cut surrounding prose outside the outermost `{ … }`
pub fn clean_json_response(input: &str) -> String {
    let s = remove_invisible_chars(input);
    let s = normalise_line_endings(&s);
    let s = strip_code_fences(&s);
    extract_outer_object(&s)
}

/// Clean and parse a response; only JSON objects are accepted.
pub fn parse_json_object(raw: &str) -> Result<Value, String> {
    let cleaned = clean_json_response(raw);
    if cleaned.is_empty() {
        return Err("empty response".to_string());
    }
    match serde_json::from_str::<Value>(&cleaned) {
        Ok(v @ Value::Object(_)) => Ok(v),
        Ok(other) => Err(format!("expected a JSON object, got {}", json_kind(&other))),
        Err(e) => Err(e.to_string()),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Rule 1: Remove invisible characters ──────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{FEFF}' | '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}'))
        .collect()
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Strip outer code fences ──────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\n(.*?)\n?```").expect("fence regex is valid"));

fn strip_code_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].trim().to_string()
    } else {
        input.trim().to_string()
    }
}

// ── Rule 4: Outermost object ─────────────────────────────────────────────────

fn extract_outer_object(input: &str) -> String {
    match (input.find('{'), input.rfind('}')) {
        (Some(start), Some(end)) if end > start => input[start..=end].to_string(),
        _ => input.to_string(),
    }
}
