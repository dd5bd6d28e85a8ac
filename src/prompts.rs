//! Prompts for scene extraction and JSON repair.
//!
//! Every prompt lives here so tests can inspect them without a live model,
//! and so a behaviour change touches exactly one place. Callers override the
//! defaults via [`crate::config::PipelineConfig`].

/// Default system prompt for turning one scene into structured JSON.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a screenplay breakdown assistant. You receive the text of exactly one scene and return a single JSON object describing it.

The object MUST have exactly these fields:

- "sceneNumber": string, the scene number if printed, otherwise the 1-based position you infer
- "location": string, the location from the scene heading, without INT./EXT. and time of day
- "timeOfDay": string, e.g. "DAY", "NIGHT", "CONTINUOUS"; empty string if absent
- "characters": array of strings, every speaking or named character, upper case, no duplicates
- "dialogues": array of objects {"character": string, "text": string} in script order

Rules:
1. Output ONLY the JSON object. No markdown fences, no commentary.
2. Do not invent characters or lines that are not in the text.
3. Keep dialogue text verbatim; drop parentheticals into the text in parentheses."#;

/// Default user prompt; the chunk text is appended after a blank line.
pub const DEFAULT_USER_PROMPT: &str = "Parse the following scene into the JSON object described above:";

/// Default system prompt for the JSON repair fallback.
pub const REPAIR_SYSTEM_PROMPT: &str = r#"You repair malformed JSON describing a screenplay scene.

Return ONLY a corrected JSON object with exactly these fields: "sceneNumber" (string), "location" (string), "timeOfDay" (string), "characters" (array of strings), "dialogues" (array of {"character": string, "text": string}).

Fix structure, types, and missing fields. Do NOT change any existing value's meaning; use an empty string or empty array for fields you cannot recover."#;

/// Schema reminder used by the strict re-extraction fallback.
pub const STRICT_SCHEMA_SUFFIX: &str = r#"

STRICT MODE: the previous answers for this scene were rejected by a schema validator. Every field listed above is required, every value must have the stated JSON type, and no other top-level field is allowed."#;

/// Build the repair user message for a malformed payload.
///
/// The fixed instruction asks for a corrected structure without altering
/// semantic values; the payload follows verbatim.
pub fn repair_user_prompt(bad_json: &str) -> String {
    format!(
        "Below is an INVALID JSON object. Return only the corrected version without changing any values.\n\n{}",
        bad_json
    )
}
