//! Scene payload validation.
//!
//! The expected output shape is the static [`SceneRecord`] type. Validation
//! walks the raw JSON with explicit per-field checks so every problem is
//! reported at once as a JSON-pointer-style message, then deserialises into
//! the typed record. Classification is deterministic: the same payload always
//! produces the same verdict and error list.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One line of dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dialogue {
    pub character: String,
    pub text: String,
}

/// The structured result expected for every scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SceneRecord {
    pub scene_number: String,
    pub location: String,
    pub time_of_day: String,
    pub characters: Vec<String>,
    pub dialogues: Vec<Dialogue>,
}

const REQUIRED_FIELDS: [&str; 5] = ["sceneNumber", "location", "timeOfDay", "characters", "dialogues"];

/// Outcome of validating one payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub parsed: Option<SceneRecord>,
}

impl ValidationReport {
    fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
            parsed: None,
        }
    }
}

/// Schema check for structured chunk output.
pub trait Validator: Send + Sync {
    fn validate(&self, payload: &Value) -> ValidationReport;
}

/// Validates payloads against [`SceneRecord`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SceneValidator;

impl Validator for SceneValidator {
    fn validate(&self, payload: &Value) -> ValidationReport {
        let Some(obj) = payload.as_object() else {
            return ValidationReport::invalid(vec!["/ must be an object".to_string()]);
        };

        let errors = check_scene_object(obj);
        if !errors.is_empty() {
            return ValidationReport::invalid(errors);
        }

        match serde_json::from_value::<SceneRecord>(payload.clone()) {
            Ok(record) => ValidationReport {
                valid: true,
                errors: Vec::new(),
                parsed: Some(record),
            },
            Err(e) => ValidationReport::invalid(vec![format!("/ {}", e)]),
        }
    }
}

fn check_scene_object(obj: &Map<String, Value>) -> Vec<String> {
    let mut errors = Vec::new();

    for field in REQUIRED_FIELDS {
        if !obj.contains_key(field) {
            errors.push(format!("/{field} is required"));
        }
    }

    for (key, value) in obj {
        match key.as_str() {
            "sceneNumber" | "location" | "timeOfDay" => {
                if !value.is_string() {
                    errors.push(format!("/{key} must be a string"));
                }
            }
            "characters" => match value.as_array() {
                Some(items) => {
                    for (i, item) in items.iter().enumerate() {
                        if !item.is_string() {
                            errors.push(format!("/characters/{i} must be a string"));
                        }
                    }
                }
                None => errors.push("/characters must be an array".to_string()),
            },
            "dialogues" => match value.as_array() {
                Some(items) => {
                    for (i, item) in items.iter().enumerate() {
                        check_dialogue(i, item, &mut errors);
                    }
                }
                None => errors.push("/dialogues must be an array".to_string()),
            },
            other => errors.push(format!("/{other} is not an allowed property")),
        }
    }

    errors
}

fn check_dialogue(i: usize, item: &Value, errors: &mut Vec<String>) {
    let Some(d) = item.as_object() else {
        errors.push(format!("/dialogues/{i} must be an object"));
        return;
    };
    for field in ["character", "text"] {
        match d.get(field) {
            None => errors.push(format!("/dialogues/{i}/{field} is required")),
            Some(v) if !v.is_string() => errors.push(format!("/dialogues/{i}/{field} must be a string")),
            Some(_) => {}
        }
    }
    for key in d.keys() {
        if key != "character" && key != "text" {
            errors.push(format!("/dialogues/{i}/{key} is not an allowed property"));
        }
    }
}
