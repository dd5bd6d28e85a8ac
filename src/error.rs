//! Error types for the edgequake-script2json library.
//!
//! Three distinct error types reflect three distinct failure scopes:
//!
//! * [`Script2JsonError`]: **Fatal**: the job cannot proceed at all (bad
//!   input file, provider not configured, work stream or chunk store
//!   unreachable). Returned as `Err(Script2JsonError)` from the top-level
//!   entry points and surfaced to progress subscribers as stage `error`.
//!
//! * [`AttemptError`]: **Transient**: one extraction or repair call failed
//!   (timeout, transport error, unparsable JSON, schema violation). The
//!   orchestrator counts it against the retry budget and moves on.
//!
//! * [`ChunkError`]: **Terminal, non-fatal**: a single chunk exhausted its
//!   retries and fallbacks. It is recorded in the chunk store and exported
//!   as a failure marker, while every other chunk of the job continues.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-script2json library.
///
/// Chunk-level failures use [`ChunkError`] and are stored alongside the
/// chunk rather than propagated here.
#[derive(Debug, Error)]
pub enum Script2JsonError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The file exists and was read, but is not a PDF.
    #[error("File is not a valid PDF: '{path}'\nFirst bytes: {magic:?}")]
    NotAPdf { path: PathBuf, magic: [u8; 4] },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none was provided.
    #[error("PDF '{path}' is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// A password was provided but it is wrong.
    #[error("Wrong password for PDF '{path}'")]
    WrongPassword { path: PathBuf },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    /// The script contained no text, or no chunk survived splitting.
    #[error("Script is empty: nothing to split into scenes")]
    EmptyScript,

    // ── LLM errors ────────────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Infrastructure errors (job-fatal) ─────────────────────────────────
    /// The work stream (broker) could not be reached or rejected an operation.
    #[error("Work stream '{stream}' unavailable: {detail}")]
    StreamUnavailable { stream: String, detail: String },

    /// The chunk store could not be reached or rejected an operation.
    #[error("Chunk store unavailable: {detail}")]
    StoreUnavailable { detail: String },

    /// The archive store could not persist or return an export.
    #[error("Archive store error for '{key}': {detail}")]
    ArchiveFailed { key: String, detail: String },

    // ── Job errors ────────────────────────────────────────────────────────
    /// No job with this identifier is known to the pipeline.
    #[error("Unknown job '{job_id}'")]
    JobNotFound { job_id: String },

    /// The job was canceled before all chunks reached a terminal state.
    #[error("Job '{job_id}' was canceled")]
    JobCanceled { job_id: String },

    /// The job ended in stage `error`.
    #[error("Job '{job_id}' failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write an output file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Script2JsonError {
    /// True for errors caused by unreachable infrastructure rather than bad
    /// input. These mark a running job `error`.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Script2JsonError::StreamUnavailable { .. }
                | Script2JsonError::StoreUnavailable { .. }
                | Script2JsonError::ArchiveFailed { .. }
        )
    }
}

/// One failed extraction or repair call.
///
/// Every variant except [`AttemptError::Permanent`] consumes one unit of the
/// retry budget and lets the state machine try again.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AttemptError {
    /// The call exceeded its hard timeout.
    #[error("call timed out after {secs}s")]
    Timeout { secs: u64 },

    /// Network / provider error that is worth retrying.
    #[error("LLM call failed: {detail}")]
    Transport { detail: String },

    /// The model answered but the answer is not a JSON object.
    #[error("malformed JSON response: {detail}")]
    Malformed { detail: String, raw: String },

    /// Authentication or request errors that no retry can fix.
    #[error("non-retryable LLM error: {detail}")]
    Permanent { detail: String },

    /// The payload parsed but failed schema validation.
    #[error("validation failed: {}", errors.join("; "))]
    Invalid { errors: Vec<String> },
}

impl AttemptError {
    /// Raw model output carried by the error, if any.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            AttemptError::Malformed { raw, .. } if !raw.is_empty() => Some(raw),
            _ => None,
        }
    }
}

/// A terminal, non-fatal failure for a single chunk.
#[derive(Debug, Clone, PartialEq, Error, serde::Serialize, serde::Deserialize)]
pub enum ChunkError {
    /// Retries and every fallback strategy were exhausted.
    #[error("Chunk {index}: rejected after {attempts} attempts: {last_error}")]
    Rejected {
        index: usize,
        attempts: u32,
        last_error: String,
    },

    /// The job was canceled before the chunk reached an accepted state.
    #[error("Chunk {index}: canceled")]
    Canceled { index: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_unavailable_is_infrastructure() {
        let e = Script2JsonError::StreamUnavailable {
            stream: "stream_pdf_chunks".into(),
            detail: "connection refused".into(),
        };
        assert!(e.is_infrastructure());
        assert!(e.to_string().contains("stream_pdf_chunks"));
    }

    #[test]
    fn empty_script_is_not_infrastructure() {
        assert!(!Script2JsonError::EmptyScript.is_infrastructure());
    }

    #[test]
    fn invalid_attempt_joins_errors() {
        let e = AttemptError::Invalid {
            errors: vec!["/location is required".into(), "/timeOfDay is required".into()],
        };
        let msg = e.to_string();
        assert!(msg.contains("/location is required; /timeOfDay"), "got: {msg}");
    }

    #[test]
    fn malformed_exposes_raw_response() {
        let e = AttemptError::Malformed {
            detail: "expected value".into(),
            raw: "{\"sceneNumber\": ".into(),
        };
        assert_eq!(e.raw_response(), Some("{\"sceneNumber\": "));
        let t = AttemptError::Timeout { secs: 5 };
        assert_eq!(t.raw_response(), None);
        assert!(t.to_string().contains("5s"));
    }

    #[test]
    fn rejected_display() {
        let e = ChunkError::Rejected {
            index: 1,
            attempts: 4,
            last_error: "call timed out after 60s".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("Chunk 1"));
        assert!(msg.contains("4 attempts"));
    }
}
