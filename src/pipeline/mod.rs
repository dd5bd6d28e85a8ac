//! Pipeline stages for screenplay-to-JSON extraction.
//!
//! Each submodule implements exactly one step. The ingestion stages run once
//! per job on submission; the chunk stages run inside workers, once per
//! delivery.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ text ──▶ splitter ──▶ [work stream] ──▶ orchestrator ──▶ assemble
//! (URL/path) (pdfium) (scenes)                      │  extract          (NDJSON,
//!                                                   │  postprocess       tar.gz)
//!                                                   │  validate
//!                                                   └─ fallback
//! ```
//!
//! 1. [`input`]    canonicalise the user-supplied path or URL to a local file
//! 2. [`text`]     page text via pdfium; runs in `spawn_blocking`
//! 3. [`splitter`] cut the script at scene headings
//! 4. [`orchestrator`] retry/fallback state machine around
//!    [`extract`], [`postprocess`], [`validate`] and [`fallback`]
//! 5. [`assemble`] ordered NDJSON and the deterministic archive

pub mod assemble;
pub mod extract;
pub mod fallback;
pub mod input;
pub mod orchestrator;
pub mod postprocess;
pub mod splitter;
pub mod text;
pub mod validate;
