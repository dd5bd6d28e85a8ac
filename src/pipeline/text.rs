//! PDF text extraction via pdfium.
//!
//! `pdfium-render` wraps the pdfium C++ library, which keeps thread-local
//! state and must not be driven from an async worker thread. All calls run
//! inside `tokio::task::spawn_blocking`.

use crate::error::Script2JsonError;
use pdfium_render::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Basic facts about a PDF, available without any LLM call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
    pub creator: Option<String>,
    pub producer: Option<String>,
    pub page_count: usize,
    pub pdf_version: String,
}

/// Extract the full text of a PDF, pages joined in order by newlines.
pub async fn extract_text(pdf_path: &Path, password: Option<&str>) -> Result<String, Script2JsonError> {
    let path = pdf_path.to_path_buf();
    let pwd = password.map(|s| s.to_string());

    tokio::task::spawn_blocking(move || extract_text_blocking(&path, pwd.as_deref()))
        .await
        .map_err(|e| Script2JsonError::Internal(format!("Text extraction task panicked: {}", e)))?
}

/// Read document metadata without extracting text.
pub async fn extract_metadata(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentMetadata, Script2JsonError> {
    let path = pdf_path.to_path_buf();
    let pwd = password.map(|s| s.to_string());

    tokio::task::spawn_blocking(move || extract_metadata_blocking(&path, pwd.as_deref()))
        .await
        .map_err(|e| Script2JsonError::Internal(format!("Metadata task panicked: {}", e)))?
}

/// Bind pdfium from `PDFIUM_LIB_PATH` when set, else from the system library.
fn bind_pdfium() -> Result<Pdfium, Script2JsonError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(&path),
        _ => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| Script2JsonError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

fn load_error(pdf_path: &Path, password: Option<&str>, e: PdfiumError) -> Script2JsonError {
    let err_str = format!("{:?}", e);
    if err_str.contains("Password") || err_str.contains("password") {
        if password.is_some() {
            Script2JsonError::WrongPassword {
                path: pdf_path.to_path_buf(),
            }
        } else {
            Script2JsonError::PasswordRequired {
                path: pdf_path.to_path_buf(),
            }
        }
    } else {
        Script2JsonError::CorruptPdf {
            path: pdf_path.to_path_buf(),
            detail: err_str,
        }
    }
}

fn extract_text_blocking(pdf_path: &Path, password: Option<&str>) -> Result<String, Script2JsonError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| load_error(pdf_path, password, e))?;

    let pages = document.pages();
    info!("PDF loaded: {} pages", pages.len());

    let mut parts = Vec::with_capacity(pages.len() as usize);
    for (idx, page) in pages.iter().enumerate() {
        match page.text() {
            Ok(text) => {
                let content = text.all();
                debug!("Page {}: {} chars", idx + 1, content.len());
                parts.push(content);
            }
            Err(e) => warn!("Page {}: no text layer ({:?})", idx + 1, e),
        }
    }

    Ok(normalise_page_text(&parts))
}

fn extract_metadata_blocking(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentMetadata, Script2JsonError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| load_error(pdf_path, password, e))?;

    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata.get(tag).and_then(|t| {
            let v = t.value().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        })
    };

    Ok(DocumentMetadata {
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
        creator: get_meta(PdfDocumentMetadataTagType::Creator),
        producer: get_meta(PdfDocumentMetadataTagType::Producer),
        page_count: document.pages().len() as usize,
        pdf_version: format!("{:?}", document.version()),
    })
}

/// Join page texts, normalising CRLF and stray form feeds.
fn normalise_page_text(pages: &[String]) -> String {
    pages
        .iter()
        .map(|p| p.replace("\r\n", "\n").replace(['\r', '\u{000C}'], "\n"))
        .collect::<Vec<_>>()
        .join("\n")
}
