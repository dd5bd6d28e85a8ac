//! Input resolution: turn a path or URL into a local PDF that pdfium can open.
//!
//! URLs are streamed into a `TempDir` owned by the returned [`ResolvedInput`];
//! the directory is removed when it is dropped. Both paths require the
//! `%PDF` magic bytes; empty or truncated files are rejected.

use crate::error::Script2JsonError;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Screenplays are small; anything past this is not one.
pub const MAX_DOWNLOAD_BYTES: u64 = 256 * 1024 * 1024;

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// A PDF on local disk, possibly backed by a temp download.
pub enum ResolvedInput {
    Local(PathBuf),
    Downloaded { path: PathBuf, _temp_dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` (path or HTTP(S) URL) to a readable PDF.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, Script2JsonError> {
    if is_url(input) {
        download(input, timeout_secs).await
    } else {
        open_local(PathBuf::from(input)).await
    }
}

/// A head shorter than the magic is a truncated file and fails too; missing
/// bytes show up as zeros in the error.
fn check_magic(path: &Path, head: &[u8]) -> Result<(), Script2JsonError> {
    if head.starts_with(PDF_MAGIC) {
        return Ok(());
    }
    let mut magic = [0u8; 4];
    let n = head.len().min(magic.len());
    magic[..n].copy_from_slice(&head[..n]);
    Err(Script2JsonError::NotAPdf {
        path: path.to_path_buf(),
        magic,
    })
}

async fn open_local(path: PathBuf) -> Result<ResolvedInput, Script2JsonError> {
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(Script2JsonError::PermissionDenied { path });
        }
        Err(_) => return Err(Script2JsonError::FileNotFound { path }),
    };

    let mut head = Vec::with_capacity(PDF_MAGIC.len());
    (&mut file)
        .take(PDF_MAGIC.len() as u64)
        .read_to_end(&mut head)
        .await
        .map_err(|e| Script2JsonError::Internal(format!("read {}: {e}", path.display())))?;
    check_magic(&path, &head)?;

    debug!(path = %path.display(), "resolved local PDF");
    Ok(ResolvedInput::Local(path))
}

async fn download(url: &str, timeout_secs: u64) -> Result<ResolvedInput, Script2JsonError> {
    info!(url, "downloading screenplay");
    let fail = |e: reqwest::Error| {
        if e.is_timeout() {
            Script2JsonError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            Script2JsonError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    };
    let refuse = |reason: String| Script2JsonError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(fail)?;
    let response = client.get(url).send().await.map_err(fail)?;

    let status = response.status();
    if !status.is_success() {
        return Err(refuse(format!("HTTP {status}")));
    }
    if let Some(len) = response.content_length().filter(|&n| n > MAX_DOWNLOAD_BYTES) {
        return Err(refuse(format!("{len} bytes exceeds the {MAX_DOWNLOAD_BYTES} byte limit")));
    }

    let temp_dir = TempDir::new().map_err(|e| Script2JsonError::Internal(format!("temp dir: {e}")))?;
    let path = temp_dir.path().join(filename_from_url(url));
    let write_err = |e: std::io::Error| Script2JsonError::Internal(format!("temp file write: {e}"));
    let mut file = tokio::fs::File::create(&path).await.map_err(write_err)?;

    let mut body = response.bytes_stream();
    let mut head = Vec::with_capacity(PDF_MAGIC.len());
    let mut written: u64 = 0;
    while let Some(piece) = body.next().await {
        let piece = piece.map_err(fail)?;
        if head.len() < PDF_MAGIC.len() {
            let take = (PDF_MAGIC.len() - head.len()).min(piece.len());
            head.extend_from_slice(&piece[..take]);
            if head.len() == PDF_MAGIC.len() {
                check_magic(&path, &head)?;
            }
        }
        written += piece.len() as u64;
        if written > MAX_DOWNLOAD_BYTES {
            return Err(refuse(format!("body exceeds the {MAX_DOWNLOAD_BYTES} byte limit")));
        }
        file.write_all(&piece).await.map_err(write_err)?;
    }
    if head.len() < PDF_MAGIC.len() {
        check_magic(&path, &head)?;
    }
    file.flush().await.map_err(write_err)?;

    info!(path = %path.display(), bytes = written, "download complete");
    Ok(ResolvedInput::Downloaded {
        path,
        _temp_dir: temp_dir,
    })
}

/// File name for a downloaded script: the URL's last path segment, forced to
/// end in `.pdf`, or `screenplay.pdf`.
pub fn filename_from_url(url: &str) -> String {
    let last = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.path_segments().and_then(|mut s| s.next_back().map(str::to_string)))
        .unwrap_or_default();

    let clean: String = last
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect();
    let clean = clean.trim_start_matches('.');

    match Path::new(clean).extension() {
        _ if clean.is_empty() => "screenplay.pdf".to_string(),
        Some(ext) if ext.eq_ignore_ascii_case("pdf") => clean.to_string(),
        _ => format!("{clean}.pdf"),
    }
}
