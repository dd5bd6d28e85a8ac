//! End-to-end tests against real screenplay PDFs and a live LLM provider.
//!
//! PDFs live in `./test_cases/`. The tests are gated behind `E2E_ENABLED`
//! so they never run in CI unless explicitly requested.
//!
//! Run with:
//!   E2E_ENABLED=1 PDFIUM_LIB_PATH=/path/to/libpdfium.so cargo test --test e2e -- --nocapture

use edgequake_script2json::{convert, convert_to_file, inspect, ChunkStatus, PipelineConfig};
use std::path::PathBuf;

// ── Test helpers ─────────────────────────────────────────────────────────────

fn test_cases_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("test_cases")
}

/// Skip this test if E2E_ENABLED is not set *or* no PDF file at `path`.
macro_rules! e2e_skip_unless_ready {
    ($path:expr) => {{
        if std::env::var("E2E_ENABLED").is_err() {
            println!("SKIP: set E2E_ENABLED=1 to run e2e tests");
            return;
        }
        let p: PathBuf = $path;
        if !p.exists() {
            println!("SKIP: test file not found: {}", p.display());
            return;
        }
        p
    }};
}

fn e2e_config() -> PipelineConfig {
    let mut builder = PipelineConfig::builder().workers(4).max_retries(2);
    if let Ok(model) = std::env::var("E2E_MODEL") {
        builder = builder.model(model);
    }
    builder.build().expect("valid config")
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_inspect_screenplay() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("short_film.pdf"));
    let meta = inspect(pdf.to_string_lossy()).await.expect("inspect");
    println!("{meta:#?}");
    assert!(meta.page_count > 0);
}

#[tokio::test]
async fn test_short_film_every_scene_has_a_record() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("short_film.pdf"));
    let output = convert(pdf.to_string_lossy(), &e2e_config()).await.expect("convert");

    println!(
        "{} scenes: {} validated, {} repaired, {} failed, {} calls, {}ms",
        output.stats.total_chunks,
        output.stats.validated,
        output.stats.repaired,
        output.stats.failed,
        output.stats.total_attempts,
        output.stats.total_duration_ms
    );

    assert!(output.stats.total_chunks > 0);
    assert_eq!(output.scenes.len(), output.stats.total_chunks);
    assert_eq!(output.ndjson.lines().count(), output.stats.total_chunks);
    for (i, scene) in output.scenes.iter().enumerate() {
        assert_eq!(scene.index, i, "scenes must stay in script order");
        match scene.status {
            ChunkStatus::Validated | ChunkStatus::Repaired => {
                let parsed = scene.parsed.as_ref().expect("accepted scene has a payload");
                assert!(parsed["location"].is_string(), "[{}] location", scene.id);
            }
            ChunkStatus::Failed => assert!(scene.error.is_some(), "[{}] failure without error", scene.id),
            other => panic!("[{}] non-terminal status {other:?}", scene.id),
        }
    }
    // Live models should get most scenes right.
    assert!(output.stats.failed * 2 <= output.stats.total_chunks);
}

#[tokio::test]
async fn test_convert_to_file_writes_both_exports() {
    let pdf = e2e_skip_unless_ready!(test_cases_dir().join("short_film.pdf"));
    let out_dir = tempfile::tempdir().expect("tempdir");

    let (output, files) = convert_to_file(pdf.to_string_lossy(), out_dir.path(), &e2e_config())
        .await
        .expect("convert_to_file");

    assert_eq!(files.ndjson.file_name().and_then(|n| n.to_str()), Some("short_film.ndjson"));
    assert_eq!(files.archive.file_name().and_then(|n| n.to_str()), Some("short_film.tar.gz"));
    assert_eq!(std::fs::read_to_string(&files.ndjson).unwrap(), output.ndjson);
    assert_eq!(std::fs::read(&files.archive).unwrap(), output.archive);
}
