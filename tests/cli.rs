use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn ingest_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("ingest");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[paths]
registry = "{root}/data/metadata.json"
raw_dir = "{root}/data/raw_pdfs"
parsed_dir = "{root}/data/parsed"

[chunking]
chunk_size = 200
chunk_overlap = 20

[parser]
endpoint = "http://127.0.0.1:9/unreachable"
api_key_env = "REPORT_INGEST_TEST_UNSET_KEY"
max_retries = 0

[vector_store]
backend = "sqlite"
path = "{root}/data/vectors.sqlite"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("ingest.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_ingest(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = ingest_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .env_remove("REPORT_INGEST_TEST_UNSET_KEY")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run ingest binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn raw_dir(config_path: &Path) -> PathBuf {
    config_path.parent().unwrap().parent().unwrap().join("data/raw_pdfs")
}

#[test]
fn test_init_creates_registry() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_ingest(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Created registry"));
    assert!(raw_dir(&config_path).is_dir());

    let registry = raw_dir(&config_path).parent().unwrap().join("metadata.json");
    let json: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(registry).unwrap()).unwrap();
    assert_eq!(json["schema_version"], "1.0.0");
    assert!(json["documents"].as_object().unwrap().is_empty());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_ingest(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (stdout, _, success2) = run_ingest(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
    assert!(stdout.contains("already exists"));
}

#[test]
fn test_status_on_empty_registry() {
    let (_tmp, config_path) = setup_test_env();
    run_ingest(&config_path, &["init"]);

    let (stdout, stderr, success) = run_ingest(&config_path, &["status"]);
    assert!(success, "status failed: {}", stderr);
    assert!(stdout.contains("Documents:   0"));
}

#[test]
fn test_status_unknown_document_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_ingest(&config_path, &["init"]);

    let (_, stderr, success) = run_ingest(&config_path, &["status", "nope"]);
    assert!(!success);
    assert!(stderr.contains("Unknown document: nope"));
}

#[test]
fn test_plan_lists_new_documents() {
    let (_tmp, config_path) = setup_test_env();
    run_ingest(&config_path, &["init"]);

    let raw = raw_dir(&config_path);
    fs::write(raw.join("mirae_samsung_20260210.pdf"), b"%PDF-1.7 one").unwrap();
    fs::write(raw.join("notes.txt"), b"not a candidate").unwrap();

    let (stdout, stderr, success) = run_ingest(&config_path, &["plan"]);
    assert!(success, "plan failed: {}", stderr);
    assert!(stdout.contains("mirae_samsung_20260210"));
    assert!(stdout.contains("new"));
    assert!(!stdout.contains("notes"));
    assert!(stdout.contains("1 document(s) to process."));
}

#[test]
fn test_plan_with_empty_raw_dir() {
    let (_tmp, config_path) = setup_test_env();
    run_ingest(&config_path, &["init"]);

    let (stdout, _, success) = run_ingest(&config_path, &["plan"]);
    assert!(success);
    assert!(stdout.contains("Nothing to do"));
}

#[test]
fn test_run_records_parse_failure() {
    let (_tmp, config_path) = setup_test_env();
    run_ingest(&config_path, &["init"]);

    let raw = raw_dir(&config_path);
    fs::write(raw.join("broken.pdf"), b"this is not a pdf").unwrap();

    let (stdout, stderr, success) = run_ingest(&config_path, &["run", "--json"]);
    assert!(!success, "run should exit non-zero: {}", stderr);
    let result: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(result["total"], 1);
    assert_eq!(result["failed_count"], 1);
    assert_eq!(result["failed_files"][0]["file"], "broken.pdf");

    let (stdout, _, success) = run_ingest(&config_path, &["status", "broken"]);
    assert!(success);
    assert!(stdout.contains("Status:        failed"));
    assert!(stdout.contains("Last error:    [parsing]"));
}

#[test]
fn test_segment_preview() {
    let (tmp, config_path) = setup_test_env();
    let md = tmp.path().join("report.md");
    fs::write(
        &md,
        "# 실적\n\n영업이익이 개선되었다.\n\n# 투자의견\n\n매수 의견을 유지한다.\n\n| 구분 | 2025 |\n|---|---|\n| 매출 | 100 |\n\n# Compliance Notice\n\n본 자료는 투자 참고용입니다.\n",
    )
    .unwrap();

    let (stdout, stderr, success) = run_ingest(&config_path, &["segment", md.to_str().unwrap()]);
    assert!(success, "segment failed: {}", stderr);
    assert!(stdout.contains("[text]"));
    assert!(stdout.contains("[table]"));
    assert!(!stdout.contains("Compliance Notice"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    fs::write(&config_path, "[chunking]\nchunk_size = 10\nchunk_overlap = 10\n").unwrap();

    let (_, stderr, success) = run_ingest(&config_path, &["status"]);
    assert!(!success);
    assert!(stderr.contains("chunk_overlap"));
}
