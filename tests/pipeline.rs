//! End-to-end tests driving the `evi` binary, mirroring real CLI usage.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn evi_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("evi");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let corpus_dir = root.join("corpus");
    fs::create_dir_all(&corpus_dir).unwrap();
    fs::write(
        corpus_dir.join("backup.md"),
        "# Backup Runbook\n\nThe database backup cadence is nightly at two in the morning. \
         Full snapshots replicate to the secondary region within an hour of completion.",
    )
    .unwrap();
    fs::write(
        corpus_dir.join("deploy.md"),
        "# Deploy Notes\n\nDeployments ship every weekday after the integration suite passes. \
         Rollbacks use the previous container image kept in the registry.",
    )
    .unwrap();
    fs::write(
        corpus_dir.join("storage.txt"),
        "Object storage keeps versioned archives. The encryption algorithm is aes256 for all \
         archived snapshots, rotated together with the signing keys.",
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/evi.sqlite"

[ingest]
root = "{root}/corpus"
include_globs = ["**/*.md", "**/*.txt"]

[embedding]
backend = "hash"
model = "hash-embed-v1"
dims = 64
"#,
        root = root.display()
    );

    let config_path = config_dir.join("evi.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_evi(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = evi_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run evi binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_evi(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_evi(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_evi(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_counts_documents() {
    let (_tmp, config_path) = setup_test_env();

    run_evi(&config_path, &["init"]);
    let (stdout, stderr, success) = run_evi(&config_path, &["ingest"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("documents added: 3"));
    assert!(stdout.contains("ok"));
}

#[test]
fn test_reingest_skips_duplicates() {
    let (_tmp, config_path) = setup_test_env();

    run_evi(&config_path, &["init"]);
    run_evi(&config_path, &["ingest"]);
    let (stdout, _, success) = run_evi(&config_path, &["ingest"]);
    assert!(success);
    assert!(stdout.contains("documents added: 0"));
    assert!(stdout.contains("duplicates skipped: 3"));
}

#[test]
fn test_index_build_reports_summary() {
    let (_tmp, config_path) = setup_test_env();

    run_evi(&config_path, &["init"]);
    run_evi(&config_path, &["ingest"]);
    let (stdout, stderr, success) = run_evi(&config_path, &["index"]);
    assert!(success, "index failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("chunks indexed: 3"));
    assert!(stdout.contains("hash-embed-v1"));
}

#[test]
fn test_search_returns_results() {
    let (_tmp, config_path) = setup_test_env();

    run_evi(&config_path, &["init"]);
    run_evi(&config_path, &["ingest"]);
    run_evi(&config_path, &["index"]);

    let (stdout, stderr, success) =
        run_evi(&config_path, &["search", "what is the database backup cadence"]);
    assert!(success, "search failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("backup.md"));
    assert!(stdout.contains("intent: fact"));
}

#[test]
fn test_search_empty_corpus_prints_no_results() {
    let (_tmp, config_path) = setup_test_env();

    run_evi(&config_path, &["init"]);
    // No ingest: corpus tables are empty.
    let (stdout, _, success) = run_evi(&config_path, &["search", "backup cadence"]);
    assert!(success, "empty search must not fail");
    assert!(stdout.contains("No results."));
}

#[test]
fn test_answer_cites_sources() {
    let (_tmp, config_path) = setup_test_env();

    run_evi(&config_path, &["init"]);
    run_evi(&config_path, &["ingest"]);
    run_evi(&config_path, &["index"]);

    let (stdout, stderr, success) = run_evi(
        &config_path,
        &["answer", "what is the database backup cadence", "--json"],
    );
    assert!(success, "answer failed: stdout={}, stderr={}", stdout, stderr);

    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let claims = output.get("claims").and_then(|c| c.as_array()).unwrap();
    assert!(!claims.is_empty());
    for claim in claims {
        let citations = claim.get("citations").and_then(|c| c.as_array()).unwrap();
        assert!(!citations.is_empty(), "claim missing citations: {}", claim);
    }
    assert!(stdout.contains("nightly"));
}

#[test]
fn test_answer_abstains_with_searched_queries() {
    let (_tmp, config_path) = setup_test_env();

    run_evi(&config_path, &["init"]);
    run_evi(&config_path, &["ingest"]);

    let query = "xyzzy plugh qwertzuiop";
    let (stdout, _, success) = run_evi(&config_path, &["answer", query, "--json"]);
    assert!(success, "abstain must be a clean exit");

    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(output.get("abstain").unwrap(), true);
    assert!(output.get("reason").is_some());
    let searched = output
        .get("queries_searched")
        .and_then(|q| q.as_array())
        .unwrap();
    assert!(searched.iter().any(|q| q.as_str() == Some(query)));
}

#[test]
fn test_stale_index_visible_in_stats() {
    let (tmp, config_path) = setup_test_env();

    run_evi(&config_path, &["init"]);
    run_evi(&config_path, &["ingest"]);
    run_evi(&config_path, &["index"]);

    // Mutate the corpus after the build.
    fs::write(
        tmp.path().join("corpus/late.md"),
        "# Late\n\nA document added after the index build completed successfully.",
    )
    .unwrap();
    run_evi(&config_path, &["ingest"]);

    let (stdout, _, success) = run_evi(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("STALE"), "stats should flag staleness:\n{}", stdout);

    // Rebuild clears it.
    run_evi(&config_path, &["index"]);
    let (stdout, _, _) = run_evi(&config_path, &["stats"]);
    assert!(stdout.contains("fresh"));
}

#[test]
fn test_conflicts_are_reported_in_answer() {
    let (tmp, config_path) = setup_test_env();

    fs::write(
        tmp.path().join("corpus/policy_a.md"),
        "# Log Policy (current)\n\nThe retention period is 30 days for exported logs kept \
         in cold storage archives.",
    )
    .unwrap();
    fs::write(
        tmp.path().join("corpus/policy_b.md"),
        "# Log Policy (draft)\n\nThe retention period is 90 days for exported logs kept \
         in cold storage archives.",
    )
    .unwrap();

    run_evi(&config_path, &["init"]);
    run_evi(&config_path, &["ingest"]);
    run_evi(&config_path, &["index"]);

    let (stdout, stderr, success) = run_evi(
        &config_path,
        &[
            "answer",
            "what is the retention period for exported logs",
            "--json",
        ],
    );
    assert!(success, "answer failed: stdout={}, stderr={}", stdout, stderr);

    let output: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    if let Some(conflicts) = output.get("conflicts").and_then(|c| c.as_array()) {
        assert!(!conflicts.is_empty(), "conflict must be surfaced");
        let detail = conflicts[0].get("detail").and_then(|d| d.as_str()).unwrap();
        assert!(detail.contains("30"));
        assert!(detail.contains("90"));
    } else {
        // Abstained instead: the rationale must still exist.
        assert_eq!(output.get("abstain").unwrap(), true);
    }
}

#[test]
fn test_runs_lists_recorded_traces() {
    let (_tmp, config_path) = setup_test_env();

    run_evi(&config_path, &["init"]);
    run_evi(&config_path, &["ingest"]);
    run_evi(&config_path, &["search", "backup cadence"]);
    run_evi(&config_path, &["answer", "what is the database backup cadence"]);

    let (stdout, _, success) = run_evi(&config_path, &["runs"]);
    assert!(success);
    assert!(stdout.contains("route"));
    assert!(stdout.contains("retrieve"));
    assert!(stdout.contains("backup cadence"));
}

#[test]
fn test_stats_reports_counts() {
    let (_tmp, config_path) = setup_test_env();

    run_evi(&config_path, &["init"]);
    run_evi(&config_path, &["ingest"]);

    let (stdout, _, success) = run_evi(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Documents:   3"));
    assert!(stdout.contains("Active index: none"));
}
