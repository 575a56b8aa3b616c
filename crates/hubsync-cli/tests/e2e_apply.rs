//! End-to-end tests of `hubsync apply` and `hubsync show`.
//!
//! Each test runs the binary as a subprocess against a store in a temp dir.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Test Harness
// ---------------------------------------------------------------------------

fn hubsync(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("hubsync"));
    cmd.current_dir(dir);
    cmd.env("HUBSYNC_LOG", "error");
    cmd.env_remove("HUBSYNC_AGGREGATION_LEVEL");
    cmd.args(["--config", "absent.toml", "--db", "store.sqlite3"]);
    cmd
}

fn message(kind: &str, generation: u64, objects: &Value) -> String {
    json!({
        "key": format!("hub1.{kind}"),
        "version": format!("1.{generation}"),
        "payload": {
            "objects": objects,
            "leafHubName": "hub1",
            "bundleVersion": { "incarnation": 1, "generation": generation },
        },
    })
    .to_string()
}

fn write_batch(dir: &Path, name: &str, lines: &[String]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, lines.join("\n")).expect("write batch");
    path
}

fn show_json(dir: &Path, args: &[&str]) -> Value {
    let output = hubsync(dir)
        .arg("--json")
        .arg("show")
        .args(args)
        .output()
        .expect("show should not crash");
    assert!(
        output.status.success(),
        "show failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("show --json should produce valid JSON")
}

fn cpp(policy: &str, compliant: &[&str], non_compliant: &[&str]) -> Value {
    json!([{
        "policyId": policy,
        "compliantClusters": compliant,
        "nonCompliantClusters": non_compliant,
    }])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn apply_then_show_compliance() {
    let dir = TempDir::new().expect("temp dir");
    let batch = write_batch(
        dir.path(),
        "batch.jsonl",
        &[message("ClustersPerPolicy", 1, &cpp("p1", &["c1"], &["c2"]))],
    );

    hubsync(dir.path())
        .arg("apply")
        .arg(&batch)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 applied"));

    let rows = show_json(dir.path(), &["compliance"]);
    let rows = rows.as_array().expect("array");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["cluster_name"], "c1");
    assert_eq!(rows[0]["compliance"], "compliant");
    assert_eq!(rows[1]["compliance"], "non_compliant");
}

#[test]
fn duplicate_and_stale_messages_are_dropped() {
    let dir = TempDir::new().expect("temp dir");
    let newer = message("ClustersPerPolicy", 2, &cpp("p1", &[], &["c1"]));
    let older = message("ClustersPerPolicy", 1, &cpp("p1", &["c1"], &[]));
    let batch = write_batch(dir.path(), "batch.jsonl", &[newer.clone(), newer, older]);

    let output = hubsync(dir.path())
        .args(["--json", "apply"])
        .arg(&batch)
        .output()
        .expect("apply");
    assert!(output.status.success());
    let summary: Value = serde_json::from_slice(&output.stdout).expect("summary json");
    assert_eq!(summary["applied"], 1);
    assert_eq!(summary["stale"], 2);

    let rows = show_json(dir.path(), &["compliance"]);
    assert_eq!(rows[0]["compliance"], "non_compliant");

    let versions = show_json(dir.path(), &["versions"]);
    assert_eq!(versions[0]["message_kind"], "ClustersPerPolicy");
    assert_eq!(versions[0]["version"]["generation"], 2);
}

#[test]
fn minimal_bundles_are_ignored_at_full_level() {
    let dir = TempDir::new().expect("temp dir");
    let batch = write_batch(
        dir.path(),
        "batch.jsonl",
        &[message(
            "MinimalPolicyCompliance",
            1,
            &json!([{ "policyId": "p1", "appliedClusters": 3, "nonCompliantClusters": 1 }]),
        )],
    );

    hubsync(dir.path())
        .arg("apply")
        .arg(&batch)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 ignored"));
    let rows = show_json(dir.path(), &["aggregated"]);
    assert!(rows.as_array().expect("array").is_empty());

    hubsync(dir.path())
        .env("HUBSYNC_AGGREGATION_LEVEL", "minimal")
        .arg("apply")
        .arg(&batch)
        .assert()
        .success();
    let rows = show_json(dir.path(), &["aggregated"]);
    assert_eq!(rows[0]["applied_clusters"], 3);
    assert_eq!(rows[0]["remediation_action"], "inform");
}

#[test]
fn malformed_line_fails_with_location() {
    let dir = TempDir::new().expect("temp dir");
    let batch = write_batch(dir.path(), "bad.jsonl", &["not json".to_string()]);
    hubsync(dir.path())
        .arg("apply")
        .arg(&batch)
        .assert()
        .failure()
        .stderr(predicate::str::contains("bad.jsonl:1"));
}

#[test]
fn hub_mismatch_fails_unless_keep_going() {
    let dir = TempDir::new().expect("temp dir");
    let line = message("PlacementDecisions", 1, &json!([])).replacen("hub1.", "hub2.", 1);
    let batch = write_batch(dir.path(), "batch.jsonl", &[line]);

    hubsync(dir.path()).arg("apply").arg(&batch).assert().failure();
    hubsync(dir.path())
        .args(["apply", "--keep-going"])
        .arg(&batch)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 failed"));
}

#[test]
fn migrate_reports_schema_version() {
    let dir = TempDir::new().expect("temp dir");
    hubsync(dir.path())
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("schema version 2"));
}

#[test]
fn config_prints_defaults() {
    let dir = TempDir::new().expect("temp dir");
    hubsync(dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("delta_switch_factor = 3"));
}
