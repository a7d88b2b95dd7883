mod common;

use assert_cmd::Command;
use assert_cmd::cargo_bin;
use common::dead_letter;
use payflow::application::broker::{BrokerConfig, MessageBroker};
use payflow::domain::message::PAYMENT_FAILED;
use payflow::infrastructure::in_memory_broker::InMemoryConnector;
use predicates::prelude::*;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

struct Workspace {
    dir: TempDir,
    broker_url: String,
}

impl Workspace {
    fn audit_log(&self) -> PathBuf {
        self.dir.path().join("audit.log")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(cargo_bin!("payflow"));
        cmd.env_remove("PAYFLOW_BROKER_URLS")
            .env_remove("PAYFLOW_ENVIRONMENT")
            .env_remove("PAYFLOW_AUDIT_LOG")
            .env_remove("PAYFLOW_OPERATOR")
            .arg("--broker-url")
            .arg(&self.broker_url)
            .arg("--audit-log")
            .arg(self.audit_log())
            .arg("--operator")
            .arg("ops-oncall");
        cmd
    }

    fn audit_lines(&self) -> Vec<Value> {
        std::fs::read_to_string(self.audit_log())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }
}

/// A file-backed broker with the given payloads dead-lettered from
/// `payment.failed`, written to disk for the binary to load.
async fn workspace(payloads: &[Value]) -> Workspace {
    let dir = tempfile::tempdir().unwrap();
    let broker_url = format!("file://{}", dir.path().join("broker.json").display());
    let broker = Arc::new(MessageBroker::new(
        BrokerConfig {
            endpoints: vec![broker_url.clone()],
            ..Default::default()
        },
        Arc::new(InMemoryConnector::new()),
    ));
    broker.connect().await.unwrap();
    for payload in payloads {
        dead_letter(&broker, PAYMENT_FAILED, payload.clone()).await;
    }
    broker.disconnect().await.unwrap();
    Workspace { dir, broker_url }
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap()
}

fn read_json(path: &Path) -> Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn test_stats_reports_dlq_depth() {
    let ws = workspace(&[json!({ "payment_id": "p1" }), json!({ "payment_id": "p2" })]).await;

    let output = ws.command().arg("stats").assert().success().get_output().clone();

    let stats = stdout_json(&output);
    assert_eq!(stats["queue"], "dead_letter_queue");
    assert_eq!(stats["message_count"], 2);

    let audit = ws.audit_lines();
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0]["action"], "stats");
    assert_eq!(audit[0]["operator"], "ops-oncall");
    assert_eq!(audit[0]["environment"], "development");
    assert_eq!(audit[0]["result"]["message_count"], 2);
}

#[tokio::test]
async fn test_peek_leaves_messages_in_place() {
    let ws = workspace(&[json!({ "payment_id": "p1", "tenant": "acme" })]).await;

    ws.command()
        .args(["peek", "--limit", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"tenant\": \"acme\""))
        .stdout(predicate::str::contains("\"dead_letter_reason\": \"rejected\""));

    let output = ws.command().arg("stats").assert().success().get_output().clone();
    assert_eq!(stdout_json(&output)["message_count"], 1);
}

#[tokio::test]
async fn test_peek_writes_output_file() {
    let ws = workspace(&[json!({ "payment_id": "p1" })]).await;
    let path = ws.dir.path().join("peek.json");

    ws.command()
        .arg("peek")
        .arg("--output")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"peeked\": 1"));

    let entries = read_json(&path);
    assert_eq!(entries[0]["payload"]["payment_id"], "p1");
    assert_eq!(entries[0]["topic"], PAYMENT_FAILED);
}

#[tokio::test]
async fn test_dry_run_redrive_changes_nothing() {
    let ws = workspace(&[json!({ "payment_id": "p1" }), json!({ "payment_id": "p2" })]).await;

    let output = ws
        .command()
        .args(["redrive", "--dry-run"])
        .assert()
        .success()
        .get_output()
        .clone();
    let report = stdout_json(&output);
    assert_eq!(report["processed"], 2);
    assert_eq!(report["outcomes"][0]["action"], "dry_run");

    let output = ws.command().arg("stats").assert().success().get_output().clone();
    assert_eq!(stdout_json(&output)["message_count"], 2);

    let audit = ws.audit_lines();
    assert_eq!(audit[0]["action"], "redrive");
    assert_eq!(audit[0]["parameters"]["dry_run"], true);
    assert_eq!(audit[0]["outcomes"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_redrive_with_filter_republishes_matches() {
    let ws = workspace(&[
        json!({ "payment_id": "p1", "tenant": "acme" }),
        json!({ "payment_id": "p2", "tenant": "globex" }),
    ])
    .await;

    let output = ws
        .command()
        .args(["redrive", "--filter", r#"{"tenant":"acme"}"#])
        .assert()
        .success()
        .get_output()
        .clone();
    let report = stdout_json(&output);
    assert_eq!(report["processed"], 1);
    assert_eq!(report["skipped"], 1);

    let output = ws.command().arg("stats").assert().success().get_output().clone();
    assert_eq!(stdout_json(&output)["message_count"], 0);

    let snapshot = read_json(&ws.dir.path().join("broker.json"));
    assert!(snapshot.to_string().contains("p1"));
    assert!(!snapshot.to_string().contains("p2"));
}

#[tokio::test]
async fn test_validate_writes_csv_report() {
    let ws = workspace(&[json!({ "payment_id": "p1" }), json!(["not", "an", "object"])]).await;
    let path = ws.dir.path().join("report.csv");

    ws.command()
        .arg("validate")
        .arg("--report")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"invalid\": 1"));

    let report = std::fs::read_to_string(&path).unwrap();
    let mut lines = report.lines();
    assert_eq!(
        lines.next(),
        Some("message_id,original_routing_key,dead_letter_reason,valid,issues")
    );
    assert_eq!(report.lines().count(), 3);
    assert!(report.contains(PAYMENT_FAILED));
}

#[tokio::test]
async fn test_purge_requires_confirm_flag() {
    let ws = workspace(&[json!({ "payment_id": "p1" })]).await;

    ws.command()
        .arg("purge")
        .assert()
        .failure()
        .stderr(predicate::str::contains("purge requires --confirm"));

    let output = ws.command().arg("stats").assert().success().get_output().clone();
    assert_eq!(stdout_json(&output)["message_count"], 1);

    let audit = ws.audit_lines();
    assert_eq!(audit[0]["action"], "purge");
    assert_eq!(audit[0]["result"]["status"], "error");
    assert_eq!(audit[0]["result"]["error"]["code"], "CONFIRMATION_REQUIRED");
}

#[tokio::test]
async fn test_purge_with_confirm_empties_dlq() {
    let ws = workspace(&[json!({ "payment_id": "p1" }), json!({ "payment_id": "p2" })]).await;

    ws.command()
        .args(["purge", "--confirm"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"purged\": 2"));

    let output = ws.command().arg("stats").assert().success().get_output().clone();
    assert_eq!(stdout_json(&output)["message_count"], 0);

    let audit = ws.audit_lines();
    let outcomes = audit[0]["outcomes"].as_array().unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o["action"] == "purged"));
}

#[tokio::test]
async fn test_production_purge_declined_at_prompt() {
    let ws = workspace(&[json!({ "payment_id": "p1" })]).await;

    ws.command()
        .args(["--environment", "production", "purge", "--confirm"])
        .write_stdin("no\n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("purge declined by operator"));

    let output = ws.command().arg("stats").assert().success().get_output().clone();
    assert_eq!(stdout_json(&output)["message_count"], 1);
    assert_eq!(ws.audit_lines()[0]["environment"], "production");
}

#[tokio::test]
async fn test_production_redrive_approved_at_prompt() {
    let ws = workspace(&[json!({ "payment_id": "p1" })]).await;

    ws.command()
        .args(["--environment", "production", "redrive"])
        .write_stdin("yes\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"processed\": 1"));

    let output = ws.command().arg("stats").assert().success().get_output().clone();
    assert_eq!(stdout_json(&output)["message_count"], 0);
    assert_eq!(ws.audit_lines()[0]["result"]["processed"], 1);
}
