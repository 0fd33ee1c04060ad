//! End-to-end tests of the `mlxadmin` binary
#![cfg(unix)]

mod common;

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TWO_MODELS: &str = r#"
models:
  - id: qwen
    name: Qwen Coder
    repo_id: mlx-community/Qwen2.5-Coder-7B-Instruct-4bit
    port: 9201
  - id: llama
    name: Llama
    repo_id: mlx-community/Llama-3.2-3B-Instruct-4bit
    port: 9202
    draft_model: mlx-community/Llama-3.2-1B-Instruct-4bit
    num_draft_tokens: 2
"#;

/// `lsof` stand-in that reports the pid in `<state>/<port>.pid`
fn write_fake_lsof(state: &Path) -> PathBuf {
    let script = r#"#!/bin/sh
port=""
for arg in "$@"; do
  case "$arg" in
    -iTCP:*) port="${arg#-iTCP:}" ;;
  esac
done
if [ -f "STATE/$port.pid" ]; then
  cat "STATE/$port.pid"
  exit 0
fi
exit 1
"#
    .replace("STATE", &state.display().to_string());
    common::write_executable(state, "lsof", &script)
}

struct Env {
    dir: TempDir,
    config: PathBuf,
    lsof: PathBuf,
}

impl Env {
    fn new(models: &str) -> Self {
        let (dir, config) = common::temp_config_file(models);
        let lsof = write_fake_lsof(dir.path());
        Self { dir, config, lsof }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("mlxadmin").unwrap();
        cmd.env_remove("RUST_LOG")
            .env("MLXADMIN_LSOF_BINARY", &self.lsof)
            .env("MLXADMIN_LOGS_DIR", self.dir.path().join("logs"))
            .arg("--config")
            .arg(&self.config);
        cmd
    }
}

#[test]
fn test_list_missing_config_is_empty() {
    let dir = TempDir::new().unwrap();
    let mut cmd = Command::cargo_bin("mlxadmin").unwrap();
    cmd.arg("--config")
        .arg(dir.path().join("absent.yaml"))
        .arg("list");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("No models configured"));
}

#[test]
fn test_list_shows_models() {
    let env = Env::new(TWO_MODELS);
    env.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("qwen"))
        .stdout(predicate::str::contains("9202"))
        .stdout(predicate::str::contains("(2 tokens)"));
}

#[test]
fn test_list_json_is_parseable() {
    let env = Env::new(TWO_MODELS);
    let output = env.cmd().arg("list").arg("--json").output().unwrap();
    assert!(output.status.success());

    let models: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(models[0]["id"], "qwen");
    assert_eq!(models[1]["repo_id"], "mlx-community/Llama-3.2-3B-Instruct-4bit");
    assert_eq!(models[1]["num_draft_tokens"], 2);
}

#[test]
fn test_duplicate_port_config_fails() {
    let env = Env::new(
        r#"
models:
  - id: a
    name: A
    repo_id: r/a
    port: 9300
  - id: b
    name: B
    repo_id: r/b
    port: 9300
"#,
    );
    env.cmd()
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate port 9300"));
}

#[test]
fn test_status_json_all_offline() {
    let env = Env::new(TWO_MODELS);
    let output = env.cmd().arg("status").arg("--json").output().unwrap();
    assert!(output.status.success());

    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 2);
    assert_eq!(rows[0]["status"], "offline");
    assert_eq!(rows[0]["endpoint"], "http://localhost:9201");
}

#[test]
fn test_logs_before_any_start() {
    let env = Env::new(TWO_MODELS);
    env.cmd()
        .args(["logs", "qwen"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No logs yet."));
}

#[test]
fn test_unknown_model_fails() {
    let env = Env::new(TWO_MODELS);
    env.cmd()
        .args(["logs", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown model: nope"));
}

#[test]
fn test_stop_offline_model_is_a_message() {
    let env = Env::new(TWO_MODELS);
    env.cmd()
        .args(["stop", "qwen"])
        .assert()
        .success()
        .stdout(predicate::str::contains("qwen is not running"));
}

#[test]
fn test_start_status_stop_across_invocations() {
    let env = Env::new(TWO_MODELS);
    let server = common::write_fake_server(env.dir.path(), "0.2");

    env.cmd()
        .env("MLXADMIN_SERVER_BINARY", &server)
        .args(["start", "qwen", "--timeout", "10"])
        .assert()
        .success()
        .stdout(predicate::str::contains("qwen is online at http://localhost:9201"));

    env.cmd()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("ONLINE"))
        .stdout(predicate::str::contains("http://localhost:9201/v1"));

    env.cmd()
        .args(["logs", "qwen", "-n", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("loading for port 9201"));

    // A second invocation has no records and must stop via the port owner
    env.cmd()
        .args(["stop", "qwen"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stopped qwen"));

    let marker = env.dir.path().join("9201.pid");
    for _ in 0..100 {
        if !marker.exists() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    assert!(!marker.exists(), "server did not shut down");

    env.cmd()
        .arg("stop-all")
        .assert()
        .success()
        .stdout(predicate::str::contains("No models were running"));
}

#[test]
fn test_add_persists_and_rejects_duplicate_port() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("models.yaml");
    let add = |id: &str, port: &str| {
        let mut cmd = Command::cargo_bin("mlxadmin").unwrap();
        cmd.arg("--config")
            .arg(&config)
            .args(["add", "--id", id, "--repo-id", "mlx-community/x", "--port", port]);
        cmd
    };

    add("first", "9400")
        .assert()
        .success()
        .stdout(predicate::str::contains("Added first on port 9400"));
    add("second", "9400")
        .assert()
        .failure()
        .stderr(predicate::str::contains("duplicate port 9400"));

    let stored = mlxadmin::Config::from_file(&config).unwrap();
    assert_eq!(stored.models.len(), 1);
    assert_eq!(stored.models[0].name, "first");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_search_prints_hub_results() {
    let hub = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/models"))
        .and(query_param("search", "qwen"))
        .and(query_param("filter", "mlx"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            {"id": "mlx-community/Qwen2.5-7B-Instruct-4bit", "downloads": 1234, "likes": 5},
            {"id": "mlx-community/Qwen2.5-0.5B-Instruct-4bit"}
        ])))
        .mount(&hub)
        .await;

    let env = Env::new(TWO_MODELS);
    env.cmd()
        .env("MLXADMIN_CATALOG_URL", hub.uri())
        .args(["search", "qwen"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Qwen2.5-7B-Instruct-4bit"))
        .stdout(predicate::str::contains("1234"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chat_prompt_streams_reply() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(body.as_bytes().to_vec(), "text/event-stream"),
        )
        .mount(&server)
        .await;
    let port = server.address().port();

    let env = Env::new(&format!(
        "models:\n  - id: local\n    name: Local\n    repo_id: mlx-community/local\n    port: {}\n",
        port
    ));
    // Report the port as owned by this test process
    std::fs::write(
        env.dir.path().join(format!("{}.pid", port)),
        std::process::id().to_string(),
    )
    .unwrap();

    env.cmd()
        .env("MLXADMIN_RELAY_HOST", "http://127.0.0.1")
        .args(["chat", "local", "--prompt", "hi"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Hello"));
}

#[test]
fn test_chat_offline_model_fails() {
    let env = Env::new(TWO_MODELS);
    env.cmd()
        .args(["chat", "qwen", "--prompt", "hi"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Model qwen is not running"));
}
