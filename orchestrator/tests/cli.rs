//! CLI tests for the `orchestrator` binary.
//!
//! Spawns the binary and verifies exit codes and JSON reports for init,
//! select, validate, status, and a full cycle against a shell-script
//! decision endpoint.

use std::process::Command;

use orchestrator::exit_codes;
use orchestrator::test_support::{TestWorkspace, task_with_deps};
use serde_json::Value;

fn orchestrator(root: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_orchestrator"))
        .arg("--root")
        .arg(root)
        .args(args)
        .output()
        .expect("run orchestrator")
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json report on stdout")
}

#[test]
fn init_twice_requires_force() {
    let temp = tempfile::tempdir().expect("tempdir");
    let first = orchestrator(temp.path(), &["init"]);
    assert_eq!(first.status.code(), Some(exit_codes::OK));

    let second = orchestrator(temp.path(), &["init"]);
    assert_eq!(second.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&second.stderr).contains("--force"));

    let forced = orchestrator(temp.path(), &["init", "--force"]);
    assert_eq!(forced.status.code(), Some(exit_codes::OK));
}

#[test]
fn select_empty_graph_exits_with_blocked_code() {
    let ws = TestWorkspace::new().expect("workspace");
    let output = orchestrator(ws.root(), &["select"]);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));
    let report = stdout_json(&output);
    assert_eq!(report["kind"], "empty");
    assert_eq!(report["recovered"], false);
}

#[test]
fn resume_clears_a_halted_session() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.seed(vec![task_with_deps("lexer", &[])]).expect("seed");
    let store = ws.store().expect("store");
    let mut snapshot = store.load().expect("load").snapshot;
    snapshot
        .session
        .halt("structural", "dependency cycle: a -> b -> a", chrono::Utc::now());
    store.save(&snapshot).expect("save");

    let select = orchestrator(ws.root(), &["select"]);
    assert_eq!(select.status.code(), Some(exit_codes::HALTED));
    let cycle = orchestrator(ws.root(), &["cycle"]);
    assert_eq!(cycle.status.code(), Some(exit_codes::HALTED));
    assert!(String::from_utf8_lossy(&cycle.stderr).contains("orchestrator resume"));

    let resume = orchestrator(ws.root(), &["resume"]);
    assert_eq!(resume.status.code(), Some(exit_codes::OK));
    assert_eq!(stdout_json(&resume)["cleared"]["class"], "structural");
    let select = orchestrator(ws.root(), &["select"]);
    assert_eq!(select.status.code(), Some(exit_codes::OK));
}

#[test]
fn select_reports_ready_task() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.seed(vec![task_with_deps("lexer", &[]), task_with_deps("parser", &["lexer"])])
        .expect("seed");

    let output = orchestrator(ws.root(), &["select"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let report = stdout_json(&output);
    assert_eq!(report["kind"], "task");
    assert_eq!(report["id"], "lexer");
}

#[test]
fn validate_reports_corruption_without_repairing() {
    let ws = TestWorkspace::new().expect("workspace");
    std::fs::write(&ws.paths().session_path, "{").expect("corrupt");

    let output = orchestrator(ws.root(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert_eq!(stdout_json(&output)["ok"], false);
    let raw = std::fs::read_to_string(&ws.paths().session_path).expect("read");
    assert_eq!(raw, "{");
}

#[cfg(unix)]
#[test]
fn cycle_dispatches_through_endpoint_command() {
    use std::os::unix::fs::PermissionsExt;

    let ws = TestWorkspace::new().expect("workspace");
    ws.seed(vec![task_with_deps("lexer", &[])]).expect("seed");
    let script = ws.root().join("endpoint.sh");
    std::fs::write(
        &script,
        "#!/bin/sh\ncat > /dev/null\necho '{\"kind\":\"continue\",\"instruction\":\"Write the lexer\"}'\n",
    )
    .expect("write script");
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).expect("chmod");
    ws.configure(|config| {
        config.gateway.command = vec![script.display().to_string()];
    })
    .expect("configure");

    let output = orchestrator(ws.root(), &["cycle"]);
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report = stdout_json(&output);
    assert_eq!(report["kind"], "continue");
    assert_eq!(report["task_id"], "lexer");
    assert_eq!(report["instruction"], "Write the lexer");
    assert_eq!(report["iteration"], 1);

    let audit = std::fs::read_to_string(&ws.paths().gateway_audit_path).expect("audit");
    assert_eq!(audit.lines().count(), 1);

    let status = orchestrator(ws.root(), &["status"]);
    assert_eq!(stdout_json(&status)["active"]["task_id"], "lexer");
}

#[test]
fn cycle_with_unlaunchable_endpoint_is_blocked() {
    let ws = TestWorkspace::new().expect("workspace");
    ws.seed(vec![task_with_deps("lexer", &[])]).expect("seed");
    ws.configure(|config| {
        config.gateway.command = vec!["/nonexistent/decision-endpoint".to_string()];
    })
    .expect("configure");

    let output = orchestrator(ws.root(), &["cycle"]);
    assert_eq!(output.status.code(), Some(exit_codes::BLOCKED));
    let report = stdout_json(&output);
    assert_eq!(report["class"], "gateway");
}
