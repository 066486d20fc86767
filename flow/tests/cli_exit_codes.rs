//! CLI tests for `flow` exit codes.
//!
//! Spawns the flow binary against temp configs and checks the exit code
//! for invalid graphs, failing nodes and dry runs.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use flow::exit_codes;

fn write_config(root: &Path, body: &str) {
    fs::write(root.join("flow.toml"), body).expect("write flow.toml");
}

fn flow(root: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_flow"))
        .current_dir(root)
        .args(args)
        .output()
        .expect("spawn flow")
}

#[test]
fn validate_rejects_dependency_cycle() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(
        temp.path(),
        r#"
[[nodes]]
name = "match"
kind = "manual"
depends_on = ["apply"]

[[nodes]]
name = "apply"
kind = "manual"
depends_on = ["match"]
"#,
    );

    let output = flow(temp.path(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cycle"), "stderr: {stderr}");
}

#[test]
fn validate_accepts_acyclic_graph() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(
        temp.path(),
        r#"
[[nodes]]
name = "sync"
kind = "manual"

[[nodes]]
name = "match"
kind = "manual"
depends_on = ["sync"]
"#,
    );

    let output = flow(temp.path(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(String::from_utf8_lossy(&output.stdout).contains("2 nodes in 2 levels"));
}

#[test]
fn unknown_dependency_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(
        temp.path(),
        r#"
[[nodes]]
name = "match"
kind = "manual"
depends_on = ["sync"]
"#,
    );
    let output = flow(temp.path(), &["validate"]);
    assert!(String::from_utf8_lossy(&output.stderr).contains("sync"));
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn malformed_config_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(temp.path(), "nodes = 3\n");
    let output = flow(temp.path(), &["validate"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[cfg(unix)]
#[test]
fn failing_node_exits_with_node_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(
        temp.path(),
        r#"
[[nodes]]
name = "sync"
command = ["sh", "-c", "echo 'token expired' >&2; exit 3"]
"#,
    );

    let output = flow(temp.path(), &["run", "--yes"]);
    assert_eq!(output.status.code(), Some(exit_codes::NODE_FAILED));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("token expired"), "stderr: {stderr}");
}

#[cfg(unix)]
#[test]
fn dry_run_executes_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_config(
        temp.path(),
        r#"
[[nodes]]
name = "sync"
command = ["sh", "-c", "touch ran.txt"]
"#,
    );

    let output = flow(temp.path(), &["run", "--dry-run"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("1. sync"), "stdout: {stdout}");
    assert!(!temp.path().join("ran.txt").exists());
    assert!(!temp.path().join(".cache").exists());
}
