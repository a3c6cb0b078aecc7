//! CLI integration tests for nixsafectl
//!
//! - run ... --json        outcome JSON and exit code per outcome
//! - run ... --dry-run     preview without touching the system
//! - audit --json          records written by earlier runs
//! - check-config          valid and invalid config files

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_nixsafectl"))
}

/// Config rooted in a temp dir; disk policy relaxed so any host passes
fn write_config(dir: &Path, extra: &str) -> PathBuf {
    let path = dir.join("config.toml");
    let content = format!(
        r#"
[policy]
min_free_ratio = 0.0
min_free_bytes = 0
disk_check_path = "/"

[paths]
state_dir = "{state}"
system_profile = "{profile}"

{extra}
"#,
        state = dir.join("state").display(),
        profile = dir.join("profiles/system").display(),
        extra = extra,
    );
    fs::write(&path, content).unwrap();
    path
}

fn nixsafectl(config: &Path, args: &[&str]) -> Output {
    Command::new(binary())
        .arg("--config")
        .arg(config)
        .args(args)
        .env("NIXSAFE_LOG", "error")
        .output()
        .expect("failed to run nixsafectl")
}

fn stdout_json(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("invalid JSON ({}): {}", e, stdout))
}

#[test]
fn test_injection_rejected_with_exit_code_2() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    let output = nixsafectl(
        &config,
        &["run", "install-package", "-e", "package=pkg;rm -rf /", "--json"],
    );
    assert_eq!(output.status.code(), Some(2));

    let json = stdout_json(&output);
    assert_eq!(json["outcome"], "validation_rejected");
    assert!(json["reason"].as_str().unwrap().contains("unsafe"));
}

#[test]
fn test_dry_run_preview() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    let output = nixsafectl(
        &config,
        &["run", "install-package", "-e", "package=firefox", "--dry-run", "--json"],
    );
    assert_eq!(output.status.code(), Some(0), "{}", String::from_utf8_lossy(&output.stderr));

    let json = stdout_json(&output);
    assert_eq!(json["outcome"], "executed");
    assert_eq!(json["dry_run"], true);
    assert!(json["result"]["stdout"]
        .as_str()
        .unwrap()
        .starts_with("would install firefox"));
    assert!(json["generation"].is_null());
}

#[test]
fn test_remove_without_yes_needs_confirmation() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    let output = nixsafectl(&config, &["run", "remove-package", "-e", "package=firefox"]);
    assert_eq!(output.status.code(), Some(4));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("--yes"), "{}", stdout);
}

#[test]
fn test_unknown_kind_suggests_examples() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    let output = nixsafectl(&config, &["run", "format-disk", "--json"]);
    assert_eq!(output.status.code(), Some(2));
    let json = stdout_json(&output);
    assert!(!json["suggestions"].as_array().unwrap().is_empty());
}

#[test]
fn test_help_request() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    let output = nixsafectl(&config, &["run", "help"]);
    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("Supported requests"));
}

#[test]
fn test_audit_lists_previous_runs() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");

    nixsafectl(&config, &["run", "search-package", "-e", "query=editor", "--dry-run"]);
    nixsafectl(&config, &["run", "install-package", "-e", "package=../etc"]);

    let output = nixsafectl(&config, &["audit", "--json", "--limit", "10"]);
    assert_eq!(output.status.code(), Some(0));
    let json = stdout_json(&output);
    let records = json.as_array().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["outcome"], "dry_run");
    assert_eq!(records[1]["outcome"], "validation_rejected");
    assert!(records[0]["sequence"].as_u64().unwrap() < records[1]["sequence"].as_u64().unwrap());
}

#[test]
fn test_check_config() {
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), "");
    let output = nixsafectl(&config, &["check-config"]);
    assert_eq!(output.status.code(), Some(0));

    let bad_dir = TempDir::new().unwrap();
    let bad = write_config(bad_dir.path(), "[validation]\nmax_plan_steps = 0\n");
    let output = nixsafectl(&bad, &["check-config"]);
    assert!(!output.status.success());
}
