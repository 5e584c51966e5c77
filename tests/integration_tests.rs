use std::{path::PathBuf, process::Command};

const SAMPLE_CONFIG: &str = r#"
port_name = "/dev/ttyUSB0"

[tuning]
cycle_time_ms = 500

[[devices]]
id = "circulator"
address = 32

[[devices.tasks]]
name = "head"
head_class = 2
address = 37
priority = "high"

[[devices.tasks]]
name = "start"
head_class = 3
address = 6
priority = "low"
"#;

fn genibridge() -> Command {
    Command::new(env!("CARGO_BIN_EXE_genibridge"))
}

/// Write a config into the temp dir, unique per test.
fn temp_config(name: &str, content: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("genibridge_{}_{}", std::process::id(), name));
    std::fs::write(&path, content).expect("Failed to write temp config");
    path
}

/// Basic smoke tests for CLI functionality
#[test]
fn test_cli_help() {
    let output = genibridge()
        .arg("--help")
        .output()
        .expect("Failed to execute genibridge binary");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage: genibridge"));
    assert!(stdout.contains("--check-config"));
}

#[test]
fn test_cli_list_ports_json() {
    let output = genibridge()
        .arg("--list-ports")
        .arg("--json")
        .output()
        .expect("Failed to execute genibridge binary");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("list is not JSON");
    assert!(parsed.is_array());
}

#[test]
fn test_cli_check_config() {
    let path = temp_config("check.toml", SAMPLE_CONFIG);
    let output = genibridge()
        .arg("--check-config")
        .arg(&path)
        .arg("--json")
        .output()
        .expect("Failed to execute genibridge binary");
    std::fs::remove_file(&path).ok();

    assert!(output.status.success());
    let summary: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("summary is not JSON");
    assert_eq!(summary["port_name"], "/dev/ttyUSB0");
    assert_eq!(summary["cycle_time_ms"], 500);
    assert_eq!(summary["devices"][0]["tasks"], 2);
}

#[test]
fn test_cli_check_config_rejects_bad_head_class() {
    let path = temp_config(
        "bad.toml",
        &SAMPLE_CONFIG.replace("head_class = 3", "head_class = 6"),
    );
    let output = genibridge()
        .arg("--check-config")
        .arg(&path)
        .output()
        .expect("Failed to execute genibridge binary");
    std::fs::remove_file(&path).ok();

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("head class 6"));
}

#[test]
fn test_cli_without_action_fails() {
    let output = genibridge()
        .output()
        .expect("Failed to execute genibridge binary");

    assert!(!output.status.success());
}
