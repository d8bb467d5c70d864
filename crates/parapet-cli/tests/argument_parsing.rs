//! Focused CLI argument parsing tests.
//!
//! These never start the server: every case either fails argument parsing
//! or exits through `--print-config`.

#![allow(deprecated)] // Command::cargo_bin is deprecated but replacement requires newer assert_cmd

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn parapet(config_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("parapet").unwrap();
    cmd.arg("--config-dir")
        .arg(config_dir.path())
        .env_remove("PARAPET_SERVER__PORT")
        .env_remove("PARAPET_TLS__ENGINE");
    cmd
}

#[test]
fn version_flag_shows_version() {
    Command::cargo_bin("parapet")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("parapet"));
}

#[test]
fn help_lists_engine_argument() {
    Command::cargo_bin("parapet")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("<ENGINE>"))
        .stdout(predicate::str::contains("--max-message-size"));
}

#[test]
fn missing_engine_is_rejected() {
    Command::cargo_bin("parapet")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("<ENGINE>"));
}

#[test]
fn unknown_engine_lists_valid_choices() {
    let temp = TempDir::new().unwrap();
    parapet(&temp)
        .arg("openssl")
        .assert()
        .failure()
        .stderr(predicate::str::contains("aws-lc-rs, ring"));
}

#[test]
fn print_config_reflects_flags() {
    let temp = TempDir::new().unwrap();
    parapet(&temp)
        .args(["ring", "--port", "9443", "--max-message-size", "4096", "--print-config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("engine = \"ring\""))
        .stdout(predicate::str::contains("port = 9443"))
        .stdout(predicate::str::contains("max_message_size = 4096"));
}

#[test]
fn flags_override_project_config() {
    let temp = TempDir::new().unwrap();
    std::fs::write(
        temp.path().join("parapet.toml"),
        "[server]\nport = 7000\nbacklog = 64\n",
    )
    .unwrap();

    parapet(&temp)
        .args(["aws-lc-rs", "--port", "7001", "--print-config"])
        .assert()
        .success()
        .stdout(predicate::str::contains("port = 7001"))
        .stdout(predicate::str::contains("backlog = 64"));
}

#[test]
fn malformed_project_config_fails() {
    let temp = TempDir::new().unwrap();
    std::fs::write(temp.path().join("parapet.toml"), "[server\n").unwrap();

    parapet(&temp)
        .args(["ring", "--print-config"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}

#[test]
fn invalid_port_is_rejected() {
    let temp = TempDir::new().unwrap();
    parapet(&temp)
        .args(["ring", "--port", "70000"])
        .assert()
        .failure();
}
