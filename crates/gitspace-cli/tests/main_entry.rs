//! Integration tests for the `gitspace` binary entry point.

use std::fs;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use tempfile::TempDir;

#[test]
fn version_flag_succeeds() {
    let mut command = cargo_bin_cmd!("gitspace");
    command.arg("--version");
    command.assert().success().stdout(contains("gitspace"));
}

#[test]
fn list_reports_an_empty_plugins_root() {
    let root = TempDir::new().expect("temp dir");
    let config = root.path().join("gitspace.toml");
    fs::write(&config, "").expect("write config");

    let mut command = cargo_bin_cmd!("gitspace");
    command
        .env("GITSPACE_PLUGINS_DIR", root.path().join("plugins"))
        .arg("--config-path")
        .arg(&config)
        .args(["plugin", "list"]);
    command
        .assert()
        .success()
        .stdout(contains("no plugins installed"));
}

#[test]
fn unknown_plugin_exits_with_failure() {
    let root = TempDir::new().expect("temp dir");
    let config = root.path().join("gitspace.toml");
    fs::write(&config, "").expect("write config");

    let mut command = cargo_bin_cmd!("gitspace");
    command
        .arg("--config-path")
        .arg(&config)
        .arg("--plugins-dir")
        .arg(root.path().join("plugins"))
        .args(["plugin", "uninstall", "ghost"]);
    command.assert().failure().stderr(contains("ghost"));
}
