//! Smoke tests -- verify the binary runs and its subcommands parse.

use assert_cmd::Command;

fn loadmeter() -> Command {
    let mut cmd = Command::cargo_bin("loadmeter").unwrap();
    cmd.env_remove("LOADMETER_CONFIG");
    cmd
}

#[test]
fn test_cli_help() {
    loadmeter()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Network load generator"));
}

#[test]
fn test_cli_version() {
    loadmeter()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("loadmeter"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["run", "burst", "rate", "throughput", "ping", "jitter", "device-info"] {
        loadmeter().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_device_info_json() {
    loadmeter()
        .args(["device-info", "--json"])
        .assert()
        .success()
        .stdout(predicates::str::contains("\"ram_total_bytes\""))
        .stdout(predicates::str::contains("\"cpu_cores\""));
}

#[test]
fn test_unknown_probe_rejected() {
    loadmeter()
        .args(["burst", "--probe", "carrier-pigeon"])
        .assert()
        .failure();
}

#[test]
fn test_explicit_config_must_exist() {
    loadmeter()
        .args(["--config", "/nonexistent/explicit.toml", "device-info"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("failed to read config file"));
}

#[test]
fn test_broken_env_config_is_reported() {
    loadmeter()
        .env("LOADMETER_CONFIG", "/nonexistent/from-env.toml")
        .arg("device-info")
        .assert()
        .failure()
        .stderr(predicates::str::contains("$LOADMETER_CONFIG"))
        .stderr(predicates::str::contains("failed to read config file"));
}

#[test]
fn test_run_with_defaults_writes_config_and_device_info() {
    let dir = tempfile::TempDir::new().unwrap();
    loadmeter()
        .arg("run")
        .arg("--results-dir")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicates::str::contains("configInfo"))
        .stdout(predicates::str::contains("deviceInfo"));

    let mut written: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    written.sort();
    assert_eq!(written.len(), 2);
    assert!(written[0].ends_with("-configInfo.jsonl"));
    assert!(written[1].ends_with("-deviceInfo.jsonl"));
}
