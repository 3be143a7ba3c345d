use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("host-fault-agent").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(concat!(
            "host-fault-agent ",
            env!("CARGO_PKG_VERSION")
        )));
}

#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("host-fault-agent").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("memfill"))
        .stdout(predicate::str::contains("describe"));
}

#[test]
fn test_cli_describe_lists_catalogue() {
    let mut cmd = Command::cargo_bin("host-fault-agent").unwrap();
    let output = cmd.arg("describe").output().unwrap();
    assert!(output.status.success());

    let descriptions: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let ids: Vec<&str> = descriptions
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"com.steadybit.extension_host.stress-cpu"));
    assert!(ids.contains(&"com.steadybit.extension_host.network-nic-flap"));
    assert!(ids.contains(&"com.steadybit.extension_host.shutdown"));
}

#[test]
fn test_cli_memfill_rejects_unknown_mode() {
    let mut cmd = Command::cargo_bin("host-fault-agent").unwrap();
    cmd.args([
        "memfill", "--mode", "greedy", "--unit", "percent", "--size", "10", "--duration", "1",
    ])
    .assert()
    .failure()
    .stderr(predicate::str::contains("invalid value 'greedy'"));
}

#[test]
fn test_cli_memfill_absolute_finishes() {
    let mut cmd = Command::cargo_bin("host-fault-agent").unwrap();
    cmd.args([
        "memfill", "--mode", "absolute", "--unit", "megabyte", "--size", "4", "--duration", "1",
    ])
    .timeout(std::time::Duration::from_secs(20))
    .assert()
    .success();
}

#[test]
fn test_cli_invalid_config_file() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("agent.toml");
    std::fs::write(&path, "[http]\nport = 8085\nhealth_port = 8085\n").unwrap();

    let mut cmd = Command::cargo_bin("host-fault-agent").unwrap();
    cmd.arg("--config")
        .arg(&path)
        .arg("describe")
        .assert()
        .failure()
        .stderr(predicate::str::contains("must differ"));
}
