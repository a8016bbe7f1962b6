//! End-to-end CLI tests for the privacy-scanner binary.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;

fn scanner() -> Command {
    let mut cmd = Command::cargo_bin("privacy-scanner").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &Path, storage: &Path) -> std::path::PathBuf {
    let config = dir.join("config.toml");
    std::fs::write(
        &config,
        format!("storage_path = \"{}\"\nuncloak_cnames = true\n", storage.display()),
    )
    .unwrap();
    config
}

fn write_datasets(storage: &Path) {
    std::fs::write(storage.join("public_suffix_list.dat"), "// ===BEGIN ICANN DOMAINS===\ncom\nnet\n").unwrap();
    std::fs::write(
        storage.join("disconnect-tp-services.json"),
        r#"{"categories":{"Analytics":[{"Acme Analytics":{"acme.net":["acme.net"]}}]}}"#,
    )
    .unwrap();
    let easylist = storage.join("easylist");
    std::fs::create_dir_all(&easylist).unwrap();
    for name in ["easylist.txt", "easyprivacy.txt", "fanboy-annoyance.txt"] {
        std::fs::write(easylist.join(name), "||acme.net^\n").unwrap();
    }
    std::fs::create_dir_all(storage.join("tracker-radar")).unwrap();
}

#[test]
fn test_binary_help_displays_usage() {
    scanner()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("update-datasets"))
        .stdout(predicate::str::contains("scan"));
}

#[test]
fn test_binary_version_displays_version() {
    scanner()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("privacy-scanner"));
}

#[test]
fn test_binary_invalid_flag_returns_error() {
    scanner()
        .arg("--invalid-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("error"));
}

#[test]
fn test_binary_invalid_config_reports_line() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("config.toml");
    std::fs::write(&config, "uncloak_cnames = maybe\n").unwrap();
    let trace = dir.path().join("trace.json");
    std::fs::write(&trace, "{}").unwrap();

    scanner()
        .arg("--config")
        .arg(&config)
        .args(["scan", "--offline", "--trace"])
        .arg(&trace)
        .assert()
        .failure()
        .stderr(predicate::str::contains("line 1"));
}

#[test]
fn test_binary_scan_without_datasets_suggests_update() {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().join("data");
    std::fs::create_dir_all(&storage).unwrap();
    let config = write_config(dir.path(), &storage);
    let trace = dir.path().join("trace.json");
    std::fs::write(
        &trace,
        r#"{"site_url":"https://shop.com/","final_url":"https://shop.com/","requests":[],"cookies":[]}"#,
    )
    .unwrap();

    scanner()
        .arg("--config")
        .arg(&config)
        .args(["-q", "scan", "--offline", "--trace"])
        .arg(&trace)
        .assert()
        .failure()
        .stderr(predicate::str::contains("update-datasets"));
}

#[test]
fn test_binary_offline_scan_writes_result() {
    let dir = tempfile::tempdir().unwrap();
    let storage = dir.path().join("data");
    std::fs::create_dir_all(&storage).unwrap();
    write_datasets(&storage);
    let config = write_config(dir.path(), &storage);

    let trace = dir.path().join("trace.json");
    std::fs::write(
        &trace,
        r#"{
            "site_url": "https://shop.com/",
            "final_url": "https://shop.com/",
            "requests": [
                {"url": "https://shop.com/", "document_url": "https://shop.com/"},
                {"url": "https://px.acme.net/t.gif", "document_url": "https://shop.com/"}
            ],
            "cookies": [{"domain": ".acme.net", "name": "uid"}]
        }"#,
    )
    .unwrap();
    let policy = dir.path().join("policy.txt");
    std::fs::write(&policy, "We work with Acme Analytics.").unwrap();
    let output = dir.path().join("result.json");

    scanner()
        .arg("--config")
        .arg(&config)
        .args(["-q", "scan", "--offline", "--trace"])
        .arg(&trace)
        .arg("--policy")
        .arg(&policy)
        .arg("--output")
        .arg(&output)
        .assert()
        .success();

    let result: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
    assert_eq!(result["site_url"], "https://shop.com/");
    assert_eq!(result["third_parties"]["fqdns"], serde_json::json!(["px.acme.net"]));
    assert_eq!(result["tracking"]["num_tracker_cookies"], 1);
    assert_eq!(result["cookies"][0]["name"], "uid");
    assert!(result["privacy_policy_analysis"]["mentioned"]["Acme Analytics"].is_array());
}
