use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn bin(state: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::Command::cargo_bin("recon").expect("binary");
    cmd.env("RECON_STATE_DIR", state)
        .env_remove("RECON_CONFIG")
        .env_remove("RECON_WALLETS")
        .env_remove("RECON_BUDGET_DAILY")
        .env_remove("RECON_WEBHOOK_URL")
        .env("RUST_LOG", "warn");
    cmd
}

#[test]
fn config_schema_is_json() {
    let tmp = tempdir().expect("tmpdir");
    let out = bin(tmp.path())
        .arg("config-schema")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let schema: serde_json::Value = serde_json::from_slice(&out).expect("schema json");
    assert!(schema["properties"]["budget"].is_object());
}

#[test]
fn once_without_targets_is_skipped() {
    let tmp = tempdir().expect("tmpdir");
    bin(tmp.path())
        .arg("once")
        .assert()
        .success()
        .stdout(predicate::str::contains("no_targets"));
}

#[test]
fn once_with_wallet_runs_and_status_reports_cursor() {
    let tmp = tempdir().expect("tmpdir");
    let config = tmp.path().join("recon.toml");
    fs::write(
        &config,
        "[targets]\nwallet_recon = [\"0xabc\"]\n\n[worker]\nbackoff_ms = 1\n",
    )
    .expect("write config");

    bin(tmp.path())
        .arg("--config")
        .arg(&config)
        .arg("once")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\":\"success\""));

    let out = bin(tmp.path())
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let status: serde_json::Value = serde_json::from_slice(&out).expect("status json");
    assert_eq!(status["store"]["scratch"], 1);
    assert_eq!(status["cursors"][0]["target"], "0xabc");
    assert_eq!(status["budget"]["reserved_usd"], 0.0);
}

#[test]
fn unknown_artifact_fails() {
    let tmp = tempdir().expect("tmpdir");
    bin(tmp.path())
        .args(["provenance", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}
