//! CLI coverage for the offline subcommands: init-db, cleanup, runs,
//! events, and the JSON error payload contract. Network-bound subcommands
//! are exercised at the library level instead.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

use dossier::store::Store;

fn run_cli(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dossier"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("command runs")
}

fn run_json(dir: &Path, args: &[&str]) -> Value {
    let output = run_cli(dir, args);
    assert!(
        output.status.success(),
        "command failed: args={args:?}\nstdout={}\nstderr={}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).expect("json stdout")
}

/// Error payloads share stderr with log lines; the payload is the last one.
fn stderr_payload(output: &Output) -> Value {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let line = stderr
        .lines()
        .rev()
        .find(|l| l.trim_start().starts_with('{'))
        .expect("json error payload on stderr");
    serde_json::from_str(line).expect("payload parses")
}

fn write_settings(dir: &Path) -> String {
    let path = dir.join("settings.yaml");
    let yaml = format!(
        "db_path: {}\nevidence_root: {}\n",
        dir.join("data/dossier.db").display(),
        dir.join("data/evidence").display()
    );
    fs::write(&path, yaml).expect("settings yaml");
    path.display().to_string()
}

#[test]
fn init_db_creates_schema_and_reports_paths() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = write_settings(temp.path());

    let out = run_json(temp.path(), &["--settings", &settings, "init-db"]);
    assert_eq!(out["status"], "ok");
    assert!(temp.path().join("data/dossier.db").exists());

    // Fresh database: no runs, no events, empty stdout line stream.
    for sub in ["runs", "events"] {
        let output = run_cli(temp.path(), &["--settings", &settings, sub, "--company", "jnj"]);
        assert!(output.status.success());
        assert!(output.stdout.is_empty());
    }
}

#[test]
fn cleanup_subcommand_reports_hidden_assets() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = write_settings(temp.path());
    run_json(temp.path(), &["--settings", &settings, "init-db"]);

    {
        let store = Store::open(&temp.path().join("data/dossier.db")).expect("open");
        store.ensure_company("jnj", "Johnson & Johnson").expect("company");
        store
            .upsert_asset("jnj", "Hemolytic Anemia", None, None, true)
            .expect("implausible asset");
        store.upsert_asset("jnj", "TAR-200", None, None, true).expect("real asset");
    }

    let out = run_json(
        temp.path(),
        &["--settings", &settings, "cleanup", "--company", "jnj"],
    );
    assert_eq!(out["status"], "ok");
    assert_eq!(out["assets_seen"], 2);
    assert_eq!(out["hidden"], 1);
    assert_eq!(out["merged"], 0);
}

#[test]
fn unknown_company_fails_with_coded_payload() {
    let temp = tempfile::tempdir().expect("tempdir");
    let settings = write_settings(temp.path());
    let companies = temp.path().join("companies.yaml");
    fs::write(&companies, "companies:\n  - company_id: jnj\n    name: Johnson & Johnson\n")
        .expect("companies yaml");

    let output = run_cli(
        temp.path(),
        &[
            "--settings",
            &settings,
            "--companies",
            &companies.display().to_string(),
            "ingest-pipeline",
            "--company",
            "nope",
        ],
    );
    assert!(!output.status.success());
    let payload = stderr_payload(&output);
    assert_eq!(payload["error"]["code"], "unknown_company");
}

#[test]
fn missing_settings_file_is_a_config_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = run_cli(
        temp.path(),
        &["--settings", "no-such-settings.yaml", "init-db"],
    );
    assert!(!output.status.success());
    let payload = stderr_payload(&output);
    assert_eq!(payload["error"]["code"], "config_error");
}
