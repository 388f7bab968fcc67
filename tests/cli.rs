//! Tests of the `rv` binary that need no network access.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/rv.sqlite"

[embedding]
provider = "ollama"
model = "nomic-embed-text"
dims = 768
url = "http://127.0.0.1:9"

[generation]
provider = "ollama"
model = "llama3"
url = "http://127.0.0.1:9"
"#,
        root.display()
    );

    let config_path = config_dir.join("rv.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_rv(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_rv"))
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to run rv binary");

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

#[test]
fn test_init_creates_database_and_is_idempotent() {
    let (tmp, config) = setup_test_env();

    let (stdout, stderr, ok) = run_rv(&config, &["init"]);
    assert!(ok, "init failed: {}", stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/rv.sqlite").exists());

    let (_, stderr, ok) = run_rv(&config, &["init"]);
    assert!(ok, "second init failed: {}", stderr);
}

#[test]
fn test_project_list_empty() {
    let (_tmp, config) = setup_test_env();
    run_rv(&config, &["init"]);

    let (stdout, stderr, ok) = run_rv(&config, &["project", "list", "--user", "u1"]);
    assert!(ok, "list failed: {}", stderr);
    assert!(stdout.contains("no projects"));
}

#[test]
fn test_create_with_malformed_url_fails() {
    let (_tmp, config) = setup_test_env();
    run_rv(&config, &["init"]);

    let (_, stderr, ok) = run_rv(
        &config,
        &["project", "create", "definitely not a url", "--name", "x"],
    );
    assert!(!ok);
    assert!(stderr.contains("invalid input"), "stderr: {}", stderr);
}

#[test]
fn test_ask_unknown_project_fails() {
    let (_tmp, config) = setup_test_env();
    run_rv(&config, &["init"]);

    let (_, stderr, ok) = run_rv(&config, &["ask", "missing-project", "where is main?"]);
    assert!(!ok);
    assert!(stderr.contains("not found"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, ok) = run_rv(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!ok);
    assert!(stderr.contains("Failed to read config file"));
}
