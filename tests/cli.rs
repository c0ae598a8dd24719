use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn notebook_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("notebook");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    // The local provider is never contacted by these tests.
    let config_content = format!(
        r#"[db]
path = "{}/data/notebook.sqlite"

[chunking]
target_chars = 500
overlap_chars = 50

[providers.local]
kind = "ollama"
base_url = "http://127.0.0.1:9"
"#,
        root.display()
    );

    let config_path = config_dir.join("notebook.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_notebook(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = notebook_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run notebook binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn create_notebook(config_path: &Path, title: &str) -> String {
    let (stdout, stderr, success) = run_notebook(config_path, &["notebook", "create", title]);
    assert!(success, "create failed: {}", stderr);
    stdout.trim().to_string()
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_notebook(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/notebook.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_notebook(&config_path, &["init"]);
    assert!(success1, "First init failed");
    let (_, _, success2) = run_notebook(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_notebook_lifecycle() {
    let (_tmp, config_path) = setup_test_env();
    run_notebook(&config_path, &["init"]);

    let id = create_notebook(&config_path, "Soil research");
    assert!(!id.is_empty());

    let (stdout, _, success) = run_notebook(&config_path, &["notebook", "list"]);
    assert!(success);
    assert!(stdout.contains(&id));
    assert!(stdout.contains("Soil research"));

    let (stdout, _, success) = run_notebook(&config_path, &["notebook", "show", &id]);
    assert!(success);
    assert!(stdout.contains("\"title\": \"Soil research\""));
    assert!(stdout.contains("sources: 0  notes: 0  conversations: 0"));

    let (_, _, success) = run_notebook(&config_path, &["notebook", "delete", &id]);
    assert!(success);
    let (_, stderr, success) = run_notebook(&config_path, &["notebook", "show", &id]);
    assert!(!success);
    assert!(stderr.contains("not found"), "stderr: {}", stderr);
}

#[test]
fn test_empty_notebook_title_rejected() {
    let (_tmp, config_path) = setup_test_env();
    run_notebook(&config_path, &["init"]);

    let (_, _, success) = run_notebook(&config_path, &["notebook", "create", "   "]);
    assert!(!success);
}

#[test]
fn test_notes_and_conversations() {
    let (_tmp, config_path) = setup_test_env();
    run_notebook(&config_path, &["init"]);
    let id = create_notebook(&config_path, "Moons");

    let (note_id, _, success) = run_notebook(
        &config_path,
        &["note", "add", &id, "Europa has a subsurface ocean", "--title", "Europa"],
    );
    assert!(success);
    let (stdout, _, _) = run_notebook(&config_path, &["note", "list", &id]);
    assert!(stdout.contains("[human] Europa"));

    let (_, _, success) = run_notebook(&config_path, &["note", "delete", note_id.trim()]);
    assert!(success);
    let (stdout, _, _) = run_notebook(&config_path, &["note", "list", &id]);
    assert!(stdout.trim().is_empty());

    let (conversation, _, success) =
        run_notebook(&config_path, &["conversation", "new", &id, "--title", "Oceans"]);
    assert!(success);
    let (stdout, _, _) = run_notebook(&config_path, &["conversation", "list", &id]);
    assert!(stdout.contains(conversation.trim()));
    assert!(stdout.contains("Oceans"));
    let (stdout, _, success) =
        run_notebook(&config_path, &["conversation", "show", conversation.trim()]);
    assert!(success);
    assert!(stdout.starts_with("# Oceans"));
}

#[test]
fn test_source_without_embedding_role_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_notebook(&config_path, &["init"]);
    let id = create_notebook(&config_path, "No models");

    let (_, stderr, success) = run_notebook(
        &config_path,
        &["source", "add", &id, "--text", "Some pasted text.", "--title", "Pasted"],
    );
    assert!(!success);
    assert!(stderr.contains("embedding"), "stderr: {}", stderr);

    let (stdout, _, _) = run_notebook(&config_path, &["source", "list", &id]);
    assert!(stdout.starts_with('!'), "stdout: {}", stdout);
    assert!(stdout.contains("failed"));
    assert!(stdout.contains("Pasted"));
}

#[test]
fn test_source_add_needs_one_input() {
    let (_tmp, config_path) = setup_test_env();
    run_notebook(&config_path, &["init"]);
    let id = create_notebook(&config_path, "Inputs");

    let (_, _, success) = run_notebook(&config_path, &["source", "add", &id]);
    assert!(!success);
    let (_, _, success) = run_notebook(
        &config_path,
        &["source", "add", &id, "--url", "ftp://example.com/a.txt"],
    );
    assert!(!success);
    let (stdout, _, _) = run_notebook(&config_path, &["source", "list", &id]);
    assert!(stdout.trim().is_empty());
}

#[test]
fn test_role_binding_persists() {
    let (_tmp, config_path) = setup_test_env();
    run_notebook(&config_path, &["init"]);

    let (_, stderr, success) = run_notebook(
        &config_path,
        &["provider", "set-role", "chat", "local", "llama3.2", "--temperature", "0.2"],
    );
    assert!(success, "set-role failed: {}", stderr);

    let (stdout, _, _) = run_notebook(&config_path, &["provider", "roles"]);
    assert!(stdout.contains("local:llama3.2"), "stdout: {}", stdout);
    assert!(stdout.contains("temperature=0.2"));

    let (_, _, success) = run_notebook(&config_path, &["provider", "reset-role", "chat"]);
    assert!(success);
    let (stdout, _, _) = run_notebook(&config_path, &["provider", "roles"]);
    assert!(!stdout.contains("llama3.2"));
}

#[test]
fn test_role_binding_rejects_unknown_names() {
    let (_tmp, config_path) = setup_test_env();
    run_notebook(&config_path, &["init"]);

    let (_, stderr, success) =
        run_notebook(&config_path, &["provider", "set-role", "poet", "local", "m"]);
    assert!(!success);
    assert!(stderr.contains("Unknown role"));

    let (_, _, success) =
        run_notebook(&config_path, &["provider", "set-role", "chat", "missing", "m"]);
    assert!(!success);
}

#[test]
fn test_provider_list() {
    let (_tmp, config_path) = setup_test_env();
    run_notebook(&config_path, &["init"]);

    let (stdout, _, success) = run_notebook(&config_path, &["provider", "list"]);
    assert!(success);
    assert!(stdout.starts_with("local"));
}
