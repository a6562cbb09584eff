//! Test helpers shared across unit and integration tests.

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

/// Scratch directory for a test workspace; removed on drop.
pub fn temp_workspace() -> TempDir {
    tempfile::Builder::new()
        .prefix("codeswarm-test-")
        .tempdir()
        .expect("failed to create temp dir")
}

/// Initialize a git repo with identity configured and an initial commit so
/// HEAD exists.
pub fn init_git_repo(dir: &Path) {
    let output = Command::new("git")
        .args(["init", "-b", "main"])
        .current_dir(dir)
        .output()
        .expect("git init failed");
    if !output.status.success() {
        // Older git without -b support.
        let fallback = Command::new("git")
            .args(["init"])
            .current_dir(dir)
            .output()
            .expect("git init failed");
        assert!(
            fallback.status.success(),
            "git init failed: {}",
            String::from_utf8_lossy(&fallback.stderr)
        );
    }

    let _ = Command::new("git")
        .args(["config", "user.email", "test@swarm.local"])
        .current_dir(dir)
        .output();
    let _ = Command::new("git")
        .args(["config", "user.name", "Swarm Test"])
        .current_dir(dir)
        .output();

    std::fs::write(dir.join("README.md"), "# Test Repo\n").expect("write failed");
    commit_all(dir, "initial commit");
}

/// Stage everything and commit.
pub fn commit_all(dir: &Path, message: &str) {
    let _ = Command::new("git")
        .args(["add", "-A"])
        .current_dir(dir)
        .output();
    let output = Command::new("git")
        .args(["commit", "-m", message])
        .env("GIT_AUTHOR_NAME", "Swarm Test")
        .env("GIT_AUTHOR_EMAIL", "test@swarm.local")
        .env("GIT_COMMITTER_NAME", "Swarm Test")
        .env("GIT_COMMITTER_EMAIL", "test@swarm.local")
        .current_dir(dir)
        .output()
        .expect("git commit failed");
    assert!(
        output.status.success(),
        "git commit failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Current one-line log subjects, newest first.
pub fn log_subjects(dir: &Path) -> Vec<String> {
    let output = Command::new("git")
        .args(["log", "--format=%s"])
        .current_dir(dir)
        .output()
        .expect("git log failed");
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}
