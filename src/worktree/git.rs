//! Thin wrapper around the `git` binary.
//!
//! Every repository mutation in this crate goes through [`GitClient`]: one
//! subprocess per command, working directory set per call, UTF-8 capture of
//! both streams. Commits and merges run with a fixed swarm identity so
//! history stays attributable regardless of host config.

use std::path::Path;
use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to execute git: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("git {args} failed: {stderr}")]
    Command { args: String, stderr: String },
}

impl GitError {
    /// Combined stderr/stdout text of a failed command, for error-message
    /// sniffing (git reports some conditions only as prose).
    pub fn message(&self) -> &str {
        match self {
            Self::Command { stderr, .. } => stderr,
            Self::Spawn(_) => "",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GitClient;

impl GitClient {
    pub fn new() -> Self {
        Self
    }

    /// Run `git <args>` in `cwd`; Ok(stdout) on zero exit, Err carrying
    /// stderr (falling back to stdout, which some subcommands use for
    /// diagnostics) otherwise.
    pub fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        tracing::debug!(cwd = %cwd.display(), ?args, "git");
        let output = Command::new("git")
            .arg("-C")
            .arg(cwd)
            .args(args)
            .env("GIT_AUTHOR_NAME", "Swarm")
            .env("GIT_AUTHOR_EMAIL", "swarm@local")
            .env("GIT_COMMITTER_NAME", "Swarm")
            .env("GIT_COMMITTER_EMAIL", "swarm@local")
            .output()?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            Err(GitError::Command {
                args: args.join(" "),
                stderr: if stderr.trim().is_empty() { stdout } else { stderr },
            })
        }
    }

    /// Run a command whose failure is acceptable; returns whether it
    /// succeeded.
    pub fn try_run(&self, cwd: &Path, args: &[&str]) -> bool {
        self.run(cwd, args).is_ok()
    }

    // -- queries ------------------------------------------------------------

    pub fn is_repository(&self, cwd: &Path) -> bool {
        self.try_run(cwd, &["rev-parse", "--git-dir"])
    }

    pub fn has_commits(&self, cwd: &Path) -> bool {
        self.try_run(cwd, &["rev-parse", "--verify", "HEAD"])
    }

    pub fn current_branch(&self, cwd: &Path) -> Option<String> {
        let out = self.run(cwd, &["rev-parse", "--abbrev-ref", "HEAD"]).ok()?;
        let branch = out.trim().to_string();
        if branch.is_empty() || branch == "HEAD" {
            None
        } else {
            Some(branch)
        }
    }

    pub fn branch_exists(&self, cwd: &Path, branch: &str) -> bool {
        self.try_run(
            cwd,
            &["rev-parse", "--verify", &format!("refs/heads/{branch}")],
        )
    }

    /// Short name of the remote default branch, if a remote HEAD is known.
    pub fn remote_default_branch(&self, cwd: &Path) -> Option<String> {
        let out = self
            .run(cwd, &["symbolic-ref", "refs/remotes/origin/HEAD", "--short"])
            .ok()?;
        out.trim().rsplit('/').next().map(|s| s.to_string())
    }

    /// `true` while a merge is in flight (MERGE_HEAD exists).
    pub fn merge_in_progress(&self, cwd: &Path) -> bool {
        self.try_run(cwd, &["rev-parse", "-q", "--verify", "MERGE_HEAD"])
    }

    /// Paths with unresolved merge entries.
    pub fn unmerged_files(&self, cwd: &Path) -> Vec<String> {
        match self.run(cwd, &["diff", "--name-only", "--diff-filter=U"]) {
            Ok(out) => out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    /// `status --porcelain`; empty string means a clean tree.
    pub fn status_porcelain(&self, cwd: &Path) -> Result<String, GitError> {
        self.run(cwd, &["status", "--porcelain"])
    }

    pub fn is_clean(&self, cwd: &Path) -> bool {
        self.status_porcelain(cwd)
            .map(|s| s.trim().is_empty())
            .unwrap_or(false)
    }
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new()
    }
}
