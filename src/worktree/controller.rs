use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::bus::{event_types, EventBus};
use crate::lock::GitLock;

use super::conflict::{resolve_all, ConflictInfo, ResolutionOutcome};
use super::git::{GitClient, GitError};
use super::links::link_shared_dependencies;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Directory under the project root holding all worker worktrees.
pub const WORKTREE_ROOT_DIR: &str = ".swarm-worktrees";

/// Prefix of every worker branch.
pub const BRANCH_PREFIX: &str = "swarm/worker-";

/// Deterministic branch name for a worker.
pub fn branch_for_worker(worker_id: &str) -> String {
    format!("{BRANCH_PREFIX}{worker_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

/// One edit applied atomically against a worktree. Paths resolve relative
/// to the worktree root unless absolute.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChange {
    pub file_path: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub content: Option<String>,
}

/// Result of flushing a change batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitOutcome {
    pub committed: bool,
    pub files_changed: usize,
    pub message: Option<String>,
}

/// Result of merging a worker branch back to main.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub merged: bool,
    pub auto_resolved: bool,
    pub needs_human_review: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictInfo>,
    pub message: String,
}

/// Per-worker workspace record (invariant W1: `worktree_path` unique across
/// live workspaces, keyed by worker id as the directory name).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRecord {
    pub worker_id: String,
    pub branch_name: String,
    pub worktree_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Git(#[from] GitError),
    #[error("failed to create worktree: {0}")]
    Create(String),
    #[error("no workspace registered for worker {0}")]
    WorkspaceMissing(String),
    #[error("branch {0} does not exist")]
    BranchMissing(String),
    #[error(
        "repository is in an unrecoverable merge state: {0}; \
         reset the main checkout manually before resuming merges"
    )]
    RepositoryUnrecoverable(String),
}

/// Stash bookkeeping threaded through a merge attempt so the `finally`
/// sweep can restore exactly what the happy path did not.
#[derive(Default)]
struct MergeCleanup {
    stash_marker: Option<String>,
}

// ---------------------------------------------------------------------------
// WorktreeController
// ---------------------------------------------------------------------------

/// Owns every worker workspace on top of one shared repository, and the
/// serial merge discipline back to the main branch.
///
/// Thread-safe; held in an `Arc` and shared between the coordinator and
/// workers. All main-branch mutation happens inside [`merge_workspace`]
/// (Self::merge_workspace) under the git mutex.
pub struct WorktreeController {
    project_path: PathBuf,
    worktree_root: PathBuf,
    main_branch: String,
    git: GitClient,
    lock: Arc<GitLock>,
    bus: Arc<EventBus>,
    blueprint_id: Option<String>,
    workspaces: DashMap<String, WorkspaceRecord>,
}

impl WorktreeController {
    /// Open the controller over `project_path`: make sure the repository
    /// exists with at least one commit, detect the main branch, ignore the
    /// worktree root, and reconstitute workspaces already on disk.
    pub fn open(
        project_path: impl Into<PathBuf>,
        lock: Arc<GitLock>,
        bus: Arc<EventBus>,
        blueprint_id: Option<String>,
    ) -> Result<Self, WorktreeError> {
        let project_path: PathBuf = project_path.into();
        let git = GitClient::new();

        if !git.is_repository(&project_path) {
            std::fs::create_dir_all(&project_path)?;
            if !git.try_run(&project_path, &["init", "-b", "main"]) {
                // Older git without `init -b`.
                git.run(&project_path, &["init"])?;
            }
        }
        if !git.has_commits(&project_path) {
            git.run(
                &project_path,
                &["commit", "--allow-empty", "-m", "[Swarm] Initial commit"],
            )?;
        }

        let main_branch = detect_main_branch(&git, &project_path);
        ensure_gitignore_entry(&project_path)?;

        let controller = Self {
            worktree_root: project_path.join(WORKTREE_ROOT_DIR),
            project_path,
            main_branch,
            git,
            lock,
            bus,
            blueprint_id,
            workspaces: DashMap::new(),
        };
        let recovered = controller.rescan();
        if !recovered.is_empty() {
            tracing::info!("recovered {} existing workspace(s) from disk", recovered.len());
        }
        Ok(controller)
    }

    pub fn main_branch(&self) -> &str {
        &self.main_branch
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn workspace(&self, worker_id: &str) -> Option<WorkspaceRecord> {
        self.workspaces.get(worker_id).map(|r| r.clone())
    }

    pub fn list_workspaces(&self) -> Vec<WorkspaceRecord> {
        self.workspaces.iter().map(|r| r.clone()).collect()
    }

    /// Rebuild the in-memory registry from the worktree root. A directory
    /// counts only if it still looks like a linked worktree (a `.git`
    /// file, not a directory) and its branch still exists.
    pub fn rescan(&self) -> Vec<String> {
        let mut recovered = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.worktree_root) else {
            return recovered;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let worker_id = entry.file_name().to_string_lossy().to_string();
            let branch = branch_for_worker(&worker_id);
            if path.join(".git").is_file() && self.git.branch_exists(&self.project_path, &branch) {
                self.workspaces.insert(
                    worker_id.clone(),
                    WorkspaceRecord {
                        worker_id: worker_id.clone(),
                        branch_name: branch,
                        worktree_path: path,
                        created_at: Utc::now(),
                    },
                );
                recovered.push(worker_id);
            }
        }
        recovered
    }

    // -----------------------------------------------------------------------
    // Workspace lifecycle
    // -----------------------------------------------------------------------

    /// Create a fresh workspace for `worker_id`: its own worktree directory
    /// and a new branch off main. Any stale workspace under the same id is
    /// destroyed first.
    pub async fn create_workspace(
        &self,
        worker_id: &str,
    ) -> Result<WorkspaceRecord, WorktreeError> {
        // Pulling and branching read and mutate the main checkout, so
        // creation serializes behind the same mutex as merges.
        let guard = self.lock.acquire().await;

        if self.workspaces.contains_key(worker_id)
            || self.worktree_root.join(worker_id).exists()
        {
            self.destroy_workspace(worker_id)?;
        }

        // Freshen main before branching. No remote or a diverged remote is
        // fine; the worktree just branches from local main.
        if self
            .git
            .run(&self.project_path, &["pull", "--rebase"])
            .is_err()
        {
            self.git.try_run(&self.project_path, &["rebase", "--abort"]);
            tracing::warn!("pull --rebase failed; branching from local {}", self.main_branch);
        } else {
            self.bus.emit(
                event_types::BRANCH_SYNCED,
                self.blueprint_id.clone(),
                serde_json::json!({
                    "workerId": worker_id,
                    "branchName": &self.main_branch,
                }),
            );
        }

        std::fs::create_dir_all(&self.worktree_root)?;
        let branch = branch_for_worker(worker_id);
        if self.git.branch_exists(&self.project_path, &branch) {
            self.git.try_run(&self.project_path, &["branch", "-D", &branch]);
        }

        let target = self.worktree_root.join(worker_id);
        let target_str = target.to_string_lossy().to_string();
        self.git
            .run(
                &self.project_path,
                &["worktree", "add", "-b", &branch, &target_str, &self.main_branch],
            )
            .map_err(|e| WorktreeError::Create(e.to_string()))?;

        // Register before linking so teardown stays safe even if linking
        // goes sideways.
        let record = WorkspaceRecord {
            worker_id: worker_id.to_string(),
            branch_name: branch.clone(),
            worktree_path: target.clone(),
            created_at: Utc::now(),
        };
        self.workspaces.insert(worker_id.to_string(), record.clone());
        // Linking only touches the new worktree; no need to hold the lock.
        drop(guard);

        let warnings = link_shared_dependencies(&self.project_path, &target);
        for warning in &warnings {
            tracing::warn!("workspace {worker_id}: {warning}");
        }

        self.bus.emit(
            event_types::BRANCH_CREATED,
            self.blueprint_id.clone(),
            serde_json::json!({
                "workerId": worker_id,
                "branchName": branch,
                "worktreePath": target_str,
            }),
        );
        Ok(record)
    }

    /// Remove the worker's worktree, branch, and registry entry. Safe to
    /// call on a partially torn-down workspace.
    pub fn destroy_workspace(&self, worker_id: &str) -> Result<(), WorktreeError> {
        let record = self.workspaces.remove(worker_id).map(|(_, r)| r);
        let path = record
            .as_ref()
            .map(|r| r.worktree_path.clone())
            .unwrap_or_else(|| self.worktree_root.join(worker_id));
        let branch = record
            .as_ref()
            .map(|r| r.branch_name.clone())
            .unwrap_or_else(|| branch_for_worker(worker_id));

        let path_str = path.to_string_lossy().to_string();
        self.git.try_run(
            &self.project_path,
            &["worktree", "remove", "--force", &path_str],
        );
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        self.git.try_run(&self.project_path, &["worktree", "prune"]);
        self.git.try_run(&self.project_path, &["branch", "-D", &branch]);

        self.bus.emit(
            event_types::BRANCH_DELETED,
            self.blueprint_id.clone(),
            serde_json::json!({
                "workerId": worker_id,
                "branchName": branch,
            }),
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Apply & commit
    // -----------------------------------------------------------------------

    /// Apply an ordered batch of changes inside the worker's worktree and
    /// commit them to its branch. A clean tree after applying means there
    /// is nothing new and no commit is produced.
    pub fn apply_changes(
        &self,
        worker_id: &str,
        changes: &[FileChange],
        message: &str,
    ) -> Result<CommitOutcome, WorktreeError> {
        let record = self
            .workspace(worker_id)
            .ok_or_else(|| WorktreeError::WorkspaceMissing(worker_id.to_string()))?;
        let worktree = &record.worktree_path;

        for change in changes {
            let (absolute, relative) = resolve_change_path(worktree, &change.file_path);
            match change.kind {
                ChangeKind::Create | ChangeKind::Modify => {
                    if let Some(parent) = absolute.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&absolute, change.content.as_deref().unwrap_or(""))?;
                    self.git.run(worktree, &["add", &relative])?;
                }
                ChangeKind::Delete => {
                    if !self
                        .git
                        .try_run(worktree, &["rm", "-f", "--ignore-unmatch", &relative])
                        && absolute.exists()
                    {
                        std::fs::remove_file(&absolute)?;
                    }
                }
            }
        }

        if self.git.is_clean(worktree) {
            return Ok(CommitOutcome {
                committed: false,
                files_changed: 0,
                message: None,
            });
        }

        let subject = format_commit_subject(message, worker_id, changes.len());
        match self.git.run(worktree, &["commit", "-m", &subject]) {
            Ok(_) => {}
            Err(e) if e.message().contains("nothing to commit") => {
                return Ok(CommitOutcome {
                    committed: false,
                    files_changed: 0,
                    message: None,
                });
            }
            Err(e) => return Err(e.into()),
        }

        self.bus.emit(
            event_types::COMMIT_CREATED,
            self.blueprint_id.clone(),
            serde_json::json!({
                "workerId": worker_id,
                "branchName": &record.branch_name,
                "message": &subject,
                "filesChanged": changes.len(),
            }),
        );
        Ok(CommitOutcome {
            committed: true,
            files_changed: changes.len(),
            message: Some(subject),
        })
    }

    // -----------------------------------------------------------------------
    // Merge
    // -----------------------------------------------------------------------

    /// Merge the worker's branch into main, serialized behind the git
    /// mutex. On success (including auto-resolved conflicts) the workspace
    /// is destroyed. On an unresolvable conflict the merge is aborted, the
    /// repository left clean, and the outcome flagged for human review.
    pub async fn merge_workspace(&self, worker_id: &str) -> Result<MergeOutcome, WorktreeError> {
        let _guard = self.lock.acquire().await;
        let mut cleanup = MergeCleanup::default();
        let result = self.merge_locked(worker_id, &mut cleanup);
        self.merge_finally(&mut cleanup);
        result
    }

    fn merge_locked(
        &self,
        worker_id: &str,
        cleanup: &mut MergeCleanup,
    ) -> Result<MergeOutcome, WorktreeError> {
        let branch = branch_for_worker(worker_id);
        if !self.git.branch_exists(&self.project_path, &branch) {
            return Err(WorktreeError::BranchMissing(branch));
        }

        // Step onto main; a wedged index from an earlier failure may block
        // the checkout, in which case sweep first and try again.
        if self
            .git
            .run(&self.project_path, &["checkout", &self.main_branch])
            .is_err()
        {
            self.sweep_merge_residue()?;
            self.git
                .run(&self.project_path, &["checkout", &self.main_branch])?;
        }
        self.sweep_merge_residue()?;

        // Stash guard: anything sitting on main (tracked or untracked) is
        // preserved around the merge.
        if !self.git.is_clean(&self.project_path) {
            let marker = format!("swarm-merge-{}", Uuid::new_v4());
            self.git.run(
                &self.project_path,
                &["stash", "push", "--include-untracked", "-m", &marker],
            )?;
            cleanup.stash_marker = Some(marker);
        }

        let merge_error = match self
            .git
            .run(&self.project_path, &["merge", &branch, "--no-edit"])
        {
            Ok(_) => {
                return self.finish_merge_success(worker_id, &branch, false, cleanup);
            }
            Err(e) => e,
        };

        // Untracked files in the way: back them up, clear them, retry once.
        // On retry success the branch version wins and the backups are
        // dropped.
        let merge_error = if merge_error
            .message()
            .contains("untracked working tree files would be overwritten")
        {
            let paths = parse_untracked_overwrite_paths(merge_error.message());
            let backups = self.backup_and_remove(&paths)?;
            match self
                .git
                .run(&self.project_path, &["merge", &branch, "--no-edit"])
            {
                Ok(_) => {
                    return self.finish_merge_success(worker_id, &branch, false, cleanup);
                }
                Err(retry_error) => {
                    for (path, bytes) in backups {
                        if let Some(parent) = path.parent() {
                            let _ = std::fs::create_dir_all(parent);
                        }
                        if let Err(e) = std::fs::write(&path, bytes) {
                            tracing::warn!("could not restore backup {}: {e}", path.display());
                        }
                    }
                    retry_error
                }
            }
        } else {
            merge_error
        };

        let conflicted = self.git.unmerged_files(&self.project_path);
        if conflicted.is_empty() {
            // Not a conflict; surface the raw git failure.
            return Err(merge_error.into());
        }

        // Conflict path: try the resolver.
        let mut file_texts = Vec::with_capacity(conflicted.len());
        for path in &conflicted {
            let text = std::fs::read_to_string(self.project_path.join(path)).unwrap_or_default();
            file_texts.push((path.clone(), text));
        }

        match resolve_all(&file_texts) {
            ResolutionOutcome::Resolved(files) => {
                for file in files {
                    std::fs::write(self.project_path.join(&file.path), file.content)?;
                }
                self.git.run(&self.project_path, &["add", "-A"])?;
                let subject = format!("[Swarm] Auto-resolved merge conflict for {worker_id}");
                self.git.run(&self.project_path, &["commit", "-m", &subject])?;
                self.finish_merge_success(worker_id, &branch, true, cleanup)
            }
            ResolutionOutcome::Manual(conflict) => {
                self.git.try_run(&self.project_path, &["merge", "--abort"]);
                self.bus.emit(
                    event_types::BRANCH_ROLLBACK,
                    self.blueprint_id.clone(),
                    serde_json::json!({
                        "workerId": worker_id,
                        "branchName": &branch,
                    }),
                );
                self.bus.emit(
                    event_types::MERGE_CONFLICT,
                    self.blueprint_id.clone(),
                    serde_json::json!({
                        "workerId": worker_id,
                        "branchName": &branch,
                        "conflict": &conflict,
                    }),
                );
                Ok(MergeOutcome {
                    merged: false,
                    auto_resolved: false,
                    needs_human_review: true,
                    message: format!("merge of {branch} needs human review"),
                    conflict: Some(conflict),
                })
            }
        }
    }

    fn finish_merge_success(
        &self,
        worker_id: &str,
        branch: &str,
        auto_resolved: bool,
        cleanup: &mut MergeCleanup,
    ) -> Result<MergeOutcome, WorktreeError> {
        self.restore_stash(cleanup);
        self.destroy_workspace(worker_id)?;
        self.bus.emit(
            event_types::MERGE_SUCCESS,
            self.blueprint_id.clone(),
            serde_json::json!({
                "workerId": worker_id,
                "branchName": branch,
                "autoResolved": auto_resolved,
            }),
        );
        Ok(MergeOutcome {
            merged: true,
            auto_resolved,
            needs_human_review: false,
            conflict: None,
            message: format!("merged {branch}"),
        })
    }

    /// Clear any residue from an earlier failed merge before touching the
    /// index again. Escalates: abort -> hard reset to main -> take theirs
    /// and reset. Past that, the operator has to untangle it by hand, and
    /// this merge refuses to proceed.
    fn sweep_merge_residue(&self) -> Result<(), WorktreeError> {
        if self.git.merge_in_progress(&self.project_path) {
            self.git.try_run(&self.project_path, &["merge", "--abort"]);
        }
        if self.git.unmerged_files(&self.project_path).is_empty() {
            return Ok(());
        }

        self.git.try_run(&self.project_path, &["merge", "--abort"]);
        self.git
            .try_run(&self.project_path, &["reset", "--hard", &self.main_branch]);
        if self.git.unmerged_files(&self.project_path).is_empty() {
            return Ok(());
        }

        self.git.try_run(&self.project_path, &["checkout", "--theirs", "."]);
        self.git.try_run(&self.project_path, &["add", "-A"]);
        self.git.try_run(&self.project_path, &["reset", "--hard", "HEAD"]);
        if self.git.unmerged_files(&self.project_path).is_empty() {
            return Ok(());
        }

        self.bus.emit(
            event_types::EXECUTION_ERROR,
            self.blueprint_id.clone(),
            serde_json::json!({
                "error": "unmerged entries could not be cleared from the main checkout",
            }),
        );
        Err(WorktreeError::RepositoryUnrecoverable(
            "unmerged entries persist after abort, hard reset, and theirs-checkout".to_string(),
        ))
    }

    /// Idempotent post-merge sweep: never leave the repository mid-merge,
    /// off main, or with the guard stash unapplied.
    fn merge_finally(&self, cleanup: &mut MergeCleanup) {
        if self.git.merge_in_progress(&self.project_path) {
            self.git.try_run(&self.project_path, &["merge", "--abort"]);
        }
        if self.git.current_branch(&self.project_path).as_deref() != Some(&self.main_branch) {
            self.git
                .try_run(&self.project_path, &["checkout", &self.main_branch]);
        }
        self.restore_stash(cleanup);
    }

    fn restore_stash(&self, cleanup: &mut MergeCleanup) {
        let Some(marker) = cleanup.stash_marker.take() else {
            return;
        };
        let listed = self
            .git
            .run(&self.project_path, &["stash", "list"])
            .unwrap_or_default();
        if listed.contains(&marker) {
            if !self.git.try_run(&self.project_path, &["stash", "pop"]) {
                tracing::warn!("stash pop failed; stash '{marker}' left for the operator");
            }
        }
    }

    fn backup_and_remove(
        &self,
        paths: &[String],
    ) -> Result<Vec<(PathBuf, Vec<u8>)>, WorktreeError> {
        let mut backups = Vec::with_capacity(paths.len());
        for rel in paths {
            let absolute = self.project_path.join(rel);
            if absolute.is_file() {
                let bytes = std::fs::read(&absolute)?;
                std::fs::remove_file(&absolute)?;
                backups.push((absolute, bytes));
            }
        }
        Ok(backups)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn detect_main_branch(git: &GitClient, project_path: &Path) -> String {
    if let Some(current) = git.current_branch(project_path) {
        if current == "main" || current == "master" {
            return current;
        }
    }
    if let Some(remote) = git.remote_default_branch(project_path) {
        return remote;
    }
    if git.branch_exists(project_path, "main") {
        return "main".to_string();
    }
    if git.branch_exists(project_path, "master") {
        return "master".to_string();
    }
    "main".to_string()
}

/// Keep worker worktrees out of the repository's own history.
fn ensure_gitignore_entry(project_path: &Path) -> Result<(), std::io::Error> {
    let gitignore = project_path.join(".gitignore");
    let entry = format!("{WORKTREE_ROOT_DIR}/");
    let existing = std::fs::read_to_string(&gitignore).unwrap_or_default();
    if existing.lines().any(|l| l.trim() == entry || l.trim() == WORKTREE_ROOT_DIR) {
        return Ok(());
    }
    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&entry);
    updated.push('\n');
    std::fs::write(&gitignore, updated)
}

fn resolve_change_path(worktree: &Path, file_path: &str) -> (PathBuf, String) {
    let candidate = Path::new(file_path);
    if candidate.is_absolute() {
        let relative = candidate
            .strip_prefix(worktree)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_else(|_| file_path.replace('\\', "/"));
        (candidate.to_path_buf(), relative)
    } else {
        let normalized = file_path.replace('\\', "/");
        (worktree.join(&normalized), normalized)
    }
}

/// Commit subject: `[Swarm] <message> (Worker: <id8>, Files: <n>)`, single
/// line, embedded quotes and dollars escaped.
fn format_commit_subject(message: &str, worker_id: &str, files: usize) -> String {
    let short_id: String = worker_id.chars().take(8).collect();
    let sanitized = message
        .replace(['\n', '\r'], " ")
        .replace('"', "\\\"")
        .replace('$', "\\$");
    format!("[Swarm] {sanitized} (Worker: {short_id}, Files: {files})")
}

/// Pull the offending paths out of git's untracked-overwrite error text.
fn parse_untracked_overwrite_paths(message: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut in_list = false;
    for line in message.lines() {
        if line.contains("untracked working tree files would be overwritten") {
            in_list = true;
            continue;
        }
        if !in_list {
            continue;
        }
        if line.starts_with(char::is_whitespace) && !line.trim().is_empty() {
            paths.push(line.trim().to_string());
        } else {
            in_list = false;
        }
    }
    paths
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::SubscriptionFilter;
    use crate::testing::{commit_all, init_git_repo, temp_workspace};

    fn open_controller(path: &Path) -> (Arc<WorktreeController>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let controller = WorktreeController::open(
            path.to_path_buf(),
            Arc::new(GitLock::new()),
            bus.clone(),
            None,
        )
        .expect("controller open failed");
        (Arc::new(controller), bus)
    }

    #[test]
    fn commit_subject_escapes_and_truncates_worker_id() {
        let subject = format_commit_subject(
            "add \"auth\" for $user\nsecond line",
            "0123456789abcdef",
            3,
        );
        assert_eq!(
            subject,
            "[Swarm] add \\\"auth\\\" for \\$user second line (Worker: 01234567, Files: 3)"
        );
    }

    #[test]
    fn untracked_overwrite_paths_parse_from_git_error() {
        let message = "error: The following untracked working tree files would be overwritten by merge:\n\tconfig.local\n\tbuild/out.js\nPlease move or remove them before you merge.\nAborting";
        assert_eq!(
            parse_untracked_overwrite_paths(message),
            vec!["config.local".to_string(), "build/out.js".to_string()]
        );
    }

    #[test]
    fn open_bootstraps_repo_and_gitignore() {
        let ws = temp_workspace();
        let (controller, _bus) = open_controller(ws.path());
        assert!(controller.main_branch() == "main" || controller.main_branch() == "master");
        let ignore = std::fs::read_to_string(ws.path().join(".gitignore")).unwrap();
        assert!(ignore.contains(WORKTREE_ROOT_DIR));
        // Idempotent: opening again does not duplicate the entry.
        let (_c2, _b2) = open_controller(ws.path());
        let ignore2 = std::fs::read_to_string(ws.path().join(".gitignore")).unwrap();
        assert_eq!(ignore, ignore2);
    }

    #[tokio::test]
    async fn workspace_lifecycle_create_apply_merge() {
        let ws = temp_workspace();
        init_git_repo(ws.path());
        let (controller, bus) = open_controller(ws.path());
        let sub = bus.subscribe(SubscriptionFilter::all());

        let record = controller.create_workspace("worker-a").await.unwrap();
        assert!(record.worktree_path.exists());
        assert_eq!(record.branch_name, "swarm/worker-worker-a");

        let changes = vec![FileChange {
            file_path: "src/a.ts".into(),
            kind: ChangeKind::Create,
            content: Some("export const a = 1;\n".into()),
        }];
        let outcome = controller
            .apply_changes("worker-a", &changes, "add module a")
            .unwrap();
        assert!(outcome.committed);

        let merge = controller.merge_workspace("worker-a").await.unwrap();
        assert!(merge.merged);
        assert!(!merge.auto_resolved);

        // Branch version landed on main; workspace fully gone.
        assert!(ws.path().join("src/a.ts").exists());
        assert!(!record.worktree_path.exists());
        assert!(controller.workspace("worker-a").is_none());
        let git = GitClient::new();
        assert!(!git.branch_exists(ws.path(), "swarm/worker-worker-a"));

        let types: Vec<String> = sub.drain().into_iter().map(|e| e.event_type).collect();
        assert!(types.contains(&event_types::BRANCH_CREATED.to_string()));
        assert!(types.contains(&event_types::COMMIT_CREATED.to_string()));
        assert!(types.contains(&event_types::MERGE_SUCCESS.to_string()));
        assert!(types.contains(&event_types::BRANCH_DELETED.to_string()));
    }

    #[tokio::test]
    async fn reapplying_same_batch_produces_no_new_commit() {
        let ws = temp_workspace();
        init_git_repo(ws.path());
        let (controller, _bus) = open_controller(ws.path());

        controller.create_workspace("w").await.unwrap();
        let changes = vec![FileChange {
            file_path: "same.txt".into(),
            kind: ChangeKind::Create,
            content: Some("identical\n".into()),
        }];
        let first = controller.apply_changes("w", &changes, "write").unwrap();
        assert!(first.committed);
        let second = controller.apply_changes("w", &changes, "write").unwrap();
        assert!(!second.committed, "clean tree must short-circuit the commit");
        controller.destroy_workspace("w").unwrap();
    }

    #[tokio::test]
    async fn delete_change_removes_tracked_file() {
        let ws = temp_workspace();
        init_git_repo(ws.path());
        std::fs::write(ws.path().join("doomed.txt"), "bye\n").unwrap();
        commit_all(ws.path(), "add doomed");
        let (controller, _bus) = open_controller(ws.path());

        controller.create_workspace("w").await.unwrap();
        let changes = vec![FileChange {
            file_path: "doomed.txt".into(),
            kind: ChangeKind::Delete,
            content: None,
        }];
        let outcome = controller.apply_changes("w", &changes, "remove doomed").unwrap();
        assert!(outcome.committed);

        let merge = controller.merge_workspace("w").await.unwrap();
        assert!(merge.merged);
        assert!(!ws.path().join("doomed.txt").exists());
    }

    #[tokio::test]
    async fn recreate_after_destroy_yields_fresh_workspace() {
        let ws = temp_workspace();
        init_git_repo(ws.path());
        let (controller, _bus) = open_controller(ws.path());

        let first = controller.create_workspace("w").await.unwrap();
        std::fs::write(first.worktree_path.join("scratch.txt"), "leftover").unwrap();
        controller.destroy_workspace("w").unwrap();

        let second = controller.create_workspace("w").await.unwrap();
        assert_eq!(first.worktree_path, second.worktree_path);
        assert!(!second.worktree_path.join("scratch.txt").exists());
        controller.destroy_workspace("w").unwrap();
    }

    #[tokio::test]
    async fn stale_workspace_is_replaced_on_create() {
        let ws = temp_workspace();
        init_git_repo(ws.path());
        let (controller, _bus) = open_controller(ws.path());

        let first = controller.create_workspace("w").await.unwrap();
        std::fs::write(first.worktree_path.join("stale.txt"), "old").unwrap();
        // Create again without destroying: the stale tree must be replaced.
        let second = controller.create_workspace("w").await.unwrap();
        assert!(!second.worktree_path.join("stale.txt").exists());
        controller.destroy_workspace("w").unwrap();
    }

    #[tokio::test]
    async fn rescan_recovers_workspaces_from_disk() {
        let ws = temp_workspace();
        init_git_repo(ws.path());
        let (controller, bus) = open_controller(ws.path());
        controller.create_workspace("survivor").await.unwrap();

        // Simulate a restart: a brand-new controller over the same repo.
        let reopened = WorktreeController::open(
            ws.path().to_path_buf(),
            Arc::new(GitLock::new()),
            bus.clone(),
            None,
        )
        .unwrap();
        let recovered = reopened.workspace("survivor");
        assert!(recovered.is_some());
        assert_eq!(
            recovered.unwrap().branch_name,
            branch_for_worker("survivor")
        );
        reopened.destroy_workspace("survivor").unwrap();
    }

    #[tokio::test]
    async fn merge_with_dirty_main_stashes_and_restores() {
        let ws = temp_workspace();
        init_git_repo(ws.path());
        let (controller, _bus) = open_controller(ws.path());

        controller.create_workspace("w").await.unwrap();
        controller
            .apply_changes(
                "w",
                &[FileChange {
                    file_path: "merged.txt".into(),
                    kind: ChangeKind::Create,
                    content: Some("merged\n".into()),
                }],
                "add merged",
            )
            .unwrap();

        // Dirty main with an uncommitted local edit.
        std::fs::write(ws.path().join("local-note.txt"), "do not lose me\n").unwrap();

        let merge = controller.merge_workspace("w").await.unwrap();
        assert!(merge.merged);
        assert!(ws.path().join("merged.txt").exists());
        assert_eq!(
            std::fs::read_to_string(ws.path().join("local-note.txt")).unwrap(),
            "do not lose me\n"
        );
    }

    #[tokio::test]
    async fn merge_of_unknown_branch_fails_cleanly() {
        let ws = temp_workspace();
        init_git_repo(ws.path());
        let (controller, _bus) = open_controller(ws.path());
        let err = controller.merge_workspace("ghost").await.unwrap_err();
        assert!(matches!(err, WorktreeError::BranchMissing(_)));
        let git = GitClient::new();
        assert!(!git.merge_in_progress(ws.path()));
    }
}
