//! Worktree-isolated concurrency control.
//!
//! Each worker gets a physically separate working tree on top of the shared
//! repository, so parallel edits never contend for the index or the working
//! directory. Finished branches merge back to the main branch one at a
//! time, under the git mutex, with conservative automatic conflict
//! resolution.

pub mod conflict;
mod controller;
mod git;
mod links;

pub use conflict::{ConflictInfo, ResolutionOutcome, MAX_AUTO_RESOLVE_FILES};
pub use controller::{
    branch_for_worker, ChangeKind, CommitOutcome, FileChange, MergeOutcome, WorkspaceRecord,
    WorktreeController, WorktreeError, BRANCH_PREFIX, WORKTREE_ROOT_DIR,
};
pub use git::{GitClient, GitError};
pub use links::{link_shared_dependencies, LINKED_DEPENDENCIES};
