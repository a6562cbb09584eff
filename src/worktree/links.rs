//! Sharing gitignored dependency artifacts into fresh worktrees.
//!
//! A new worktree starts without `node_modules`, build caches, or local env
//! files, because none of them are tracked. Rebuilding them per worker is
//! wasteful, so the controller links them from the main checkout instead:
//! directory junctions on Windows (no elevation needed), symlinks
//! elsewhere, plain copies for single files. Linked trees are shared
//! read-only by convention; workers must not write through them.

use std::path::Path;

/// Dependency entries linked into every new worktree when present in the
/// main checkout.
pub const LINKED_DEPENDENCIES: &[&str] = &[
    "node_modules",
    ".env",
    ".env.local",
    "dist",
    ".cache",
    ".next",
    ".nuxt",
    "vendor",
    "venv",
    "__pycache__",
];

/// Link every known dependency entry from `project_root` into
/// `worktree_root`. Failures are collected as warnings; a worktree without
/// its `node_modules` link is degraded, not broken.
pub fn link_shared_dependencies(project_root: &Path, worktree_root: &Path) -> Vec<String> {
    let mut warnings = Vec::new();
    for name in LINKED_DEPENDENCIES {
        let source = project_root.join(name);
        if !source.exists() {
            continue;
        }
        let target = worktree_root.join(name);
        if target.exists() {
            continue;
        }

        let result = if source.is_dir() {
            link_directory(&source, &target)
        } else {
            std::fs::copy(&source, &target).map(|_| ()).map_err(|e| e.to_string())
        };

        if let Err(error) = result {
            tracing::warn!("could not link '{name}' into worktree: {error}");
            warnings.push(format!("could not link '{name}': {error}"));
        }
    }
    warnings
}

#[cfg(unix)]
fn link_directory(source: &Path, target: &Path) -> Result<(), String> {
    std::os::unix::fs::symlink(source, target).map_err(|e| e.to_string())
}

#[cfg(windows)]
fn link_directory(source: &Path, target: &Path) -> Result<(), String> {
    // Junctions work without elevation; fall back to a directory symlink
    // for filesystems that support them.
    let status = std::process::Command::new("cmd")
        .args(["/C", "mklink", "/J"])
        .arg(target)
        .arg(source)
        .status()
        .map_err(|e| e.to_string())?;
    if status.success() {
        return Ok(());
    }
    std::os::windows::fs::symlink_dir(source, target).map_err(|e| e.to_string())
}
