//! Boundary checker: who may touch which path.
//!
//! A pure predicate over `(actor role, operation, path)`, independent of the
//! filesystem. Workers consult it before every tool call; a denial is fed
//! back to the model as a tool error, never raised to the coordinator.
//!
//! All path comparisons normalize OS separators to forward slashes first,
//! so the same blueprint produces the same decisions on every platform.

use std::collections::HashMap;

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::blueprint::Blueprint;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// The lead supervisor: full access except hard-forbidden paths.
    Lead,
    /// A dispatched worker: restricted writes.
    Worker,
    /// A human operator: full access except hard-forbidden paths.
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    Read,
    Write,
    Delete,
}

impl FileOperation {
    fn mutates(self) -> bool {
        matches!(self, Self::Write | Self::Delete)
    }
}

/// Outcome of a boundary check. `allowed=true` with warnings means the
/// operation proceeds but the actor is told it strayed (e.g. a
/// cross-module write).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub warnings: Vec<String>,
}

impl AccessDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            warnings: Vec::new(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            warnings: Vec::new(),
        }
    }

    fn warn(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Pattern tables
// ---------------------------------------------------------------------------

/// Directory components no actor may traverse, read or write.
const HARD_FORBIDDEN_COMPONENTS: &[&str] = &["node_modules", ".git", ".svn", ".hg"];

/// Project-level directories any module may legitimately write into.
const SHARED_DIRECTORIES: &[&str] = &[
    "src/utils",
    "src/types",
    "src/shared",
    "src/common",
    "src/lib",
    "lib",
    "utils",
    "types",
    "shared",
    "common",
];

const BLUEPRINT_FILE_GLOBS: &[&str] = &[
    "*.blueprint.json",
    "*.blueprint.yaml",
    "blueprint.json",
    "blueprint.yaml",
];

const ACCEPTANCE_FILE_GLOBS: &[&str] = &[
    "*.acceptance.test.*",
    "*.acceptance.spec.*",
    "acceptance-test.*",
    "acceptance_test.*",
];

/// Recognized project-level config files, exempt from module scoping.
const CONFIG_FILE_GLOBS: &[&str] = &[
    "vitest.config.*",
    "vite.config.*",
    "jest.config.*",
    "karma.config.*",
    "cypress.config.*",
    "playwright.config.*",
    "tsconfig*.json",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "bun.lockb",
    "webpack.config.*",
    "rollup.config.*",
    "esbuild.config.*",
    ".eslintrc*",
    "eslint.config.*",
    ".prettierrc*",
    "prettier.config.*",
    ".stylelintrc*",
    ".env*",
    ".editorconfig",
    ".gitignore",
    ".npmrc",
];

const TEST_FILE_GLOBS: &[&str] = &["*.test.*", "*.spec.*", "*_test.*"];

fn build_glob_set(patterns: &[&str]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).expect("static glob pattern must compile"));
    }
    builder.build().expect("static glob set must compile")
}

// ---------------------------------------------------------------------------
// Checker
// ---------------------------------------------------------------------------

/// Compiled once per blueprint; `check` is pure and deterministic.
pub struct BoundaryChecker {
    project_prefix: String,
    module_roots: HashMap<String, String>,
    blueprint_files: GlobSet,
    acceptance_files: GlobSet,
    config_files: GlobSet,
    test_files: GlobSet,
}

impl BoundaryChecker {
    pub fn new(blueprint: &Blueprint) -> Self {
        let module_roots = blueprint
            .modules
            .iter()
            .map(|m| (m.id.clone(), normalize(&m.root_path)))
            .collect();
        Self {
            project_prefix: normalize(&blueprint.project_path.to_string_lossy()),
            module_roots,
            blueprint_files: build_glob_set(BLUEPRINT_FILE_GLOBS),
            acceptance_files: build_glob_set(ACCEPTANCE_FILE_GLOBS),
            config_files: build_glob_set(CONFIG_FILE_GLOBS),
            test_files: build_glob_set(TEST_FILE_GLOBS),
        }
    }

    /// Decide whether `role` may perform `operation` on `path`.
    ///
    /// `module_id` is the executing task's module binding, if any; it only
    /// influences the advisory cross-module warning, never allow/deny.
    pub fn check(
        &self,
        role: ActorRole,
        operation: FileOperation,
        path: &str,
        module_id: Option<&str>,
    ) -> AccessDecision {
        let path = self.relativize(&normalize(path));
        let file_name = path.rsplit('/').next().unwrap_or(&path);

        // 1. Hard-forbidden paths, all roles, all operations.
        if let Some(component) = path
            .split('/')
            .find(|c| HARD_FORBIDDEN_COMPONENTS.contains(c))
        {
            return AccessDecision::deny(format!(
                "path traverses forbidden directory '{component}'"
            ));
        }

        // 2. Reads are open to everyone.
        if !operation.mutates() {
            return AccessDecision::allow();
        }

        // 3. Lead and human writes are unrestricted.
        if matches!(role, ActorRole::Lead | ActorRole::Human) {
            return AccessDecision::allow();
        }

        // 4a. Workers may not rewrite the blueprint out from under the run.
        if self.blueprint_files.is_match(file_name) {
            return AccessDecision::deny(
                "blueprint files are read-only for workers; the blueprint is fixed once a run starts",
            );
        }

        // 4b. Acceptance tests define "done" and are off-limits to the
        // agents being graded by them.
        if self.acceptance_files.is_match(file_name) || path.split('/').any(|c| c == "__acceptance__")
        {
            return AccessDecision::deny(
                "acceptance test files may not be modified by workers",
            );
        }

        // 5. Advisory module scoping.
        if let Some(root) = module_id.and_then(|id| self.module_roots.get(id)) {
            if !under(&path, root) && !self.module_boundary_exempt(&path, file_name) {
                return AccessDecision::allow().warn(format!(
                    "cross-module write: '{path}' is outside module root '{root}'"
                ));
            }
        }

        AccessDecision::allow()
    }

    /// Test files, recognized project-level config files, and shared
    /// directories are writable from any module without a warning.
    fn module_boundary_exempt(&self, path: &str, file_name: &str) -> bool {
        if self.test_files.is_match(file_name) || self.config_files.is_match(file_name) {
            return true;
        }
        SHARED_DIRECTORIES.iter().any(|dir| under(path, dir))
    }

    fn relativize<'a>(&self, path: &'a str) -> String {
        match path.strip_prefix(&self.project_prefix) {
            Some(rest) => rest.trim_start_matches('/').to_string(),
            None => path.to_string(),
        }
    }
}

fn normalize(path: &str) -> String {
    let mut normalized = path.replace('\\', "/");
    while let Some(rest) = normalized.strip_prefix("./") {
        normalized = rest.to_string();
    }
    normalized.trim_end_matches('/').to_string()
}

fn under(path: &str, root: &str) -> bool {
    path == root || path.starts_with(&format!("{root}/"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{Blueprint, ModuleSpec};

    fn blueprint() -> Blueprint {
        let mut bp = Blueprint::new("demo", "/repo");
        bp.modules.push(ModuleSpec {
            id: "auth".into(),
            name: "auth".into(),
            kind: "backend".into(),
            root_path: "src/auth".into(),
            tech_stack: vec![],
        });
        bp
    }

    fn checker() -> BoundaryChecker {
        BoundaryChecker::new(&blueprint())
    }

    #[test]
    fn hard_forbidden_paths_deny_everyone_everything() {
        let c = checker();
        for role in [ActorRole::Lead, ActorRole::Worker, ActorRole::Human] {
            for op in [FileOperation::Read, FileOperation::Write, FileOperation::Delete] {
                let d = c.check(role, op, "node_modules/left-pad/index.js", None);
                assert!(!d.allowed, "{role:?} {op:?} should be denied");
                let d = c.check(role, op, "src/.git/config", None);
                assert!(!d.allowed);
            }
        }
    }

    #[test]
    fn reads_are_open_to_all_roles() {
        let c = checker();
        for role in [ActorRole::Lead, ActorRole::Worker, ActorRole::Human] {
            assert!(c.check(role, FileOperation::Read, "src/auth/login.ts", None).allowed);
            assert!(c.check(role, FileOperation::Read, "project.blueprint.json", None).allowed);
        }
    }

    #[test]
    fn worker_cannot_write_blueprint_files() {
        let c = checker();
        for path in [
            "project.blueprint.json",
            "blueprint.yaml",
            "configs/app.blueprint.yaml",
        ] {
            let d = c.check(ActorRole::Worker, FileOperation::Write, path, None);
            assert!(!d.allowed, "{path} should be denied");
            assert!(d.reason.is_some());
        }
        // Lead may.
        assert!(
            c.check(ActorRole::Lead, FileOperation::Write, "blueprint.yaml", None)
                .allowed
        );
    }

    #[test]
    fn worker_cannot_touch_acceptance_tests() {
        let c = checker();
        for path in [
            "src/login.acceptance.test.ts",
            "src/login.acceptance.spec.js",
            "acceptance_test.py",
            "tests/__acceptance__/flow.ts",
        ] {
            let d = c.check(ActorRole::Worker, FileOperation::Delete, path, None);
            assert!(!d.allowed, "{path} should be denied");
        }
    }

    #[test]
    fn cross_module_write_warns_but_allows() {
        let c = checker();
        let d = c.check(
            ActorRole::Worker,
            FileOperation::Write,
            "src/billing/invoice.ts",
            Some("auth"),
        );
        assert!(d.allowed);
        assert_eq!(d.warnings.len(), 1);
        assert!(d.warnings[0].contains("cross-module write"));

        let d = c.check(
            ActorRole::Worker,
            FileOperation::Write,
            "src/auth/session.ts",
            Some("auth"),
        );
        assert!(d.allowed);
        assert!(d.warnings.is_empty());
    }

    #[test]
    fn module_exemptions_cover_tests_configs_and_shared_dirs() {
        let c = checker();
        for path in [
            "src/billing/invoice.test.ts",
            "package.json",
            "tsconfig.build.json",
            ".env.local",
            "vitest.config.ts",
            "src/utils/format.ts",
            "src/shared/constants.ts",
        ] {
            let d = c.check(ActorRole::Worker, FileOperation::Write, path, Some("auth"));
            assert!(d.allowed, "{path}");
            assert!(d.warnings.is_empty(), "{path} should not warn: {:?}", d.warnings);
        }
    }

    #[test]
    fn backslash_paths_normalize_before_matching() {
        let c = checker();
        let d = c.check(
            ActorRole::Worker,
            FileOperation::Write,
            "src\\auth\\session.ts",
            Some("auth"),
        );
        assert!(d.allowed);
        assert!(d.warnings.is_empty());

        let d = c.check(ActorRole::Worker, FileOperation::Write, "node_modules\\x\\y.js", None);
        assert!(!d.allowed);
    }

    #[test]
    fn absolute_project_paths_are_relativized() {
        let c = checker();
        let d = c.check(
            ActorRole::Worker,
            FileOperation::Write,
            "/repo/src/auth/session.ts",
            Some("auth"),
        );
        assert!(d.allowed);
        assert!(d.warnings.is_empty());
    }

    #[test]
    fn checker_is_deterministic() {
        let c = checker();
        let first = c.check(
            ActorRole::Worker,
            FileOperation::Write,
            "src/billing/x.ts",
            Some("auth"),
        );
        for _ in 0..10 {
            let again = c.check(
                ActorRole::Worker,
                FileOperation::Write,
                "src/billing/x.ts",
                Some("auth"),
            );
            assert_eq!(first, again);
        }
    }
}
