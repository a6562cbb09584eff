//! Blueprint data model.
//!
//! A blueprint is the confirmed product of requirement elicitation and is
//! immutable once a run starts. Elicitation itself happens elsewhere; this
//! crate only consumes the finished record.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A confirmed project blueprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Absolute path to the shared git repository.
    pub project_path: PathBuf,
    /// Ordered natural-language requirement statements.
    pub requirements: Vec<String>,
    /// Role -> choice, e.g. `language -> "typescript"`.
    pub tech_stack: HashMap<String, String>,
    pub constraints: Vec<String>,
    pub modules: Vec<ModuleSpec>,
}

/// One module of the target project. `root_path` defines the module's
/// filesystem scope for the boundary checker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSpec {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Relative to the project root, forward slashes.
    pub root_path: String,
    #[serde(default)]
    pub tech_stack: Vec<String>,
}

impl Blueprint {
    /// Minimal blueprint for a project rooted at `project_path`.
    pub fn new(name: impl Into<String>, project_path: impl Into<PathBuf>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            project_path: project_path.into(),
            requirements: Vec::new(),
            tech_stack: HashMap::new(),
            constraints: Vec::new(),
            modules: Vec::new(),
        }
    }

    pub fn module(&self, id: &str) -> Option<&ModuleSpec> {
        self.modules.iter().find(|m| m.id == id)
    }
}
