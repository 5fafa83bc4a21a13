use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One registered project: an id and the directory it lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectEntry {
    pub id: String,
    pub root: PathBuf,
}

/// Source of project roots. Project identity and persistence live outside
/// loopwatch; the watcher only asks for a root when a watch starts.
pub trait ProjectDirectory: Send + Sync {
    fn root_path(&self, project_id: &str) -> Option<PathBuf>;

    fn project_ids(&self) -> Vec<String>;
}

/// Fixed set of projects, typically from the config file and CLI.
#[derive(Debug, Clone, Default)]
pub struct StaticProjects {
    roots: BTreeMap<String, PathBuf>,
}

impl StaticProjects {
    pub fn new(entries: impl IntoIterator<Item = ProjectEntry>) -> Self {
        let roots = entries.into_iter().map(|e| (e.id, e.root)).collect();
        Self { roots }
    }

    /// Later inserts for the same id replace the earlier root.
    pub fn insert(&mut self, entry: ProjectEntry) {
        self.roots.insert(entry.id, entry.root);
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

impl ProjectDirectory for StaticProjects {
    fn root_path(&self, project_id: &str) -> Option<PathBuf> {
        self.roots.get(project_id).cloned()
    }

    fn project_ids(&self) -> Vec<String> {
        self.roots.keys().cloned().collect()
    }
}

impl ProjectEntry {
    /// Parse the CLI form `ID=PATH`.
    pub fn parse_assignment(s: &str) -> Result<Self, String> {
        let (id, root) = s
            .split_once('=')
            .ok_or_else(|| format!("expected ID=PATH, got {s:?}"))?;
        if id.is_empty() || root.is_empty() {
            return Err(format!("expected ID=PATH, got {s:?}"));
        }
        Ok(Self {
            id: id.to_string(),
            root: PathBuf::from(root),
        })
    }
}
