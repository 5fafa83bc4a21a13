use std::fmt;

use serde::{Deserialize, Serialize};

/// Semantic role of a changed artifact inside a project root.
///
/// The set is closed: anything the pattern table does not recognise is
/// `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    /// Structured task file (`prd.json`).
    Prd,
    /// Append-only markdown progress log.
    Progress,
    /// Append-only markdown guardrails log.
    Guardrails,
    /// Line-oriented activity log.
    ActivityLog,
    /// Line-oriented error log.
    ErrorLog,
    /// Anything inside a per-run artifact directory.
    Run,
    Unknown,
}

impl FileType {
    pub const ALL: [FileType; 7] = [
        FileType::Prd,
        FileType::Progress,
        FileType::Guardrails,
        FileType::ActivityLog,
        FileType::ErrorLog,
        FileType::Run,
        FileType::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Prd => "prd",
            FileType::Progress => "progress",
            FileType::Guardrails => "guardrails",
            FileType::ActivityLog => "activity_log",
            FileType::ErrorLog => "error_log",
            FileType::Run => "run",
            FileType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of filesystem change, as reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Change,
    Unlink,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Add => "add",
            ChangeKind::Change => "change",
            ChangeKind::Unlink => "unlink",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified, debounced notification that an artifact changed.
///
/// `path` is relative to the project root and always `/`-separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub project_id: String,
    pub file_type: FileType,
    pub path: String,
    pub kind: ChangeKind,
}
