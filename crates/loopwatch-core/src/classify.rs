//! Path classification.
//!
//! Maps a changed path to a [`FileType`] by matching its root-relative form
//! against a fixed, ordered pattern table. No filesystem access happens here.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use glob::{MatchOptions, Pattern};

use crate::types::FileType;

/// Directory under each project root that holds the tracked artifacts.
pub const ARTIFACT_DIR: &str = ".loop";

/// Ordered pattern table. The first match wins, so more specific entries
/// must come before broader ones.
const PATTERN_TABLE: &[(&str, FileType)] = &[
    (".loop/prd.json", FileType::Prd),
    (".loop/progress.md", FileType::Progress),
    (".loop/guardrails.md", FileType::Guardrails),
    (".loop/activity.log", FileType::ActivityLog),
    (".loop/errors.log", FileType::ErrorLog),
    (".loop/runs/**/*", FileType::Run),
];

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

static PATTERNS: LazyLock<Vec<(Pattern, FileType)>> = LazyLock::new(|| {
    PATTERN_TABLE
        .iter()
        .map(|(raw, file_type)| {
            let pattern = Pattern::new(raw).expect("built-in pattern table is valid");
            (pattern, *file_type)
        })
        .collect()
});

/// Classify `path` relative to `root`.
///
/// Paths that are not under `root` classify as [`FileType::Unknown`].
pub fn classify(root: &Path, path: &Path) -> FileType {
    match relative_path(root, path) {
        Some(rel) => classify_relative(&rel),
        None => FileType::Unknown,
    }
}

/// Classify an already root-relative, `/`-separated path.
pub fn classify_relative(rel: &str) -> FileType {
    PATTERNS
        .iter()
        .find(|(pattern, _)| pattern.matches_with(rel, MATCH_OPTIONS))
        .map(|(_, file_type)| *file_type)
        .unwrap_or(FileType::Unknown)
}

/// Whether the watcher should forward events for `path` at all.
pub fn is_tracked(root: &Path, path: &Path) -> bool {
    classify(root, path) != FileType::Unknown
}

/// Lexically normalise a path: drop `.` components and fold `..` into the
/// preceding component. Symlinks are not resolved.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let popped = matches!(out.components().next_back(), Some(Component::Normal(_)))
                    && out.pop();
                if !popped && !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Root-relative form of `path` with `/` separators, or `None` when `path`
/// lies outside `root`.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let root = normalize_path(root);
    let path = normalize_path(path);
    let rel = path.strip_prefix(&root).ok()?;

    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}
