//! Filesystem helpers used by the handlers and the builder.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::domain::FunctionId;

/// Directories never descended into when searching below a root.
const SKIP_DIRS: [&str; 5] = ["node_modules", ".git", "target", ".tether", ".sst"];

/// Nearest ancestor of `dir` (inclusive) that contains `target`.
pub fn find_above(dir: &Path, target: &str) -> Option<PathBuf> {
    dir.ancestors()
        .find(|candidate| candidate.join(target).exists())
        .map(Path::to_path_buf)
}

/// First directory under `root` (inclusive, shallowest first) that contains `target`.
pub fn find_below(root: &Path, target: &str) -> Option<PathBuf> {
    let mut found: Vec<(usize, PathBuf)> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| SKIP_DIRS.contains(&name))
        })
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && entry.file_name() == target)
        .filter_map(|entry| {
            let depth = entry.depth();
            entry.path().parent().map(|p| (depth, p.to_path_buf()))
        })
        .collect();
    found.sort();
    found.into_iter().next().map(|(_, dir)| dir)
}

/// Is `file` inside `parent` (lexically, after normalizing `.` and `..`)?
pub fn is_child(parent: &Path, file: &Path) -> bool {
    normalize(file).starts_with(normalize(parent))
}

/// Lexical normalization; does not touch the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Recursively copy `from` (file or directory) to `to`, skipping `SKIP_DIRS`.
pub fn copy_recursive(from: &Path, to: &Path) -> io::Result<()> {
    if from.is_file() {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
        return Ok(());
    }
    for entry in WalkDir::new(from).into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !entry
                .file_name()
                .to_str()
                .is_some_and(|name| SKIP_DIRS.contains(&name))
    }) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Symlink `to` -> `from`. Directories and files alike.
pub fn link(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(from, to)
    }
    #[cfg(windows)]
    {
        if from.is_dir() {
            std::os::windows::fs::symlink_dir(from, to)
        } else {
            std::os::windows::fs::symlink_file(from, to)
        }
    }
}

/// Project root recorded per function at build time; drives `should_rebuild`.
#[derive(Debug, Default)]
pub struct ProjectRoots {
    roots: Mutex<HashMap<FunctionId, PathBuf>>,
}

impl ProjectRoots {
    pub fn record(&self, function_id: &FunctionId, root: impl Into<PathBuf>) {
        self.roots.lock().insert(function_id.clone(), root.into());
    }

    pub fn get(&self, function_id: &FunctionId) -> Option<PathBuf> {
        self.roots.lock().get(function_id).cloned()
    }

    /// `file` lies under the recorded root. Unknown functions never match.
    pub fn contains(&self, function_id: &FunctionId, file: &Path) -> bool {
        self.roots
            .lock()
            .get(function_id)
            .is_some_and(|root| is_child(root, file))
    }
}

/// `file` ends with one of `extensions` (without the dot) or is named one of `names`.
pub fn matches_source(file: &Path, extensions: &[&str], names: &[&str]) -> bool {
    let by_extension = file
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.contains(&ext));
    let by_name = file
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| names.contains(&name));
    by_extension || by_name
}
