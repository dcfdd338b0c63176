//! Mapping object keys onto the local filesystem.

use std::path::{Path, PathBuf};

/// Last `/`-separated component of a key, or `None` when the key denotes a
/// directory placeholder (`"logs/"`, `""`).
pub fn basename(key: &str) -> Option<&str> {
    match key.rsplit('/').next() {
        Some(name) if !name.is_empty() => Some(name),
        _ => None,
    }
}

/// Whether the key lives below a directory.
pub fn is_nested(key: &str) -> bool {
    key.contains('/')
}

/// Where the object belongs: key segments expanded into directories under `root`.
///
/// Empty segments (leading, doubled or trailing `/`) are dropped, and so are
/// `.` and `..`, which keeps every key inside `root`.
pub fn nested_path(root: &Path, key: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for component in key.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            continue;
        }
        path.push(component);
    }
    path
}

/// Where older runs wrote the object: its basename directly under `root`.
pub fn flat_path(root: &Path, key: &str) -> Option<PathBuf> {
    basename(key).map(|name| root.join(name))
}
