// src/utils/paths.rs
//! Path helpers for sandbox checks
//!
//! Files an agent asks about frequently do not exist yet, so `canonicalize`
//! alone is not enough. Paths are resolved lexically first and canonicalized
//! through the deepest existing ancestor, which also resolves symlinks that
//! would otherwise escape a directory.

use std::path::{Component, Path, PathBuf};

/// Lexically normalize `path`, resolving `.` and `..` without touching the filesystem
pub fn normalize_lexically(path: &Path) -> PathBuf {
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

/// Resolve `path` to an absolute, normalized form.
///
/// The longest existing prefix is canonicalized and the remaining
/// (not yet existing) components are appended.
pub fn resolve(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };
    let normalized = normalize_lexically(&absolute);

    let mut existing = normalized.clone();
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut resolved = canonical;
            for part in tail.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.file_name().map(|n| n.to_os_string()), existing.parent()) {
            (Some(name), Some(parent)) => {
                tail.push(name);
                existing = parent.to_path_buf();
            }
            _ => return normalized,
        }
    }
}

/// Whether `path` equals `dir` or lies anywhere below it
pub fn is_within(path: &Path, dir: &Path) -> bool {
    path.starts_with(dir)
}

/// Whether `path` is `dir` itself or a direct child of it
pub fn is_direct_child_or_self(path: &Path, dir: &Path) -> bool {
    path == dir || path.parent() == Some(dir)
}
