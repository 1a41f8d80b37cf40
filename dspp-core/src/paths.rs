//! Centralized path handling for dspp.
//!
//! Cache layout and every descriptor-relative path goes through this module so
//! that the project-root containment rule is enforced in one place.

use crate::error::{DsppError, Result};
use std::path::{Component, Path, PathBuf};

/// Default cache directory, relative to the project root.
pub const CACHE_STACK_PATH: &str = ".docker-stack";

/// Name of the content-addressed blob directory inside the cache directory.
pub const CAS_DIR_NAME: &str = ".cas";

/// Get the CAS directory for a cache directory (both relative to the project root).
pub fn cas_dir(cache_dir: &str) -> PathBuf {
    Path::new(cache_dir).join(CAS_DIR_NAME)
}

/// Lexically normalize a path, folding `.` and `..` without touching the filesystem.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `/..` is `/`.
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `rel` against the directory of `fragment`, refusing to leave `root`.
///
/// Absolute paths are taken as-is: they are an explicit opt-out of containment.
pub fn resolve_within(root: &Path, fragment: &Path, rel: &str) -> Result<PathBuf> {
    resolve_from(root, fragment.parent().unwrap_or(root), rel)
}

/// Resolve `rel` against the directory `base`, refusing to leave `root`.
pub fn resolve_from(root: &Path, base: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return Ok(normalize(rel_path));
    }

    let root = if root.is_absolute() {
        normalize(root)
    } else {
        let cwd = std::env::current_dir().map_err(|e| DsppError::io(root, e))?;
        normalize(&cwd.join(root))
    };
    let base = if base.is_absolute() { base.to_path_buf() } else { root.join(base) };
    let resolved = normalize(&base.join(rel_path));

    let climbs = matches!(resolved.components().next(), Some(Component::ParentDir));
    if climbs || !resolved.starts_with(&root) {
        return Err(DsppError::PathEscape { path: resolved, root });
    }
    Ok(resolved)
}

/// Render a path with forward slashes, the way it appears in compiled stacks.
pub fn to_posix(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
