//! Session keys derived from project paths.
//!
//! One persistent shell exists per project, so the key is a pure function of
//! the project's path: key = first 16 bytes of SHA-256(normalized path),
//! hex-encoded. The hex form is safe to embed in management URLs.

use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

/// Number of hash bytes kept in a session key (32 hex chars).
const KEY_BYTES: usize = 16;

/// Lexically normalize a project path without touching the filesystem.
///
/// Drops `.` components, folds `..` into the preceding component and strips
/// trailing separators. Symlinks are not resolved.
pub fn normalize_project_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // `/..` is `/`
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Derive the session key for a project path.
pub fn session_key(path: &Path) -> String {
    let normalized = normalize_project_path(path);
    let hash = Sha256::digest(normalized.to_string_lossy().as_bytes());
    hex::encode(&hash[..KEY_BYTES])
}
