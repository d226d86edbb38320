#![forbid(unsafe_code)]

//! Shared security helpers: path containment under the media root and the
//! process-level root check used by the server binary.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use nix::unistd::Uid;

use crate::error::{MediaError, MediaResult};

/// Fails fast when the server is started as root. Running as a regular
/// unprivileged user keeps a misconfigured media root from exposing system
/// directories.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; use a dedicated service account");
    }
    Ok(())
}

/// Joins `relative` onto `root` and normalizes `.`/`..` lexically, without
/// touching the filesystem.
///
/// The result must lie strictly below `root` (compared component-wise, so a
/// sibling such as `root2` never matches `root`). Anything else is a
/// [`MediaError::PathViolation`]; callers answer "forbidden" and never
/// reveal whether the target exists.
pub fn resolve_within_root(root: &Path, relative: &str) -> MediaResult<PathBuf> {
    let root = normalize(root);
    let mut joined = root.clone();
    for component in Path::new(relative).components() {
        match component {
            // Absolute request paths are taken relative to the root.
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                joined.pop();
            }
            Component::Normal(part) => joined.push(part),
        }
    }

    if joined != root && joined.starts_with(&root) {
        Ok(joined)
    } else {
        Err(MediaError::PathViolation)
    }
}

/// True when `value` is exactly one normal path component (no separators,
/// no `.`/`..`).
pub fn is_single_segment(value: &str) -> bool {
    let mut components = Path::new(value).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !value.contains(['/', '\\'])
}

pub fn ensure_single_segment(value: &str) -> MediaResult<()> {
    if is_single_segment(value) {
        Ok(())
    } else {
        Err(MediaError::InvalidName(value.to_string()))
    }
}

fn normalize(path: &Path) -> PathBuf {
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
