//! In-jail to host-side path translation.
//!
//! Given a path as the jailed target would see it, find the host path that
//! backs it by honoring the bind-mount table and the chroot prefix. Used by
//! callers that must read or classify a file the target refers to (e.g. the
//! front-end deciding whether a target is statically linked) without
//! entering the jail themselves.

use std::path::{Component, Path, PathBuf};

use crate::cage::Cage;
use crate::error::{CageError, CageResult};

/// Symlink chains longer than this fail instead of looping.
const MAX_SYMLINK_HOPS: usize = 32;

/// In-jail absolute form of `path`: relative inputs are anchored at the
/// post-chroot working directory if one is set, at the jail root when a
/// chroot is configured, and at the process CWD otherwise.
fn absolutize(cage: &Cage, path: &Path) -> CageResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let base = if let Some(workdir) = &cage.workdir {
        workdir.clone()
    } else if cage.flags.chroot {
        PathBuf::from("/")
    } else {
        std::env::current_dir().map_err(|e| CageError::Io(format!("getcwd: {e}")))?
    };
    Ok(base.join(path))
}

/// Map an in-jail absolute path to the host path that backs it: the bind
/// entry with the longest matching destination prefix wins, ties going to
/// the earliest insertion; with no match the prefix is the chroot directory,
/// or the path is already host-side.
fn map_to_host(cage: &Cage, jail_path: &Path) -> PathBuf {
    let mut best: Option<(&crate::cage::BindMount, usize)> = None;
    for bind in &cage.binds {
        if jail_path.strip_prefix(&bind.dest).is_ok() {
            let len = bind.dest.as_os_str().len();
            if best.map_or(true, |(_, best_len)| len > best_len) {
                best = Some((bind, len));
            }
        }
    }
    if let Some((bind, _)) = best {
        let rest = jail_path.strip_prefix(&bind.dest).unwrap();
        return bind.src.join(rest);
    }
    match &cage.chrootdir {
        Some(root) => {
            let rest = jail_path.strip_prefix("/").unwrap_or(jail_path);
            root.join(rest)
        }
        None => jail_path.to_path_buf(),
    }
}

/// In-jail parent directory of a path, for resolving relative symlink
/// targets. Falls back to the jail root.
fn parent_of(jail_path: &Path) -> PathBuf {
    jail_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Drop `.` components and fold `..` so prefix matching sees the path the
/// kernel would walk.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    if out.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        out
    }
}

pub(crate) fn resolve(cage: &Cage, path: &Path) -> CageResult<PathBuf> {
    let mut jail_path = normalize(&absolutize(cage, path)?);

    for _ in 0..MAX_SYMLINK_HOPS {
        let host = map_to_host(cage, &jail_path);
        let meta = std::fs::symlink_metadata(&host)
            .map_err(|e| CageError::Io(format!("lstat {host:?}: {e}")))?;
        let file_type = meta.file_type();

        if file_type.is_file() {
            return Ok(host);
        }
        if file_type.is_symlink() {
            let target = std::fs::read_link(&host)
                .map_err(|e| CageError::Io(format!("readlink {host:?}: {e}")))?;
            // Symlink targets are in-jail paths; feed them back through the
            // bind table rather than following them host-side.
            jail_path = if target.is_absolute() {
                normalize(&target)
            } else {
                normalize(&parent_of(&jail_path).join(target))
            };
            continue;
        }
        return Err(CageError::NotRepresentable(format!(
            "{host:?} is neither a regular file nor a symlink"
        )));
    }
    Err(CageError::NotRepresentable(format!(
        "{path:?} chains through more than {MAX_SYMLINK_HOPS} symlinks"
    )))
}

impl Cage {
    /// Translate an in-jail path to the host path that backs it. See the
    /// module docs for the matching rules.
    pub fn get_path(&self, path: &Path) -> CageResult<PathBuf> {
        resolve(self, path)
    }
}
