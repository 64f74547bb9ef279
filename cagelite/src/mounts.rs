//! Bind-mount and chroot phase of the jail pipeline.
//!
//! Runs in the child of exec after the mount-namespace unshare, in this
//! order: bind mounts (insertion order), chroot + chdir, the ephemeral
//! `/tmp`, and finally the read-only `/proc` remount. Any failure here is
//! fatal for the caller; the process is already partway through privilege
//! transformation.

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};

use crate::cage::{BindMount, Cage};
use crate::error::{CageError, CageResult};

/// Host-side mount target for a bind destination: the destination rebased
/// under the chroot prefix when one is configured.
fn bind_target(chrootdir: Option<&Path>, dest: &Path) -> PathBuf {
    match chrootdir {
        Some(root) => root.join(dest.strip_prefix("/").unwrap_or(dest)),
        None => dest.to_path_buf(),
    }
}

fn apply_bind(chrootdir: Option<&Path>, bind: &BindMount) -> CageResult<()> {
    let target = bind_target(chrootdir, &bind.dest);
    tracing::debug!(
        src = %bind.src.display(),
        target = %target.display(),
        writable = bind.writable,
        "bind mounting"
    );
    mount(
        Some(&bind.src),
        &target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(CageError::syscall("mount(MS_BIND)"))?;
    if !bind.writable {
        // A bind mount ignores MS_RDONLY on creation; it takes effect only
        // on a remount of the same target.
        mount(
            Some(&bind.src),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .map_err(CageError::syscall("mount(MS_BIND|MS_REMOUNT|MS_RDONLY)"))?;
    }
    Ok(())
}

/// Apply bind mounts, enter the chroot, and mount `/tmp`.
pub(crate) fn apply(cage: &Cage) -> CageResult<()> {
    for bind in &cage.binds {
        apply_bind(cage.chrootdir.as_deref(), bind)?;
    }

    if let Some(root) = &cage.chrootdir {
        tracing::debug!(root = %root.display(), "entering chroot");
        nix::unistd::chroot(root.as_path()).map_err(CageError::syscall("chroot"))?;
        let workdir = cage.workdir.as_deref().unwrap_or(Path::new("/"));
        nix::unistd::chdir(workdir).map_err(CageError::syscall("chdir"))?;

        if cage.flags.mount_tmp {
            mount(
                Some("none"),
                "/tmp",
                Some("tmpfs"),
                MsFlags::empty(),
                Some("size=128M,mode=777"),
            )
            .map_err(CageError::syscall("mount(tmpfs)"))?;
        }
    }

    Ok(())
}

/// Replace the inherited `/proc` with a fresh read-only instance.
///
/// The inherited mount is a reference into the parent mount namespace; an
/// `MS_REMOUNT` on it would leak the change outward even inside a fresh
/// mount namespace, so it is detached and a new `proc` mounted instead.
pub(crate) fn remount_proc_readonly() -> CageResult<()> {
    // A stale binfmt_misc mount under /proc would keep the detach busy.
    let _ = umount2("/proc/sys/fs/binfmt_misc", MntFlags::MNT_DETACH);

    umount2("/proc", MntFlags::MNT_DETACH).map_err(CageError::syscall("umount2(/proc)"))?;
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(CageError::syscall("mount(proc)"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_target_rebases_under_chroot() {
        assert_eq!(
            bind_target(Some(Path::new("/srv/jail")), Path::new("/lib")),
            Path::new("/srv/jail/lib")
        );
        assert_eq!(
            bind_target(None, Path::new("/lib")),
            Path::new("/lib")
        );
    }

    #[test]
    fn bind_target_handles_nested_destinations() {
        assert_eq!(
            bind_target(Some(Path::new("/srv/jail")), Path::new("/usr/lib/x86_64")),
            Path::new("/srv/jail/usr/lib/x86_64")
        );
    }
}
