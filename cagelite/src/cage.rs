//! Jail configuration record and builder.
//!
//! A [`Cage`] accumulates isolation requests while the caller still holds
//! privileges, is frozen once one of the `run` entry points is called, is
//! transmitted once through the config pipe, and is reconstructed read-only
//! on the far side. Builder operations validate the inter-option constraints
//! up front so that the child-side pipeline never has to.
//!
//! Constraints enforced here:
//!
//! - `chroot_chdir` requires a prior `enter_chroot`; the directory must be
//!   absolute.
//! - Any bind entry implies the mount namespace; a PID namespace implies the
//!   mount namespace and a read-only `/proc`.
//! - `inherit_usergroups` requires a resolved user name.
//! - Changing UID or GID to root is rejected outright.

use std::fs::File;
use std::path::{Path, PathBuf};

use seccompiler::BpfProgram;

use crate::error::{CageError, CageResult};
use crate::seccomp;

/// A directive to bind-mount one host path onto one path inside the chroot,
/// optionally read-only. Entries apply in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub src: PathBuf,
    pub dest: PathBuf,
    pub writable: bool,
}

/// One boolean per isolation feature. The set is marshalled bit-exactly, so
/// the field order here matches the wire bit order in the codec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Flags {
    pub uid: bool,
    pub gid: bool,
    pub caps: bool,
    pub vfs: bool,
    pub pids: bool,
    pub net: bool,
    pub seccomp_strict: bool,
    pub readonly_proc: bool,
    pub usergroups: bool,
    pub no_new_privs: bool,
    pub seccomp_filter: bool,
    pub log_seccomp_failures: bool,
    pub chroot: bool,
    pub mount_tmp: bool,
    pub chdir: bool,
    pub ptrace_disabled: bool,
    pub stack_limit: bool,
    pub time_limit: bool,
    pub output_limit: bool,
    pub memory_limit: bool,
    pub meta: bool,
}

/// The jail configuration record and process handle.
///
/// Created empty, mutated only by the builder operations below, consumed by
/// the driver in `spawn`. Owned strings, the bind list, and the compiled
/// filter are freed on drop.
#[derive(Debug)]
pub struct Cage {
    pub(crate) flags: Flags,
    pub(crate) uid: libc::uid_t,
    pub(crate) gid: libc::gid_t,
    /// Base GID handed to `initgroups` when supplementary groups are
    /// inherited; the primary GID of the resolved user.
    pub(crate) usergroups_gid: libc::gid_t,
    pub(crate) caps_mask: u64,
    /// PID of the first forked child once a `run` entry point has been
    /// called; zero while idle.
    pub(crate) initpid: libc::pid_t,
    pub(crate) user: Option<String>,
    pub(crate) chrootdir: Option<PathBuf>,
    pub(crate) workdir: Option<PathBuf>,
    pub(crate) filter: Option<BpfProgram>,
    pub(crate) binds: Vec<BindMount>,
    pub(crate) stack_bytes: u64,
    pub(crate) cpu_ms: u64,
    pub(crate) memory_bytes: u64,
    pub(crate) output_bytes: u64,
    pub(crate) meta: Option<File>,
}

impl Default for Cage {
    fn default() -> Self {
        Self::new()
    }
}

impl Cage {
    /// Create an empty configuration: nothing is isolated until requested.
    pub fn new() -> Self {
        Cage {
            flags: Flags::default(),
            uid: 0,
            gid: 0,
            usergroups_gid: 0,
            caps_mask: 0,
            initpid: 0,
            user: None,
            chrootdir: None,
            workdir: None,
            filter: None,
            binds: Vec::new(),
            stack_bytes: 0,
            cpu_ms: 0,
            memory_bytes: 0,
            output_bytes: 0,
            meta: None,
        }
    }

    /// PID of the running jail, if a `run` entry point has been called and
    /// the child has not been reaped yet.
    pub fn pid(&self) -> Option<libc::pid_t> {
        (self.initpid > 0).then_some(self.initpid)
    }

    pub fn binds(&self) -> &[BindMount] {
        &self.binds
    }

    /// The configured chroot directory, if any.
    pub fn chrootdir(&self) -> Option<&Path> {
        self.chrootdir.as_deref()
    }

    /// The configured post-chroot working directory, if any.
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// The user name retained by [`Cage::change_user`], if any.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    // ------------------------------------------------------------------
    // Credentials
    // ------------------------------------------------------------------

    /// Change the real/effective/saved UID of the target.
    ///
    /// Requesting a change *to* root is rejected before any state change.
    pub fn change_uid(&mut self, uid: libc::uid_t) -> CageResult<()> {
        if uid == 0 {
            return Err(CageError::InvalidArgument(
                "refusing to change UID to root".into(),
            ));
        }
        self.uid = uid;
        self.flags.uid = true;
        Ok(())
    }

    /// Change the real/effective/saved GID of the target.
    pub fn change_gid(&mut self, gid: libc::gid_t) -> CageResult<()> {
        if gid == 0 {
            return Err(CageError::InvalidArgument(
                "refusing to change GID to root".into(),
            ));
        }
        self.gid = gid;
        self.flags.gid = true;
        Ok(())
    }

    /// Resolve `name` in the user database and request a change to that
    /// user's UID and primary GID. The name is retained so that
    /// [`Cage::inherit_usergroups`] can later populate the supplementary
    /// group set.
    pub fn change_user(&mut self, name: &str) -> CageResult<()> {
        let user = nix::unistd::User::from_name(name)
            .map_err(|e| CageError::Io(format!("user lookup for {name:?}: {e}")))?
            .ok_or_else(|| CageError::Io(format!("unknown user {name:?}")))?;
        self.change_uid(user.uid.as_raw())?;
        self.change_gid(user.gid.as_raw())?;
        self.usergroups_gid = user.gid.as_raw();
        self.user = Some(name.to_owned());
        Ok(())
    }

    /// Resolve `name` in the group database and request a change to that GID.
    pub fn change_group(&mut self, name: &str) -> CageResult<()> {
        let group = nix::unistd::Group::from_name(name)
            .map_err(|e| CageError::Io(format!("group lookup for {name:?}: {e}")))?
            .ok_or_else(|| CageError::Io(format!("unknown group {name:?}")))?;
        self.change_gid(group.gid.as_raw())
    }

    /// Populate the supplementary group set from `/etc/group` for the user
    /// previously resolved by [`Cage::change_user`]. Without this, a UID or
    /// GID change clears the supplementary set entirely.
    pub fn inherit_usergroups(&mut self) -> CageResult<()> {
        if self.user.is_none() {
            return Err(CageError::InvalidArgument(
                "inherit_usergroups requires change_user first".into(),
            ));
        }
        self.flags.usergroups = true;
        Ok(())
    }

    /// Restrict the target to the capability set in `mask` (bit `i` keeps
    /// capability `i`). Bits above the kernel's last supported capability
    /// are ignored at drop time.
    pub fn use_caps(&mut self, mask: u64) -> CageResult<()> {
        self.caps_mask = mask;
        self.flags.caps = true;
        Ok(())
    }

    /// Clear the dumpable bit so no sibling can ptrace-attach to the target.
    pub fn disable_ptrace(&mut self) -> CageResult<()> {
        self.flags.ptrace_disabled = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Namespaces and filesystem
    // ------------------------------------------------------------------

    pub fn namespace_vfs(&mut self) -> CageResult<()> {
        self.flags.vfs = true;
        Ok(())
    }

    /// Request a PID namespace. The target (and everything it forks) runs
    /// under a surrogate init that reaps descendants and enforces the
    /// wall-clock timeout. Implies a mount namespace and a fresh read-only
    /// `/proc`, so the target cannot see host PIDs.
    pub fn namespace_pids(&mut self) -> CageResult<()> {
        self.flags.pids = true;
        self.flags.vfs = true;
        self.flags.readonly_proc = true;
        Ok(())
    }

    pub fn namespace_net(&mut self) -> CageResult<()> {
        self.flags.net = true;
        Ok(())
    }

    /// Detach the inherited `/proc` and remount it read-only with
    /// `nodev,noexec,nosuid`.
    pub fn remount_readonly(&mut self) -> CageResult<()> {
        self.flags.readonly_proc = true;
        Ok(())
    }

    /// Chroot into `dir` before exec. May be requested once.
    pub fn enter_chroot(&mut self, dir: &Path) -> CageResult<()> {
        if self.flags.chroot {
            return Err(CageError::InvalidArgument(
                "chroot directory already set".into(),
            ));
        }
        self.chrootdir = Some(dir.to_owned());
        self.flags.chroot = true;
        Ok(())
    }

    /// Change directory to `dir` (an absolute in-jail path) after the
    /// chroot. Requires [`Cage::enter_chroot`] first.
    pub fn chroot_chdir(&mut self, dir: &Path) -> CageResult<()> {
        if !self.flags.chroot {
            return Err(CageError::InvalidArgument(
                "chroot_chdir requires enter_chroot first".into(),
            ));
        }
        if self.flags.chdir {
            return Err(CageError::InvalidArgument(
                "post-chroot directory already set".into(),
            ));
        }
        if !dir.is_absolute() {
            return Err(CageError::InvalidArgument(format!(
                "post-chroot directory {dir:?} must be absolute"
            )));
        }
        self.workdir = Some(dir.to_owned());
        self.flags.chdir = true;
        Ok(())
    }

    /// Bind-mount the host path `src` onto the in-jail path `dest`
    /// (absolute), read-only unless `writable`. Implies a mount namespace.
    pub fn bind(&mut self, src: &Path, dest: &Path, writable: bool) -> CageResult<()> {
        if !dest.is_absolute() {
            return Err(CageError::InvalidArgument(format!(
                "bind destination {dest:?} must be absolute"
            )));
        }
        self.binds.push(BindMount {
            src: src.to_owned(),
            dest: dest.to_owned(),
            writable,
        });
        self.flags.vfs = true;
        Ok(())
    }

    /// Mount an ephemeral tmpfs at `/tmp` inside the chroot.
    pub fn mount_tmp(&mut self) -> CageResult<()> {
        self.flags.mount_tmp = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Seccomp
    // ------------------------------------------------------------------

    /// Request strict-mode seccomp: only `read`, `write`, `exit` and
    /// `sigreturn` remain permitted. Installed last of all, after every
    /// other pipeline step.
    pub fn use_seccomp(&mut self) -> CageResult<()> {
        self.flags.seccomp_strict = true;
        Ok(())
    }

    /// Request filter-mode seccomp with a program previously loaded by
    /// [`Cage::parse_seccomp_filters`] or supplied via
    /// [`Cage::set_seccomp_filter`].
    pub fn use_seccomp_filter(&mut self) -> CageResult<()> {
        self.flags.seccomp_filter = true;
        Ok(())
    }

    /// Emit a diagnostic on `SIGSYS` instead of dying silently. The target
    /// still dies; this only makes the kill observable on stderr.
    pub fn log_seccomp_filter_failures(&mut self) -> CageResult<()> {
        self.flags.log_seccomp_failures = true;
        Ok(())
    }

    /// Load a syscall policy file and compile it to a BPF filter program.
    pub fn parse_seccomp_filters(&mut self, path: &Path) -> CageResult<()> {
        let program = seccomp::load_policy(path)?;
        self.set_seccomp_filter(program)
    }

    /// Install a pre-compiled BPF filter program, e.g. from an external
    /// policy compiler.
    pub fn set_seccomp_filter(&mut self, program: BpfProgram) -> CageResult<()> {
        if program.len() > u16::MAX as usize {
            return Err(CageError::TooLarge(format!(
                "filter program has {} instructions, limit is {}",
                program.len(),
                u16::MAX
            )));
        }
        self.filter = Some(program);
        self.flags.seccomp_filter = true;
        Ok(())
    }

    /// Set the `no_new_privs` process bit before dropping privileges, so
    /// `execve` can never re-grant them (SUID bits, file capabilities).
    pub fn no_new_privs(&mut self) -> CageResult<()> {
        self.flags.no_new_privs = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Resource limits and metadata
    // ------------------------------------------------------------------

    pub fn stack_limit(&mut self, bytes: u64) -> CageResult<()> {
        self.stack_bytes = bytes;
        self.flags.stack_limit = true;
        Ok(())
    }

    /// Limit CPU time to `ms` milliseconds, enforced by `RLIMIT_CPU` plus a
    /// profiling interval timer; under a PID namespace the init supervisor
    /// additionally enforces it as a wall-clock alarm.
    pub fn time_limit(&mut self, ms: u64) -> CageResult<()> {
        self.cpu_ms = ms;
        self.flags.time_limit = true;
        Ok(())
    }

    /// Limit file output to `bytes` via `RLIMIT_FSIZE`; also disables core
    /// dumps.
    pub fn output_limit(&mut self, bytes: u64) -> CageResult<()> {
        self.output_bytes = bytes;
        self.flags.output_limit = true;
        Ok(())
    }

    /// Limit the address space to `bytes` via `RLIMIT_AS`.
    pub fn memory_limit(&mut self, bytes: u64) -> CageResult<()> {
        self.memory_bytes = bytes;
        self.flags.memory_limit = true;
        Ok(())
    }

    /// Open `path` as the execution-metadata sink. The init supervisor
    /// writes line-oriented `time:`/`time-wall:`/`mem:` records plus the
    /// final `signal:` or `status:` into it.
    pub fn meta_file(&mut self, path: &Path) -> CageResult<()> {
        let file = File::create(path)
            .map_err(|e| CageError::Io(format!("opening metadata file {path:?}: {e}")))?;
        self.meta = Some(file);
        self.flags.meta = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Exec-boundary splitting
    // ------------------------------------------------------------------

    /// Reduce this record to the work the forked child performs before
    /// `execve` on the preload path: namespaces, binds, chroot, `/tmp` and
    /// the `/proc` remount. Everything else travels through the config pipe
    /// and is completed by the preload shim inside the new process image.
    pub(crate) fn strip_to_preexec(&mut self) {
        self.flags.uid = false;
        self.flags.gid = false;
        self.flags.caps = false;
        self.flags.usergroups = false;
        self.flags.no_new_privs = false;
        self.flags.seccomp_filter = false;
        self.flags.log_seccomp_failures = false;
        self.flags.seccomp_strict = false;
        self.flags.ptrace_disabled = false;
        self.flags.stack_limit = false;
        self.flags.time_limit = false;
        self.flags.output_limit = false;
        self.flags.memory_limit = false;
        self.filter = None;
    }

    /// The complement of [`Cage::strip_to_preexec`]: a copy holding only the
    /// phases the preload shim applies after `execve` lands. The child of
    /// exec already performed the VFS phase, so the shim must not repeat it.
    pub(crate) fn shim_copy(&self) -> Cage {
        let mut flags = self.flags;
        flags.vfs = false;
        flags.pids = false;
        flags.net = false;
        flags.chroot = false;
        flags.chdir = false;
        flags.mount_tmp = false;
        flags.readonly_proc = false;
        flags.meta = false;
        Cage {
            flags,
            uid: self.uid,
            gid: self.gid,
            usergroups_gid: self.usergroups_gid,
            caps_mask: self.caps_mask,
            initpid: self.initpid,
            user: self.user.clone(),
            chrootdir: None,
            workdir: None,
            filter: self.filter.clone(),
            binds: Vec::new(),
            stack_bytes: self.stack_bytes,
            cpu_ms: self.cpu_ms,
            memory_bytes: self.memory_bytes,
            output_bytes: self.output_bytes,
            meta: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_uid_to_root_is_rejected_before_state_change() {
        let mut cage = Cage::new();
        assert!(matches!(
            cage.change_uid(0),
            Err(CageError::InvalidArgument(_))
        ));
        assert!(!cage.flags.uid);
        assert_eq!(cage.uid, 0);
    }

    #[test]
    fn change_gid_to_root_is_rejected() {
        let mut cage = Cage::new();
        assert!(cage.change_gid(0).is_err());
        assert!(!cage.flags.gid);
    }

    #[test]
    fn chdir_requires_chroot_first() {
        let mut cage = Cage::new();
        assert!(matches!(
            cage.chroot_chdir(Path::new("/bin")),
            Err(CageError::InvalidArgument(_))
        ));

        cage.enter_chroot(Path::new("/srv/jail")).unwrap();
        cage.chroot_chdir(Path::new("/bin")).unwrap();
        assert_eq!(cage.workdir.as_deref(), Some(Path::new("/bin")));
    }

    #[test]
    fn chroot_twice_is_rejected() {
        let mut cage = Cage::new();
        cage.enter_chroot(Path::new("/srv/a")).unwrap();
        assert!(cage.enter_chroot(Path::new("/srv/b")).is_err());
        assert_eq!(cage.chrootdir.as_deref(), Some(Path::new("/srv/a")));
    }

    #[test]
    fn chdir_must_be_absolute() {
        let mut cage = Cage::new();
        cage.enter_chroot(Path::new("/srv/jail")).unwrap();
        assert!(cage.chroot_chdir(Path::new("bin")).is_err());
    }

    #[test]
    fn bind_implies_mount_namespace() {
        let mut cage = Cage::new();
        cage.bind(Path::new("/lib"), Path::new("/lib"), false).unwrap();
        assert!(cage.flags.vfs);
        assert_eq!(cage.binds.len(), 1);
    }

    #[test]
    fn pid_namespace_implies_vfs_and_readonly_proc() {
        let mut cage = Cage::new();
        cage.namespace_pids().unwrap();
        assert!(cage.flags.pids);
        assert!(cage.flags.vfs);
        assert!(cage.flags.readonly_proc);
    }

    #[test]
    fn inherit_usergroups_requires_user_name() {
        let mut cage = Cage::new();
        assert!(matches!(
            cage.inherit_usergroups(),
            Err(CageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn bind_destination_must_be_absolute() {
        let mut cage = Cage::new();
        assert!(cage.bind(Path::new("/lib"), Path::new("lib"), false).is_err());
        assert!(cage.binds.is_empty());
        assert!(!cage.flags.vfs);
    }

    #[test]
    fn oversized_filter_is_rejected() {
        let mut cage = Cage::new();
        let insn = seccompiler::sock_filter {
            code: 0x06,
            jt: 0,
            jf: 0,
            k: 0,
        };
        let program = vec![insn; u16::MAX as usize + 1];
        assert!(matches!(
            cage.set_seccomp_filter(program),
            Err(CageError::TooLarge(_))
        ));
        assert!(cage.filter.is_none());
    }

    #[test]
    fn preexec_split_partitions_the_flag_set() {
        let mut cage = Cage::new();
        cage.change_uid(1000).unwrap();
        cage.namespace_pids().unwrap();
        cage.namespace_net().unwrap();
        cage.no_new_privs().unwrap();
        cage.enter_chroot(Path::new("/srv/jail")).unwrap();
        cage.time_limit(500).unwrap();

        let shim = cage.shim_copy();
        assert!(shim.flags.uid && shim.flags.no_new_privs && shim.flags.time_limit);
        assert!(!shim.flags.vfs && !shim.flags.pids && !shim.flags.chroot);
        assert!(shim.chrootdir.is_none());

        cage.strip_to_preexec();
        assert!(cage.flags.vfs && cage.flags.net && cage.flags.chroot);
        assert!(!cage.flags.uid && !cage.flags.no_new_privs && !cage.flags.time_limit);
    }
}
