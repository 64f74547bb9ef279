//! Namespace and process driver: the ordered privilege-dropping pipeline.
//!
//! The sequence is single-shot and order-critical. Within one process:
//!
//! 1. `unshare(CLONE_NEWNS)`, then `unshare(CLONE_NEWNET)`
//! 2. bind mounts, chroot, `/tmp`, read-only `/proc`
//! 3. dumpable bit cleared when ptrace is disabled
//! 4. keep-caps plus locked securebits, when capabilities must survive the
//!    UID change
//! 5. with `no_new_privs`: the NNP bit, then the credential drop, then the
//!    capability drop, then the seccomp filter. Without it the filter goes
//!    *first* (installing needs privileges), so the policy must admit the
//!    credential-change syscalls.
//! 6. rlimits (static path only; the preload shim handles the dynamic path)
//! 7. strict seccomp, last of all
//! 8. `execve`
//!
//! ## Process topology
//!
//! Without a PID namespace the driver forks once and the child runs the
//! pipeline and execs. With one, the driver calls the raw `clone` syscall
//! with `CLONE_NEWPID` (the libc fork wrapper runs atfork handlers and takes
//! runtime locks the namespace init could never release); the clone child
//! forks once more, the grandchild runs the pipeline and execs, and the
//! outer child becomes PID-namespace init (see the `init` module).
//!
//! Everything the child needs between clone and `execve` (exec vectors,
//! environment snapshot, pipes) is prepared in the parent beforehand.
//!
//! ## Dynamic vs. static targets
//!
//! A dynamically-linked target cannot be confined entirely before `execve`:
//! the loader still has to resolve libraries from the host view. The child
//! therefore performs only the VFS phase pre-exec, and the rest of the
//! configuration travels through a pipe to a preload shim
//! ([`PRELOAD_LIBRARY`], injected via `LD_PRELOAD`) that re-enters it inside
//! the new process image. Static targets cannot be preloaded, so the child
//! unmarshals the full record from the pipe and runs every phase inline;
//! capabilities are unsupported there and rejected at entry.

use std::convert::Infallible;
use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;

use nix::sched::{CloneFlags, unshare};
use nix::unistd::ForkResult;

use crate::cage::Cage;
use crate::error::{CageError, CageResult};
use crate::{ERR_JAIL, creds, init, mounts, rlimits, seccomp};

/// Name of the preload shim injected into dynamically-linked targets.
pub const PRELOAD_LIBRARY: &str = "libcagelite-preload.so";

const PRELOAD_ENV: &str = "LD_PRELOAD";

/// Carries the config-pipe read end to the preload shim, as decimal.
const CONFIG_FD_ENV: &str = "__CAGELITE_FD";

/// Parent-side ends of the requested stdio pipes.
#[derive(Debug, Default)]
pub struct StdioPipes {
    /// Write end feeding the target's stdin.
    pub stdin: Option<File>,
    /// Read end of the target's stdout.
    pub stdout: Option<File>,
    /// Read end of the target's stderr.
    pub stderr: Option<File>,
}

#[derive(Clone, Copy)]
struct SpawnOptions {
    use_preload: bool,
    stdin: bool,
    stdout: bool,
    stderr: bool,
}

/// Everything the child touches between clone and `execve`, prepared in the
/// parent. The pairs are (read end, write end) as returned by `pipe`.
struct ChildIo {
    exec_path: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    config_rx: OwnedFd,
    config_tx: OwnedFd,
    stdin: Option<(OwnedFd, OwnedFd)>,
    stdout: Option<(OwnedFd, OwnedFd)>,
    stderr: Option<(OwnedFd, OwnedFd)>,
}

impl Cage {
    /// Launch a dynamically-linked target under the jail.
    pub fn run(&mut self, program: &Path, argv: &[&str]) -> CageResult<()> {
        self.spawn_internal(
            program,
            argv,
            SpawnOptions {
                use_preload: true,
                stdin: false,
                stdout: false,
                stderr: false,
            },
        )
        .map(|_| ())
    }

    /// Like [`Cage::run`], returning the PID of the first forked child.
    pub fn run_pid(&mut self, program: &Path, argv: &[&str]) -> CageResult<libc::pid_t> {
        self.spawn_internal(
            program,
            argv,
            SpawnOptions {
                use_preload: true,
                stdin: false,
                stdout: false,
                stderr: false,
            },
        )
        .map(|(pid, _)| pid)
    }

    /// Like [`Cage::run_pid`], additionally plumbing pipes onto the
    /// requested standard streams of the target.
    pub fn run_pid_pipes(
        &mut self,
        program: &Path,
        argv: &[&str],
        stdin: bool,
        stdout: bool,
        stderr: bool,
    ) -> CageResult<(libc::pid_t, StdioPipes)> {
        self.spawn_internal(
            program,
            argv,
            SpawnOptions {
                use_preload: true,
                stdin,
                stdout,
                stderr,
            },
        )
    }

    /// Launch a statically-linked target. No preload shim is involved: the
    /// child unmarshals the configuration from the pipe and applies every
    /// phase inline before `execve`. Capability restriction needs the shim
    /// and is rejected here.
    pub fn run_static(&mut self, program: &Path, argv: &[&str]) -> CageResult<()> {
        self.spawn_internal(
            program,
            argv,
            SpawnOptions {
                use_preload: false,
                stdin: false,
                stdout: false,
                stderr: false,
            },
        )
        .map(|_| ())
    }

    /// Apply the jail pipeline to the current process without forking.
    ///
    /// This is the entry point for hosts that have already forked on their
    /// own. It cannot be combined with a PID namespace; that requires the
    /// surrogate-init topology only the forking entry points set up.
    pub fn enter(&self) -> CageResult<()> {
        if self.flags.pids {
            return Err(CageError::InvalidArgument(
                "PID namespaces require the forking entry points".into(),
            ));
        }
        enter_pipeline(self, true)
    }

    /// Wait for the jailed process and fold its fate into a single status:
    /// the target's own exit code, `128 + N` for death by signal `N`, or
    /// [`ERR_JAIL`](crate::ERR_JAIL) when the seccomp filter killed it.
    pub fn wait(&mut self) -> CageResult<i32> {
        let pid = self.initpid;
        if pid <= 0 {
            return Err(CageError::InvalidArgument(
                "no jailed process to wait for".into(),
            ));
        }
        let mut status: libc::c_int = 0;
        loop {
            let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
            if ret == pid {
                break;
            }
            if ret < 0 {
                let errno = nix::errno::Errno::last();
                if errno == nix::errno::Errno::EINTR {
                    continue;
                }
                return Err(CageError::kernel("waitpid")(errno));
            }
        }
        self.initpid = 0;
        Ok(classify_status(status))
    }

    /// Terminate the jailed process with `SIGTERM` and wait once.
    pub fn kill(&mut self) -> CageResult<i32> {
        let pid = self.initpid;
        if pid <= 0 {
            return Err(CageError::InvalidArgument(
                "no jailed process to kill".into(),
            ));
        }
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            return Err(CageError::kernel("kill")(nix::errno::Errno::last()));
        }
        self.wait()
    }

    fn spawn_internal(
        &mut self,
        program: &Path,
        argv: &[&str],
        opts: SpawnOptions,
    ) -> CageResult<(libc::pid_t, StdioPipes)> {
        if self.initpid > 0 {
            return Err(CageError::InvalidArgument(
                "this jail is already running a process".into(),
            ));
        }
        if !opts.use_preload && self.flags.caps {
            return Err(CageError::InvalidArgument(
                "capability restriction requires the preload path".into(),
            ));
        }

        // Prepare every allocation the child will need before the clone.
        let exec_path = CString::new(program.as_os_str().as_bytes())
            .map_err(|_| CageError::InvalidArgument(format!("{program:?} contains NUL")))?;
        let argv_c = argv
            .iter()
            .map(|a| CString::new(*a))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| CageError::InvalidArgument("argv contains NUL".into()))?;

        let (config_rx, config_tx) = nix::unistd::pipe().map_err(CageError::kernel("pipe"))?;

        // The preload directive and the pipe fd are inherited through the
        // environment; the parent's own environment is put back right after
        // the clone.
        let saved_preload = env::var_os(PRELOAD_ENV);
        if opts.use_preload {
            let mut value = OsString::from(PRELOAD_LIBRARY);
            if let Some(old) = &saved_preload {
                value.push(" ");
                value.push(old);
            }
            set_env(PRELOAD_ENV, &value);
            set_env(CONFIG_FD_ENV, config_rx.as_raw_fd().to_string());
        }

        let spawn_result = (|| -> CageResult<(libc::pid_t, StdioPipes)> {
            let envp = env_snapshot()?;
            let make_pipe = || nix::unistd::pipe().map_err(CageError::kernel("pipe"));
            let io = ChildIo {
                exec_path,
                argv: argv_c,
                envp,
                config_rx,
                config_tx,
                stdin: opts.stdin.then(make_pipe).transpose()?,
                stdout: opts.stdout.then(make_pipe).transpose()?,
                stderr: opts.stderr.then(make_pipe).transpose()?,
            };

            let child = if self.flags.pids {
                clone_newpid()?
            } else {
                match unsafe { nix::unistd::fork() }.map_err(CageError::kernel("fork"))? {
                    ForkResult::Child => 0,
                    ForkResult::Parent { child } => child.as_raw(),
                }
            };
            if child == 0 {
                child_entry(self, io, opts.use_preload);
            }

            let ChildIo {
                config_rx,
                config_tx,
                stdin,
                stdout,
                stderr,
                ..
            } = io;
            drop(config_rx);
            self.initpid = child;

            let sent = if opts.use_preload {
                self.shim_copy().to_fd(config_tx.as_raw_fd())
            } else {
                self.to_fd(config_tx.as_raw_fd())
            };
            drop(config_tx);
            if let Err(err) = sent {
                tracing::warn!(pid = child, error = %err, "config send failed, killing child");
                unsafe {
                    libc::kill(child, libc::SIGKILL);
                    let mut status = 0;
                    libc::waitpid(child, &mut status, 0);
                }
                self.initpid = 0;
                return Err(err);
            }

            let pipes = StdioPipes {
                stdin: stdin.map(|(r, w)| {
                    drop(r);
                    File::from(w)
                }),
                stdout: stdout.map(|(r, w)| {
                    drop(w);
                    File::from(r)
                }),
                stderr: stderr.map(|(r, w)| {
                    drop(w);
                    File::from(r)
                }),
            };
            tracing::debug!(pid = child, preload = opts.use_preload, "jailed child launched");
            Ok((child, pipes))
        })();

        if opts.use_preload {
            restore_env(PRELOAD_ENV, saved_preload);
            remove_env(CONFIG_FD_ENV);
        }
        spawn_result
    }
}

/// Fold a raw `waitpid` status into the caller-visible exit status.
pub(crate) fn classify_status(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        let sig = libc::WTERMSIG(status);
        if sig == libc::SIGSYS { ERR_JAIL } else { 128 + sig }
    } else {
        crate::ERR_INIT
    }
}

/// The ordered pipeline applied inside the to-be-jailed process.
pub(crate) fn enter_pipeline(cage: &Cage, with_rlimits: bool) -> CageResult<()> {
    if cage.flags.vfs {
        unshare(CloneFlags::CLONE_NEWNS).map_err(CageError::syscall("unshare(CLONE_NEWNS)"))?;
    }
    if cage.flags.net {
        unshare(CloneFlags::CLONE_NEWNET).map_err(CageError::syscall("unshare(CLONE_NEWNET)"))?;
    }
    if !cage.binds.is_empty() || cage.flags.chroot {
        mounts::apply(cage)?;
    }
    if cage.flags.readonly_proc {
        mounts::remount_proc_readonly()?;
    }
    if cage.flags.ptrace_disabled {
        disable_dumpable()?;
    }

    if cage.flags.caps && (cage.flags.uid || cage.flags.gid) {
        // Without keep-caps the kernel clears the permitted set on setuid,
        // leaving nothing for drop_caps to shape.
        creds::enable_keep_caps()?;
    }

    if cage.flags.no_new_privs {
        seccomp::set_no_new_privs()?;
        creds::drop_ugid(cage)?;
        if cage.flags.caps {
            creds::drop_caps(cage.caps_mask)?;
        }
        install_filter_if_requested(cage)?;
    } else {
        install_filter_if_requested(cage)?;
        creds::drop_ugid(cage)?;
        if cage.flags.caps {
            creds::drop_caps(cage.caps_mask)?;
        }
    }

    if with_rlimits {
        rlimits::apply(cage)?;
    }
    if cage.flags.seccomp_strict {
        seccomp::enter_strict()?;
    }
    Ok(())
}

fn install_filter_if_requested(cage: &Cage) -> CageResult<()> {
    if !cage.flags.seccomp_filter {
        return Ok(());
    }
    let filter = cage.filter.as_ref().ok_or_else(|| {
        CageError::InvalidArgument("seccomp filter requested but none loaded".into())
    })?;
    seccomp::install_filter(filter, cage.flags.log_seccomp_failures)
}

fn disable_dumpable() -> CageResult<()> {
    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_DUMPABLE,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if ret != 0 {
        return Err(CageError::kernel("prctl(PR_SET_DUMPABLE)")(
            nix::errno::Errno::last(),
        ));
    }
    Ok(())
}

/// `clone(CLONE_NEWPID | SIGCHLD)` through the raw syscall.
///
/// The libc fork wrapper runs pthread_atfork handlers and takes runtime
/// locks that the PID-namespace init could never release; between this call
/// and `execve` the child keeps to syscalls and preallocated buffers.
fn clone_newpid() -> CageResult<libc::pid_t> {
    let flags = libc::CLONE_NEWPID as libc::c_long | libc::SIGCHLD as libc::c_long;
    let ret = unsafe { libc::syscall(libc::SYS_clone, flags, 0usize, 0usize, 0usize, 0usize) };
    if ret < 0 {
        return Err(CageError::syscall("clone(CLONE_NEWPID)")(
            nix::errno::Errno::last(),
        ));
    }
    Ok(ret as libc::pid_t)
}

/// Child side of the spawn. Never returns; any setup failure aborts the
/// process, because a half-dropped process must never reach `execve`.
fn child_entry(cage: &mut Cage, io: ChildIo, use_preload: bool) -> ! {
    match child_main(cage, io, use_preload) {
        Err(err) => {
            tracing::error!(error = %err, "jail setup failed in child");
            unsafe { libc::_exit(crate::ERR_INIT) }
        }
        Ok(never) => match never {},
    }
}

fn child_main(cage: &mut Cage, io: ChildIo, use_preload: bool) -> CageResult<Infallible> {
    let ChildIo {
        exec_path,
        argv,
        envp,
        config_rx,
        config_tx,
        stdin,
        stdout,
        stderr,
    } = io;
    drop(config_tx);

    if let Some((r, w)) = stdin {
        dup2_checked(r.as_raw_fd(), libc::STDIN_FILENO)?;
        drop(r);
        drop(w);
    }
    if let Some((r, w)) = stdout {
        dup2_checked(w.as_raw_fd(), libc::STDOUT_FILENO)?;
        drop(r);
        drop(w);
    }
    if let Some((r, w)) = stderr {
        dup2_checked(w.as_raw_fd(), libc::STDERR_FILENO)?;
        drop(r);
        drop(w);
    }

    if cage.flags.pids {
        // First process in the fresh PID namespace. Fork once more: the
        // inner child continues to exec, this process becomes the
        // namespace init and reaps every descendant.
        match unsafe { nix::unistd::fork() }.map_err(CageError::kernel("fork"))? {
            ForkResult::Parent { child } => {
                drop(config_rx);
                init::run(child.as_raw(), cage)
            }
            ForkResult::Child => {}
        }
    }
    cage.flags.pids = false;

    // Session leader, so the init supervisor can kill the whole group.
    if unsafe { libc::setsid() } < 0 {
        return Err(CageError::kernel("setsid")(nix::errno::Errno::last()));
    }

    if use_preload {
        // The preload shim completes the credential, seccomp and rlimit
        // phases inside the new process image; only the VFS phase can and
        // must happen before execve.
        cage.strip_to_preexec();
        enter_pipeline(cage, false)?;
        nix::unistd::execve(&exec_path, &argv, &envp).map_err(CageError::kernel("execve"))?;
    } else {
        // Static path: the first blocking read is on the config pipe, which
        // also orders this child after the parent's marshal-send.
        let mut cfg = Cage::from_fd(config_rx.as_raw_fd())?;
        drop(config_rx);
        cfg.flags.pids = false;
        enter_pipeline(&cfg, true)?;
        nix::unistd::execve(&exec_path, &argv, &envp).map_err(CageError::kernel("execve"))?;
    }
    unreachable!("execve returned without an error")
}

fn dup2_checked(from: libc::c_int, to: libc::c_int) -> CageResult<()> {
    if unsafe { libc::dup2(from, to) } < 0 {
        return Err(CageError::kernel("dup2")(nix::errno::Errno::last()));
    }
    Ok(())
}

fn env_snapshot() -> CageResult<Vec<CString>> {
    let mut out = Vec::new();
    for (key, value) in env::vars_os() {
        let mut kv = key.into_vec();
        kv.push(b'=');
        kv.extend(value.into_vec());
        out.push(
            CString::new(kv)
                .map_err(|_| CageError::InvalidArgument("environment contains NUL".into()))?,
        );
    }
    Ok(out)
}

fn set_env(key: &str, value: impl AsRef<OsStr>) {
    // SAFETY: the driver is single-threaded by contract (crate docs); no
    // other thread can observe the environment mid-update.
    unsafe { env::set_var(key, value) }
}

fn remove_env(key: &str) {
    // SAFETY: as in set_env.
    unsafe { env::remove_var(key) }
}

fn restore_env(key: &str, old: Option<OsString>) {
    match old {
        Some(value) => set_env(key, value),
        None => remove_env(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> libc::c_int {
        code << 8
    }

    fn signaled(sig: i32) -> libc::c_int {
        sig
    }

    #[test]
    fn exit_codes_pass_through() {
        assert_eq!(classify_status(exited(0)), 0);
        assert_eq!(classify_status(exited(42)), 42);
        assert_eq!(classify_status(exited(255)), 255);
    }

    #[test]
    fn signals_map_to_128_plus_n() {
        assert_eq!(
            classify_status(signaled(libc::SIGSEGV)),
            128 + libc::SIGSEGV
        );
        assert_eq!(
            classify_status(signaled(libc::SIGKILL)),
            128 + libc::SIGKILL
        );
    }

    #[test]
    fn sigsys_maps_to_the_jail_status() {
        assert_eq!(classify_status(signaled(libc::SIGSYS)), ERR_JAIL);
    }

    #[test]
    fn enter_rejects_pid_namespaces() {
        let mut cage = Cage::new();
        cage.namespace_pids().unwrap();
        assert!(matches!(
            cage.enter(),
            Err(CageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn wait_without_a_child_is_an_error() {
        let mut cage = Cage::new();
        assert!(cage.wait().is_err());
        assert!(cage.kill().is_err());
    }

    #[test]
    fn static_path_rejects_capabilities() {
        let mut cage = Cage::new();
        cage.use_caps(1 << 5).unwrap();
        assert!(matches!(
            cage.run_static(Path::new("/bin/true"), &["true"]),
            Err(CageError::InvalidArgument(_))
        ));
    }
}
