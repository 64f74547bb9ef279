//! Seccomp phase of the jail pipeline.
//!
//! Three kernel mechanisms, applied at different points of the pipeline:
//!
//! - **`no_new_privs`**: set early, before the credential drop, so `execve`
//!   can never re-grant privileges. Also the precondition for installing a
//!   filter without `CAP_SYS_ADMIN`.
//! - **Filter mode**: a BPF allow-list compiled with `seccompiler`. The
//!   default action is `Trap`, so a rejected syscall raises `SIGSYS` and
//!   kills the target. When `no_new_privs` is off the filter is installed
//!   *before* the credential drop (the install needs privileges), which
//!   means the policy must admit the credential-change syscalls.
//! - **Strict mode**: only `read`, `write`, `exit` and `sigreturn` survive.
//!   Installed last of all; it forbids nearly every subsequent syscall.
//!
//! ## Policy files
//!
//! A policy file is a newline-separated allow-list of syscall names, with
//! `#` comments and blank lines ignored. Names the current architecture
//! does not know are skipped with a warning, so one policy can serve both
//! x86_64 and aarch64.

use std::collections::BTreeMap;
use std::path::Path;

use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, SeccompRule};

use crate::error::{CageError, CageResult};

/// Set the `no_new_privs` process bit. Irreversible.
pub(crate) fn set_no_new_privs() -> CageResult<()> {
    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_NO_NEW_PRIVS,
            1 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if ret != 0 {
        return Err(CageError::kernel("prctl(PR_SET_NO_NEW_PRIVS)")(
            nix::errno::Errno::last(),
        ));
    }
    Ok(())
}

/// Enter strict-mode seccomp. Nothing but read/write/exit/sigreturn is
/// permitted afterwards, so the caller must `execve` immediately.
pub(crate) fn enter_strict() -> CageResult<()> {
    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            libc::SECCOMP_MODE_STRICT as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if ret != 0 {
        return Err(CageError::kernel("prctl(PR_SET_SECCOMP)")(
            nix::errno::Errno::last(),
        ));
    }
    Ok(())
}

/// Install the compiled filter program on the current process.
///
/// With `log_failures` a minimal `SIGSYS` reporter is installed first so a
/// filter kill leaves a trace on stderr; the full audit-record reader is an
/// external collaborator.
pub(crate) fn install_filter(program: &BpfProgram, log_failures: bool) -> CageResult<()> {
    if log_failures {
        tracing::warn!(
            "seccomp failure logging enabled; rejected syscalls will be reported on stderr"
        );
        install_sigsys_reporter()?;
    }
    seccompiler::apply_filter(program)
        .map_err(|e| CageError::kernel("seccomp(SECCOMP_SET_MODE_FILTER)")(e))
}

extern "C" fn sigsys_reporter(_signo: libc::c_int) {
    // Async-signal-safe: a single write(2), no allocation.
    const MSG: &[u8] = b"cagelite: syscall rejected by filter\n";
    unsafe {
        libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
    }
}

fn install_sigsys_reporter() -> CageResult<()> {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

    let action = SigAction::new(
        SigHandler::Handler(sigsys_reporter),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGSYS, &action) }
        .map_err(CageError::kernel("sigaction(SIGSYS)"))?;
    Ok(())
}

/// Compile a policy file into a BPF filter program: listed syscalls are
/// allowed, everything else traps with `SIGSYS`.
pub fn load_policy(path: &Path) -> CageResult<BpfProgram> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| CageError::Io(format!("reading policy {path:?}: {e}")))?;

    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    let mut unmapped = Vec::new();
    for line in text.lines() {
        let name = line.split('#').next().unwrap_or("").trim();
        if name.is_empty() {
            continue;
        }
        match syscall_nr(name) {
            // Empty rule vector means the syscall is allowed unconditionally.
            Some(nr) => {
                rules.insert(nr, vec![]);
            }
            None => unmapped.push(name.to_owned()),
        }
    }
    if !unmapped.is_empty() {
        tracing::warn!(
            unmapped_syscalls = ?unmapped,
            "policy names not known on this architecture, skipping"
        );
    }
    if rules.is_empty() {
        return Err(CageError::InvalidArgument(format!(
            "policy {path:?} allows no syscalls"
        )));
    }

    compile_allowlist(rules)
}

fn compile_allowlist(rules: BTreeMap<i64, Vec<SeccompRule>>) -> CageResult<BpfProgram> {
    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Trap,
        SeccompAction::Allow,
        target_arch(),
    )
    .map_err(|e| CageError::InvalidArgument(format!("building seccomp filter: {e}")))?;

    let program: BpfProgram = filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| {
            CageError::InvalidArgument(format!("compiling seccomp filter to BPF: {e}"))
        })?;

    if program.len() > u16::MAX as usize {
        return Err(CageError::TooLarge(format!(
            "compiled filter has {} instructions",
            program.len()
        )));
    }
    Ok(program)
}

fn target_arch() -> seccompiler::TargetArch {
    #[cfg(target_arch = "x86_64")]
    {
        seccompiler::TargetArch::x86_64
    }
    #[cfg(target_arch = "aarch64")]
    {
        seccompiler::TargetArch::aarch64
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        compile_error!("unsupported architecture for seccomp")
    }
}

/// Map a policy syscall name to its number, `None` when the syscall does not
/// exist on this architecture.
fn syscall_nr(name: &str) -> Option<i64> {
    Some(match name {
        // Memory management
        "brk" => libc::SYS_brk,
        "mmap" => libc::SYS_mmap,
        "munmap" => libc::SYS_munmap,
        "mprotect" => libc::SYS_mprotect,
        "madvise" => libc::SYS_madvise,
        "mremap" => libc::SYS_mremap,
        "msync" => libc::SYS_msync,
        "mincore" => libc::SYS_mincore,
        "mlock" => libc::SYS_mlock,
        "munlock" => libc::SYS_munlock,
        "membarrier" => libc::SYS_membarrier,

        // File I/O
        "read" => libc::SYS_read,
        "write" => libc::SYS_write,
        "readv" => libc::SYS_readv,
        "writev" => libc::SYS_writev,
        "pread64" => libc::SYS_pread64,
        "pwrite64" => libc::SYS_pwrite64,
        "openat" => libc::SYS_openat,
        "close" => libc::SYS_close,
        "lseek" => libc::SYS_lseek,
        "fstat" => libc::SYS_fstat,
        "newfstatat" => libc::SYS_newfstatat,
        "statx" => libc::SYS_statx,
        "fcntl" => libc::SYS_fcntl,
        "flock" => libc::SYS_flock,
        "fsync" => libc::SYS_fsync,
        "fdatasync" => libc::SYS_fdatasync,
        "truncate" => libc::SYS_truncate,
        "ftruncate" => libc::SYS_ftruncate,
        "fallocate" => libc::SYS_fallocate,
        "getdents64" => libc::SYS_getdents64,
        "getcwd" => libc::SYS_getcwd,
        "chdir" => libc::SYS_chdir,
        "fchdir" => libc::SYS_fchdir,
        "readlinkat" => libc::SYS_readlinkat,
        "faccessat" => libc::SYS_faccessat,
        "faccessat2" => libc::SYS_faccessat2,
        "mkdirat" => libc::SYS_mkdirat,
        "unlinkat" => libc::SYS_unlinkat,
        "renameat" => libc::SYS_renameat,
        "linkat" => libc::SYS_linkat,
        "symlinkat" => libc::SYS_symlinkat,
        "fchmod" => libc::SYS_fchmod,
        "fchmodat" => libc::SYS_fchmodat,
        "fchown" => libc::SYS_fchown,
        "fchownat" => libc::SYS_fchownat,
        "umask" => libc::SYS_umask,
        "utimensat" => libc::SYS_utimensat,
        "dup" => libc::SYS_dup,
        "dup3" => libc::SYS_dup3,
        "pipe2" => libc::SYS_pipe2,
        "sendfile" => libc::SYS_sendfile,
        "splice" => libc::SYS_splice,
        "copy_file_range" => libc::SYS_copy_file_range,
        "memfd_create" => libc::SYS_memfd_create,

        // Events and polling
        "epoll_create1" => libc::SYS_epoll_create1,
        "epoll_ctl" => libc::SYS_epoll_ctl,
        "epoll_pwait" => libc::SYS_epoll_pwait,
        "eventfd2" => libc::SYS_eventfd2,
        "ppoll" => libc::SYS_ppoll,
        "pselect6" => libc::SYS_pselect6,
        "timerfd_create" => libc::SYS_timerfd_create,
        "timerfd_settime" => libc::SYS_timerfd_settime,
        "timerfd_gettime" => libc::SYS_timerfd_gettime,

        // Time
        "clock_gettime" => libc::SYS_clock_gettime,
        "clock_getres" => libc::SYS_clock_getres,
        "clock_nanosleep" => libc::SYS_clock_nanosleep,
        "nanosleep" => libc::SYS_nanosleep,
        "gettimeofday" => libc::SYS_gettimeofday,
        "setitimer" => libc::SYS_setitimer,
        "getitimer" => libc::SYS_getitimer,

        // Signals
        "rt_sigaction" => libc::SYS_rt_sigaction,
        "rt_sigprocmask" => libc::SYS_rt_sigprocmask,
        "rt_sigreturn" => libc::SYS_rt_sigreturn,
        "rt_sigpending" => libc::SYS_rt_sigpending,
        "rt_sigsuspend" => libc::SYS_rt_sigsuspend,
        "rt_sigtimedwait" => libc::SYS_rt_sigtimedwait,
        "sigaltstack" => libc::SYS_sigaltstack,
        "kill" => libc::SYS_kill,
        "tkill" => libc::SYS_tkill,
        "tgkill" => libc::SYS_tgkill,

        // Process management
        "clone" => libc::SYS_clone,
        "clone3" => libc::SYS_clone3,
        "execve" => libc::SYS_execve,
        "execveat" => libc::SYS_execveat,
        "exit" => libc::SYS_exit,
        "exit_group" => libc::SYS_exit_group,
        "wait4" => libc::SYS_wait4,
        "waitid" => libc::SYS_waitid,
        "futex" => libc::SYS_futex,
        "set_tid_address" => libc::SYS_set_tid_address,
        "set_robust_list" => libc::SYS_set_robust_list,
        "get_robust_list" => libc::SYS_get_robust_list,
        "rseq" => libc::SYS_rseq,
        "sched_yield" => libc::SYS_sched_yield,
        "sched_getaffinity" => libc::SYS_sched_getaffinity,
        "sched_setaffinity" => libc::SYS_sched_setaffinity,
        "getpriority" => libc::SYS_getpriority,
        "setpriority" => libc::SYS_setpriority,
        "restart_syscall" => libc::SYS_restart_syscall,
        "setsid" => libc::SYS_setsid,
        "setpgid" => libc::SYS_setpgid,
        "getpgid" => libc::SYS_getpgid,

        // Identity
        "getpid" => libc::SYS_getpid,
        "getppid" => libc::SYS_getppid,
        "gettid" => libc::SYS_gettid,
        "getuid" => libc::SYS_getuid,
        "geteuid" => libc::SYS_geteuid,
        "getgid" => libc::SYS_getgid,
        "getegid" => libc::SYS_getegid,
        "getgroups" => libc::SYS_getgroups,
        "setgroups" => libc::SYS_setgroups,
        "setuid" => libc::SYS_setuid,
        "setgid" => libc::SYS_setgid,
        "setresuid" => libc::SYS_setresuid,
        "setresgid" => libc::SYS_setresgid,
        "getresuid" => libc::SYS_getresuid,
        "getresgid" => libc::SYS_getresgid,
        "capget" => libc::SYS_capget,
        "capset" => libc::SYS_capset,
        "prctl" => libc::SYS_prctl,

        // Resources
        "getrlimit" => libc::SYS_getrlimit,
        "setrlimit" => libc::SYS_setrlimit,
        "prlimit64" => libc::SYS_prlimit64,
        "getrusage" => libc::SYS_getrusage,
        "sysinfo" => libc::SYS_sysinfo,
        "times" => libc::SYS_times,

        // Networking
        "socket" => libc::SYS_socket,
        "socketpair" => libc::SYS_socketpair,
        "connect" => libc::SYS_connect,
        "accept" => libc::SYS_accept,
        "accept4" => libc::SYS_accept4,
        "bind" => libc::SYS_bind,
        "listen" => libc::SYS_listen,
        "sendto" => libc::SYS_sendto,
        "recvfrom" => libc::SYS_recvfrom,
        "sendmsg" => libc::SYS_sendmsg,
        "recvmsg" => libc::SYS_recvmsg,
        "shutdown" => libc::SYS_shutdown,
        "getsockname" => libc::SYS_getsockname,
        "getpeername" => libc::SYS_getpeername,
        "getsockopt" => libc::SYS_getsockopt,
        "setsockopt" => libc::SYS_setsockopt,

        // Misc
        "uname" => libc::SYS_uname,
        "getrandom" => libc::SYS_getrandom,
        "ioctl" => libc::SYS_ioctl,

        _ => return legacy_syscall_nr(name),
    })
}

/// Syscalls that exist on x86_64 but were never given numbers on aarch64.
#[cfg(target_arch = "x86_64")]
fn legacy_syscall_nr(name: &str) -> Option<i64> {
    Some(match name {
        "open" => libc::SYS_open,
        "stat" => libc::SYS_stat,
        "lstat" => libc::SYS_lstat,
        "access" => libc::SYS_access,
        "readlink" => libc::SYS_readlink,
        "mkdir" => libc::SYS_mkdir,
        "rmdir" => libc::SYS_rmdir,
        "unlink" => libc::SYS_unlink,
        "rename" => libc::SYS_rename,
        "chmod" => libc::SYS_chmod,
        "chown" => libc::SYS_chown,
        "dup2" => libc::SYS_dup2,
        "pipe" => libc::SYS_pipe,
        "poll" => libc::SYS_poll,
        "select" => libc::SYS_select,
        "epoll_create" => libc::SYS_epoll_create,
        "epoll_wait" => libc::SYS_epoll_wait,
        "getdents" => libc::SYS_getdents,
        "fork" => libc::SYS_fork,
        "vfork" => libc::SYS_vfork,
        "alarm" => libc::SYS_alarm,
        "time" => libc::SYS_time,
        "arch_prctl" => libc::SYS_arch_prctl,
        _ => return None,
    })
}

#[cfg(not(target_arch = "x86_64"))]
fn legacy_syscall_nr(_name: &str) -> Option<i64> {
    None
}
