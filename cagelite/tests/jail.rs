//! Integration tests for the jail: builder constraints, the marshal
//! round-trip, path resolution, and unprivileged end-to-end runs over the
//! static path.
//!
//! Tests that fork serialize on a mutex: the driver is documented as not
//! thread-safe, and the test harness runs tests on multiple threads.

use std::io::Read;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use cagelite::{Cage, CageError};

static SPAWN_LOCK: Mutex<()> = Mutex::new(());

fn spawn_lock() -> MutexGuard<'static, ()> {
    // A test that panicked while holding the lock already failed; the
    // poisoned state carries no other meaning here.
    SPAWN_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// BUILDER CONSTRAINTS
// ============================================================================

#[test]
fn changing_to_root_is_rejected() {
    let mut cage = Cage::new();
    assert!(matches!(
        cage.change_uid(0),
        Err(CageError::InvalidArgument(_))
    ));
    assert!(matches!(
        cage.change_gid(0),
        Err(CageError::InvalidArgument(_))
    ));
}

#[test]
fn chroot_ordering_is_enforced() {
    let mut cage = Cage::new();
    assert!(cage.chroot_chdir(Path::new("/bin")).is_err());
    cage.enter_chroot(Path::new("/srv/jail")).unwrap();
    cage.chroot_chdir(Path::new("/bin")).unwrap();
    assert!(cage.enter_chroot(Path::new("/srv/other")).is_err());
}

#[test]
fn unknown_user_lookup_is_an_io_error() {
    let mut cage = Cage::new();
    assert!(matches!(
        cage.change_user("no-such-user-cagelite"),
        Err(CageError::Io(_))
    ));
}

// ============================================================================
// MARSHAL ROUND-TRIP
// ============================================================================

#[test]
fn chroot_and_bind_survive_the_round_trip() {
    let mut cage = Cage::new();
    cage.enter_chroot(Path::new("/srv/j")).unwrap();
    cage.chroot_chdir(Path::new("/bin")).unwrap();
    cage.bind(Path::new("/lib"), Path::new("/lib"), false).unwrap();

    let stream = cage.marshal().unwrap();
    assert_eq!(stream.len(), cage.size());

    let copy = Cage::unmarshal(&stream).unwrap();
    assert_eq!(copy.chrootdir(), Some(Path::new("/srv/j")));
    assert_eq!(copy.workdir(), Some(Path::new("/bin")));
    assert_eq!(copy.binds().len(), 1);
    assert_eq!(copy.binds()[0].src, Path::new("/lib"));
    assert_eq!(copy.binds()[0].dest, Path::new("/lib"));
    assert!(!copy.binds()[0].writable);
}

#[test]
fn truncated_streams_are_rejected() {
    let mut cage = Cage::new();
    cage.enter_chroot(Path::new("/srv/j")).unwrap();
    let stream = cage.marshal().unwrap();

    for cut in [0, 4, stream.len() / 2, stream.len() - 1] {
        assert!(
            matches!(
                Cage::unmarshal(&stream[..cut]),
                Err(CageError::TruncatedInput(_) | CageError::NoTerminator)
            ),
            "prefix of {cut} bytes was accepted"
        );
    }
}

// ============================================================================
// PATH RESOLUTION
// ============================================================================

#[test]
fn resolution_prefers_the_longest_bind_prefix() {
    let host = tempfile::tempdir().unwrap();
    let a = host.path().join("a");
    let ab = host.path().join("ab");
    std::fs::create_dir_all(&a).unwrap();
    std::fs::create_dir_all(&ab).unwrap();
    std::fs::write(a.join("y"), b"short").unwrap();
    std::fs::write(ab.join("z"), b"long").unwrap();

    let mut cage = Cage::new();
    cage.bind(&a, Path::new("/x"), false).unwrap();
    cage.bind(&ab, Path::new("/xy"), false).unwrap();

    assert_eq!(cage.get_path(Path::new("/xy/z")).unwrap(), ab.join("z"));
    assert_eq!(cage.get_path(Path::new("/x/y")).unwrap(), a.join("y"));
}

// ============================================================================
// END-TO-END, UNPRIVILEGED (static path)
// ============================================================================

#[test]
fn a_plain_target_exits_zero() {
    let _guard = spawn_lock();
    let mut cage = Cage::new();
    cage.run_static(Path::new("/bin/true"), &["true"]).unwrap();
    assert_eq!(cage.wait().unwrap(), 0);
}

#[test]
fn the_target_exit_code_is_reported() {
    let _guard = spawn_lock();
    let mut cage = Cage::new();
    cage.run_static(Path::new("/bin/sh"), &["sh", "-c", "exit 42"])
        .unwrap();
    assert_eq!(cage.wait().unwrap(), 42);
}

#[test]
fn death_by_signal_is_reported_as_128_plus_n() {
    let _guard = spawn_lock();
    let mut cage = Cage::new();
    cage.run_static(Path::new("/bin/sh"), &["sh", "-c", "kill -KILL $$"])
        .unwrap();
    assert_eq!(cage.wait().unwrap(), 128 + libc::SIGKILL);
}

#[test]
fn kill_terminates_a_sleeping_target() {
    let _guard = spawn_lock();
    let mut cage = Cage::new();
    cage.run_static(Path::new("/bin/sleep"), &["sleep", "30"])
        .unwrap();
    assert_eq!(cage.kill().unwrap(), 128 + libc::SIGTERM);
    // The handle is consumed: a second wait has nothing to wait for.
    assert!(cage.wait().is_err());
}

#[test]
fn stdio_pipes_carry_the_target_output() {
    let _guard = spawn_lock();
    let mut cage = Cage::new();
    let (pid, mut pipes) = cage
        .run_pid_pipes(
            Path::new("/bin/echo"),
            &["echo", "jailed hello"],
            false,
            true,
            false,
        )
        .unwrap();
    assert!(pid > 0);

    let mut output = String::new();
    pipes
        .stdout
        .take()
        .unwrap()
        .read_to_string(&mut output)
        .unwrap();
    assert_eq!(output, "jailed hello\n");
    assert_eq!(cage.wait().unwrap(), 0);
}

#[test]
fn cpu_limited_target_still_runs_to_completion() {
    let _guard = spawn_lock();
    let mut cage = Cage::new();
    cage.time_limit(5_000).unwrap();
    cage.output_limit(1 << 20).unwrap();
    cage.run_static(Path::new("/bin/true"), &["true"]).unwrap();
    assert_eq!(cage.wait().unwrap(), 0);
}

// ============================================================================
// END-TO-END, PRIVILEGED
// ============================================================================

#[test]
#[ignore = "requires root for CLONE_NEWPID"]
fn wall_clock_timeout_reports_sigxcpu_in_metadata() {
    let _guard = spawn_lock();
    let meta = tempfile::NamedTempFile::new().unwrap();

    let mut cage = Cage::new();
    cage.namespace_pids().unwrap();
    cage.time_limit(200).unwrap();
    cage.meta_file(meta.path()).unwrap();
    cage.run_static(Path::new("/bin/sleep"), &["sleep", "10"])
        .unwrap();

    assert_eq!(cage.wait().unwrap(), cagelite::ERR_INIT);
    let text = std::fs::read_to_string(meta.path()).unwrap();
    assert!(
        text.contains(&format!("signal:{}\n", libc::SIGXCPU)),
        "metadata was: {text}"
    );
}

#[test]
#[ignore = "requires root for chroot and namespaces"]
fn pid_namespaced_target_exits_normally() {
    let _guard = spawn_lock();
    let meta = tempfile::NamedTempFile::new().unwrap();

    let mut cage = Cage::new();
    cage.namespace_pids().unwrap();
    cage.meta_file(meta.path()).unwrap();
    cage.run_static(Path::new("/bin/true"), &["true"]).unwrap();

    assert_eq!(cage.wait().unwrap(), 0);
    let text = std::fs::read_to_string(meta.path()).unwrap();
    assert!(text.contains("status:0\n"), "metadata was: {text}");
}

#[test]
#[ignore = "requires a kernel permitting unprivileged no_new_privs seccomp"]
fn a_filtered_syscall_yields_the_jail_status() {
    use std::io::Write;

    let _guard = spawn_lock();

    // Enough for /bin/true to start and exit, but no uname.
    let mut policy = tempfile::NamedTempFile::new().unwrap();
    for name in [
        "read", "write", "close", "fstat", "mmap", "mprotect", "munmap", "brk",
        "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "pread64", "access",
        "openat", "newfstatat", "execve", "exit", "exit_group", "arch_prctl",
        "set_tid_address", "set_robust_list", "prlimit64", "getrandom", "rseq",
        "futex", "statx", "faccessat2", "mremap",
    ] {
        writeln!(policy, "{name}").unwrap();
    }

    let mut cage = Cage::new();
    cage.no_new_privs().unwrap();
    cage.parse_seccomp_filters(policy.path()).unwrap();
    cage.use_seccomp_filter().unwrap();
    cage.run_static(Path::new("/bin/uname"), &["uname"]).unwrap();

    assert_eq!(cage.wait().unwrap(), cagelite::ERR_JAIL);
}
