//! PID-namespace init: reaps descendants, enforces the wall-clock timeout,
//! and reports the root child's fate.
//!
//! The first process of a new PID namespace becomes the reaper for every
//! descendant. This supervisor waits with `wait4` so it can collect `rusage`
//! for the metadata file, arms an `alarm` for the wall-clock budget (a
//! sleeping target burns no CPU, so `RLIMIT_CPU` alone would never fire),
//! and finally `_exit`s with the classified status.
//!
//! Signal-handler state lives in process-wide atomics: the handlers may only
//! touch async-signal-safe machinery, so there is one cell for the override
//! signal, one for the root PID, and one for the status a `SIGTERM` should
//! propagate.

use std::io::Write;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::ERR_INIT;
use crate::cage::Cage;

/// Signal recorded by the alarm handler and reported in place of whatever
/// the root child was doing; zero while no override is in effect.
static OVERRIDE_SIGNAL: AtomicI32 = AtomicI32::new(0);

/// Process group the alarm handler kills: the root child after its `setsid`.
static ROOT_PID: AtomicI32 = AtomicI32::new(0);

/// Status `_exit`ed on SIGTERM; updated once the root child is reaped.
static EXIT_STATUS: AtomicI32 = AtomicI32::new(ERR_INIT);

extern "C" fn on_alarm(_signo: libc::c_int) {
    OVERRIDE_SIGNAL.store(libc::SIGXCPU, Ordering::SeqCst);
    let root = ROOT_PID.load(Ordering::SeqCst);
    if root > 0 {
        unsafe {
            libc::kill(-root, libc::SIGKILL);
        }
    }
}

extern "C" fn on_term(_signo: libc::c_int) {
    unsafe { libc::_exit(EXIT_STATUS.load(Ordering::SeqCst)) }
}

fn install_handler(signal: Signal, handler: extern "C" fn(libc::c_int)) {
    let action = SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Failure here would leave the jail without its timeout or terminate
    // path; treat it like every other init-layer failure.
    if unsafe { sigaction(signal, &action) }.is_err() {
        unsafe { libc::_exit(ERR_INIT) }
    }
}

fn now_realtime() -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    ts
}

/// Wall-clock microseconds between two samples, with nanosecond borrow.
fn elapsed_micros(start: libc::timespec, end: libc::timespec) -> i64 {
    let mut sec = end.tv_sec - start.tv_sec;
    let mut nsec = end.tv_nsec - start.tv_nsec;
    if nsec < 0 {
        sec -= 1;
        nsec += 1_000_000_000;
    }
    sec as i64 * 1_000_000 + nsec as i64 / 1_000
}

/// Wall-clock seconds to arm: the millisecond budget rounded up, plus one
/// second of slack so the CPU-side limits get to fire first.
fn alarm_secs(ms: u64) -> u32 {
    ((ms + 1999) / 1000) as u32
}

/// Classify the root child's fate as `(signal, exit_status)`. A zero signal
/// means a normal exit; `-1` means the root child was never reaped.
fn classify(override_signal: i32, root_status: Option<libc::c_int>) -> (i32, i32) {
    if override_signal != 0 {
        return (override_signal, ERR_INIT);
    }
    match root_status {
        Some(status) if libc::WIFEXITED(status) => (0, libc::WEXITSTATUS(status)),
        Some(status) if libc::WIFSIGNALED(status) => (libc::WTERMSIG(status), ERR_INIT),
        _ => (-1, ERR_INIT),
    }
}

/// Run as PID-namespace init. Never returns.
pub(crate) fn run(root: libc::pid_t, cage: &mut Cage) -> ! {
    let meta = cage.meta.take();
    let start = cage.flags.meta.then(now_realtime);

    ROOT_PID.store(root, Ordering::SeqCst);
    if cage.flags.time_limit {
        install_handler(Signal::SIGALRM, on_alarm);
        unsafe {
            libc::alarm(alarm_secs(cage.cpu_ms));
        }
    }
    install_handler(Signal::SIGTERM, on_term);

    // Reap until no descendants remain, remembering the root child.
    let mut root_status: Option<(libc::c_int, libc::rusage)> = None;
    loop {
        let mut status: libc::c_int = 0;
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        let pid = unsafe { libc::wait4(-1, &mut status, 0, &mut rusage) };
        if pid < 0 {
            let errno = nix::errno::Errno::last();
            if errno == nix::errno::Errno::EINTR {
                continue;
            }
            // ECHILD: everyone has been reaped.
            break;
        }
        if pid == root {
            root_status = Some((status, rusage));
            let (_, exit_status) = classify(
                OVERRIDE_SIGNAL.load(Ordering::SeqCst),
                Some(status),
            );
            EXIT_STATUS.store(exit_status, Ordering::SeqCst);
        }
    }

    let (signal, status) = classify(
        OVERRIDE_SIGNAL.load(Ordering::SeqCst),
        root_status.map(|(s, _)| s),
    );

    if let Some(mut file) = meta {
        let rusage = root_status.map(|(_, ru)| ru);
        let user_micros = rusage.map_or(0, |ru| {
            ru.ru_utime.tv_sec as i64 * 1_000_000 + ru.ru_utime.tv_usec as i64
        });
        let max_rss_bytes = rusage.map_or(0, |ru| ru.ru_maxrss as i64 * 1024);
        let wall_micros = start.map_or(0, |s| elapsed_micros(s, now_realtime()));

        let result = write_meta(&mut file, user_micros, wall_micros, max_rss_bytes, signal, status);
        if let Err(err) = result {
            tracing::warn!(error = %err, "failed to write execution metadata");
        }
    }

    if signal == libc::SIGSYS {
        tracing::warn!(pid = root, "illegal syscall killed the jailed process");
    }
    tracing::debug!(pid = root, signal, status, "PID-namespace init exiting");

    unsafe { libc::_exit(status) }
}

fn write_meta<W: Write>(
    out: &mut W,
    user_micros: i64,
    wall_micros: i64,
    max_rss_bytes: i64,
    signal: i32,
    status: i32,
) -> std::io::Result<()> {
    writeln!(out, "time:{user_micros}")?;
    writeln!(out, "time-wall:{wall_micros}")?;
    writeln!(out, "mem:{max_rss_bytes}")?;
    if signal != 0 {
        writeln!(out, "signal:{signal}")?;
    } else {
        writeln!(out, "status:{status}")?;
    }
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_rounds_up_with_slack() {
        assert_eq!(alarm_secs(1), 2);
        assert_eq!(alarm_secs(200), 2);
        assert_eq!(alarm_secs(1000), 2);
        assert_eq!(alarm_secs(1001), 3);
        assert_eq!(alarm_secs(5000), 6);
    }

    #[test]
    fn elapsed_borrows_nanoseconds() {
        let start = libc::timespec {
            tv_sec: 10,
            tv_nsec: 900_000_000,
        };
        let end = libc::timespec {
            tv_sec: 12,
            tv_nsec: 100_000_000,
        };
        assert_eq!(elapsed_micros(start, end), 1_200_000);
    }

    #[test]
    fn override_takes_precedence() {
        let exited_ok = 0 << 8;
        assert_eq!(classify(libc::SIGXCPU, Some(exited_ok)), (libc::SIGXCPU, ERR_INIT));
    }

    #[test]
    fn normal_exit_reports_the_code() {
        assert_eq!(classify(0, Some(42 << 8)), (0, 42));
    }

    #[test]
    fn death_by_signal_reports_the_signal() {
        assert_eq!(
            classify(0, Some(libc::SIGSEGV)),
            (libc::SIGSEGV, ERR_INIT)
        );
    }

    #[test]
    fn unreaped_root_is_flagged() {
        assert_eq!(classify(0, None), (-1, ERR_INIT));
    }

    #[test]
    fn meta_lines_for_a_signal_kill() {
        let mut out = Vec::new();
        write_meta(&mut out, 1500, 250_000, 4096 * 1024, libc::SIGXCPU, ERR_INIT).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            format!("time:1500\ntime-wall:250000\nmem:4194304\nsignal:{}\n", libc::SIGXCPU)
        );
    }

    #[test]
    fn meta_lines_for_a_normal_exit() {
        let mut out = Vec::new();
        write_meta(&mut out, 0, 1000, 0, 0, 7).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with("status:7\n"));
    }
}
