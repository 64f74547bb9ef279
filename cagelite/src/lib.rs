//! Cagelite process jail library.
//!
//! This crate confines an untrusted child program under a composable set of
//! Linux isolation mechanisms: UID/GID drops, capability restriction, mount /
//! PID / network namespaces, chroot with bind mounts, a read-only `/proc`,
//! seccomp (strict and BPF-filter modes), `no_new_privs`, resource limits,
//! and collection of execution metadata.
//!
//! # Usage
//!
//! ```ignore
//! let mut cage = Cage::new();
//! cage.change_uid(1000)?;
//! cage.namespace_pids()?;
//! cage.enter_chroot(Path::new("/srv/jail"))?;
//! cage.bind(Path::new("/lib"), Path::new("/lib"), false)?;
//! cage.run_static(Path::new("/bin/worker"), &["worker"])?;
//! let status = cage.wait()?;
//! ```
//!
//! # Pipeline ordering
//!
//! The privilege drop is a single-shot ordered sequence; the steps are
//! mutually blocking (capabilities that, once dropped, forbid later steps;
//! seccomp filters that, once installed, cut off the syscalls needed to drop
//! privileges). The driver in [`Cage::run`] / [`Cage::run_static`] owns that
//! ordering; see the `spawn` module for the contract.
//!
//! # Threading
//!
//! The driver is synchronous and explicitly not thread-safe with respect to
//! PID namespaces: the raw `clone` bypasses libc's fork locking, so a
//! multithreaded host must serialize jail launches on a single thread.

#[cfg(not(target_os = "linux"))]
compile_error!("cagelite only supports Linux targets");

pub mod cage;
mod codec;
pub mod error;
mod init;
mod mounts;
mod resolve;
mod rlimits;
pub mod seccomp;
mod spawn;

mod creds;

pub use cage::{BindMount, Cage};
pub use error::{CageError, CageResult};
pub use spawn::{PRELOAD_LIBRARY, StdioPipes};

/// Exit status reported by [`Cage::wait`] when the target was killed by the
/// seccomp filter (`SIGSYS`).
pub const ERR_JAIL: i32 = 253;

/// Exit status reported when the jail infrastructure itself failed, or when
/// the target died by a signal other than `SIGSYS` inside a PID namespace.
pub const ERR_INIT: i32 = 125;
