//! Error types used across the cagelite jail.

use thiserror::Error;

/// Result type for jail operations.
pub type CageResult<T> = Result<T, CageError>;

#[derive(Debug, Error)]
pub enum CageError {
    /// A builder operation violated an inter-option constraint, or an
    /// argument was rejected before any state change.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An explicit allocation reservation failed.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// A marshalled segment was shorter than its header declared.
    #[error("truncated marshalled input: {0}")]
    TruncatedInput(String),

    /// A marshalled string ran past the end of the buffer without a NUL.
    #[error("marshalled string missing NUL terminator")]
    NoTerminator,

    #[error("payload too large: {0}")]
    TooLarge(String),

    /// A privilege-transformation syscall came back EPERM or EACCES: the
    /// caller lacks the privilege, where [`CageError::KernelRefused`] covers
    /// every other refusal.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// A syscall failed during privilege transformation. Callers inside the
    /// jailed child treat this as fatal; a half-dropped process must never
    /// reach `execve`.
    #[error("kernel refused {op}: {detail}")]
    KernelRefused { op: &'static str, detail: String },

    /// Produced by the front-end collaborator when the target binary cannot
    /// be executed at all.
    #[error("target not executable: {0}")]
    TargetNotExecutable(String),

    /// Produced by the preload-shim collaborator when the target was stopped
    /// by the syscall filter.
    #[error("target stopped by the jail syscall filter (signal {0})")]
    JailSyscall(i32),

    /// The path resolver hit a filesystem object it cannot translate.
    #[error("path not representable: {0}")]
    NotRepresentable(String),
}

impl CageError {
    /// Shorthand for mapping a failing syscall into [`CageError::KernelRefused`].
    pub(crate) fn kernel<E: std::fmt::Display>(op: &'static str) -> impl FnOnce(E) -> CageError {
        move |err| CageError::KernelRefused {
            op,
            detail: err.to_string(),
        }
    }

    /// Like [`CageError::kernel`], for sites that report a raw errno: the
    /// permission class becomes [`CageError::PermissionDenied`] so callers
    /// can tell a missing privilege apart from any other kernel refusal.
    pub(crate) fn syscall(op: &'static str) -> impl FnOnce(nix::errno::Errno) -> CageError {
        move |errno| match errno {
            nix::errno::Errno::EPERM | nix::errno::Errno::EACCES => {
                CageError::PermissionDenied(format!("{op}: {errno}"))
            }
            _ => CageError::KernelRefused {
                op,
                detail: errno.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for CageError {
    fn from(err: std::io::Error) -> Self {
        CageError::Io(err.to_string())
    }
}

impl From<std::collections::TryReserveError> for CageError {
    fn from(err: std::collections::TryReserveError) -> Self {
        CageError::OutOfMemory(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;

    #[test]
    fn permission_errnos_become_permission_denied() {
        assert!(matches!(
            CageError::syscall("unshare(CLONE_NEWNS)")(Errno::EPERM),
            CageError::PermissionDenied(_)
        ));
        assert!(matches!(
            CageError::syscall("mount(MS_BIND)")(Errno::EACCES),
            CageError::PermissionDenied(_)
        ));
    }

    #[test]
    fn other_errnos_stay_kernel_refusals() {
        assert!(matches!(
            CageError::syscall("setresuid")(Errno::EINVAL),
            CageError::KernelRefused { op: "setresuid", .. }
        ));
    }
}
