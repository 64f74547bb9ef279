//! Resource-limit phase of the jail pipeline.
//!
//! Applied inline on the static-target path, and by the preload shim on the
//! dynamic path. CPU time is enforced twice: `RLIMIT_CPU` at one-second
//! granularity, and a profiling interval timer at the exact millisecond
//! budget as the finer-grained stop.

use nix::sys::resource::{Resource, setrlimit};

use crate::cage::Cage;
use crate::error::{CageError, CageResult};

/// `RLIMIT_CPU` soft/hard pair for a millisecond budget: the budget rounded
/// up to whole seconds, with one second of grace before the hard kill.
pub(crate) fn cpu_limit_secs(ms: u64) -> (u64, u64) {
    let soft = ms.div_ceil(1000);
    (soft, soft + 1)
}

fn arm_cpu_timer(ms: u64) -> CageResult<()> {
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
        },
    };
    let ret = unsafe { libc::setitimer(libc::ITIMER_PROF, &timer, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(CageError::kernel("setitimer(ITIMER_PROF)")(
            nix::errno::Errno::last(),
        ));
    }
    Ok(())
}

pub(crate) fn apply(cage: &Cage) -> CageResult<()> {
    if cage.flags.memory_limit {
        tracing::debug!(bytes = cage.memory_bytes, "limiting address space");
        setrlimit(Resource::RLIMIT_AS, cage.memory_bytes, cage.memory_bytes)
            .map_err(CageError::kernel("setrlimit(RLIMIT_AS)"))?;
    }
    if cage.flags.output_limit {
        tracing::debug!(bytes = cage.output_bytes, "limiting file output");
        setrlimit(Resource::RLIMIT_FSIZE, cage.output_bytes, cage.output_bytes)
            .map_err(CageError::kernel("setrlimit(RLIMIT_FSIZE)"))?;
        // No core dumps; a core file would dodge the output budget.
        setrlimit(Resource::RLIMIT_CORE, 0, 0)
            .map_err(CageError::kernel("setrlimit(RLIMIT_CORE)"))?;
    }
    if cage.flags.stack_limit {
        setrlimit(Resource::RLIMIT_STACK, cage.stack_bytes, cage.stack_bytes)
            .map_err(CageError::kernel("setrlimit(RLIMIT_STACK)"))?;
    }
    if cage.flags.time_limit {
        let (soft, hard) = cpu_limit_secs(cage.cpu_ms);
        tracing::debug!(ms = cage.cpu_ms, soft, hard, "limiting CPU time");
        setrlimit(Resource::RLIMIT_CPU, soft, hard)
            .map_err(CageError::kernel("setrlimit(RLIMIT_CPU)"))?;
        arm_cpu_timer(cage.cpu_ms)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_limit_rounds_up_to_whole_seconds() {
        assert_eq!(cpu_limit_secs(1), (1, 2));
        assert_eq!(cpu_limit_secs(999), (1, 2));
        assert_eq!(cpu_limit_secs(1000), (1, 2));
        assert_eq!(cpu_limit_secs(1001), (2, 3));
        assert_eq!(cpu_limit_secs(2500), (3, 4));
    }

    #[test]
    fn zero_budget_still_arms_a_hard_limit() {
        assert_eq!(cpu_limit_secs(0), (0, 1));
    }
}
