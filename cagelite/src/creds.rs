//! Credential and capability phase of the jail pipeline.
//!
//! Two responsibilities, both single-shot and fatal on failure (a silent
//! partial capability state is unacceptable):
//!
//! - `drop_ugid` moves the process to the target UID/GID and shapes the
//!   supplementary group set.
//! - `drop_caps` reduces the effective/permitted/inheritable sets to the
//!   requested mask and shrinks the bounding set to match. `CAP_SETPCAP` is
//!   held until the bounding drops are committed, then discarded unless the
//!   caller asked to keep it.
//!
//! When capabilities must survive a UID change, keep-caps plus locked
//! securebits are installed first; otherwise the kernel clears the permitted
//! set on `setuid`.

use std::ffi::CString;

use caps::{CapSet, Capability, CapsHashSet};

use crate::cage::Cage;
use crate::error::{CageError, CageResult};

// Securebits flags, <linux/securebits.h>.
const SECBIT_NOROOT: libc::c_ulong = 1 << 0;
const SECBIT_NO_SETUID_FIXUP: libc::c_ulong = 1 << 2;
const SECBIT_KEEP_CAPS: libc::c_ulong = 1 << 4;
const SECBIT_NO_CAP_AMBIENT_RAISE: libc::c_ulong = 1 << 6;
const SECURE_ALL_BITS: libc::c_ulong =
    SECBIT_NOROOT | SECBIT_NO_SETUID_FIXUP | SECBIT_KEEP_CAPS | SECBIT_NO_CAP_AMBIENT_RAISE;
const SECURE_ALL_LOCKS: libc::c_ulong = SECURE_ALL_BITS << 1;

/// Highest capability index the running kernel supports.
pub(crate) fn last_cap() -> CageResult<u8> {
    let raw = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .map_err(|e| CageError::Io(format!("reading cap_last_cap: {e}")))?;
    raw.trim()
        .parse::<u8>()
        .map_err(|e| CageError::Io(format!("parsing cap_last_cap: {e}")))
}

/// Arrange for capabilities to survive the upcoming UID change: keep-caps
/// plus every securebit and its lock, so the bit can never be flipped back.
pub(crate) fn enable_keep_caps() -> CageResult<()> {
    caps::securebits::set_keepcaps(true).map_err(CageError::kernel("keep-caps"))?;
    let ret = unsafe {
        libc::prctl(
            libc::PR_SET_SECUREBITS,
            SECURE_ALL_BITS | SECURE_ALL_LOCKS,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
            0 as libc::c_ulong,
        )
    };
    if ret != 0 {
        return Err(CageError::syscall("prctl(PR_SET_SECUREBITS)")(
            nix::errno::Errno::last(),
        ));
    }
    Ok(())
}

/// Move to the target UID/GID and shape the supplementary groups.
pub(crate) fn drop_ugid(cage: &Cage) -> CageResult<()> {
    if cage.flags.usergroups {
        // Caller validated that a user name is present.
        let name = cage.user.as_deref().ok_or_else(|| {
            CageError::InvalidArgument("usergroups requested without a user name".into())
        })?;
        let cname = CString::new(name)
            .map_err(|_| CageError::InvalidArgument("user name contains NUL".into()))?;
        tracing::debug!(user = name, "inheriting supplementary groups");
        nix::unistd::initgroups(&cname, nix::unistd::Gid::from_raw(cage.usergroups_gid))
            .map_err(CageError::syscall("initgroups"))?;
    } else if cage.flags.uid || cage.flags.gid {
        nix::unistd::setgroups(&[]).map_err(CageError::syscall("setgroups"))?;
    }

    if cage.flags.gid {
        let gid = nix::unistd::Gid::from_raw(cage.gid);
        tracing::debug!(gid = cage.gid, "dropping GID");
        nix::unistd::setresgid(gid, gid, gid).map_err(CageError::syscall("setresgid"))?;
    }
    if cage.flags.uid {
        let uid = nix::unistd::Uid::from_raw(cage.uid);
        tracing::debug!(uid = cage.uid, "dropping UID");
        nix::unistd::setresuid(uid, uid, uid).map_err(CageError::syscall("setresuid"))?;
    }
    Ok(())
}

/// Capabilities to retain while committing the drop: the requested mask,
/// clamped to the kernel bound, plus `CAP_SETPCAP` which is needed to shrink
/// the bounding set. Bits above `last` are ignored.
fn kept_set(mask: u64, last: u8) -> CapsHashSet {
    let mut keep = CapsHashSet::new();
    keep.insert(Capability::CAP_SETPCAP);
    for cap in caps::all() {
        let idx = cap.index();
        if idx <= last && mask & (1u64 << idx) != 0 {
            keep.insert(cap);
        }
    }
    keep
}

fn commit(set: &CapsHashSet) -> CageResult<()> {
    caps::set(None, CapSet::Effective, set).map_err(CageError::kernel("capset(effective)"))?;
    caps::set(None, CapSet::Permitted, set).map_err(CageError::kernel("capset(permitted)"))?;
    caps::set(None, CapSet::Inheritable, set)
        .map_err(CageError::kernel("capset(inheritable)"))?;
    Ok(())
}

/// Reduce every capability set to `mask` and shrink the bounding set.
pub(crate) fn drop_caps(mask: u64) -> CageResult<()> {
    let last = last_cap()?;
    let keep = kept_set(mask, last);
    tracing::debug!(mask = format_args!("{mask:#x}"), kept = keep.len(), "dropping capabilities");

    commit(&keep)?;

    // With CAP_SETPCAP still effective, push everything outside the mask out
    // of the bounding set so it can never be re-acquired.
    for cap in caps::all() {
        let idx = cap.index();
        if idx > last || mask & (1u64 << idx) != 0 {
            continue;
        }
        caps::drop(None, CapSet::Bounding, cap).map_err(CageError::kernel("capset(bounding)"))?;
    }

    if mask & (1u64 << Capability::CAP_SETPCAP.index()) == 0 {
        let mut final_set = keep;
        final_set.remove(&Capability::CAP_SETPCAP);
        commit(&final_set)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kept_set_always_holds_setpcap() {
        let keep = kept_set(0, 40);
        assert_eq!(keep.len(), 1);
        assert!(keep.contains(&Capability::CAP_SETPCAP));
    }

    #[test]
    fn kept_set_selects_requested_bits() {
        let mask = (1 << Capability::CAP_NET_BIND_SERVICE.index())
            | (1 << Capability::CAP_KILL.index());
        let keep = kept_set(mask, 40);
        assert!(keep.contains(&Capability::CAP_NET_BIND_SERVICE));
        assert!(keep.contains(&Capability::CAP_KILL));
        assert!(keep.contains(&Capability::CAP_SETPCAP));
        assert_eq!(keep.len(), 3);
    }

    #[test]
    fn kept_set_ignores_bits_above_kernel_bound() {
        // Pretend the kernel stops at CAP_KILL; higher requests are no-ops.
        let bound = Capability::CAP_KILL.index();
        let mask = (1 << Capability::CAP_KILL.index())
            | (1 << Capability::CAP_SYS_ADMIN.index());
        let keep = kept_set(mask, bound);
        assert!(keep.contains(&Capability::CAP_KILL));
        assert!(!keep.contains(&Capability::CAP_SYS_ADMIN));
    }

    #[test]
    fn securebits_constants_cover_bits_and_locks() {
        assert_eq!(SECURE_ALL_BITS, 0x55);
        assert_eq!(SECURE_ALL_LOCKS, 0xaa);
    }

    #[test]
    fn last_cap_reads_procfs() {
        let last = last_cap().unwrap();
        // Every kernel this library can run on has at least the POSIX caps.
        assert!(last >= Capability::CAP_SETPCAP.index());
    }
}
