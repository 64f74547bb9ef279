//! Marshal codec for the jail configuration.
//!
//! The configuration crosses the `fork`+`execve` boundary through a pipe so
//! that the preload shim can re-enter it inside the new process image. The
//! stream is machine-local (native endianness, no cross-host exchange):
//!
//! ```text
//! [8-byte payload size]
//! [header: flag bits, scalars, filter length, bind count, limits]
//! [user?][chrootdir?][workdir?]          NUL-terminated byte strings
//! [filter bytes?]                        len * 8 bytes of BPF instructions
//! [bind 1: src NUL, dest NUL, writable u32] ... [bind n]
//! ```
//!
//! Optional fields appear in the payload iff their flag bit is set in the
//! header; the flag bits double as presence booleans. Marshal validates
//! everything before emitting a single byte, so it never partially writes.
//! Unmarshal either produces a complete record or returns an error with all
//! partially-built state dropped.

use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;

use seccompiler::{BpfProgram, sock_filter};

use crate::cage::{BindMount, Cage, Flags};
use crate::error::{CageError, CageResult};

/// Upper bound accepted from the size prefix. A real configuration is a few
/// kilobytes; anything near this is a corrupt or hostile stream.
const MAX_STREAM_BYTES: u64 = 4 * 1024 * 1024;

const SIZE_PREFIX_BYTES: usize = 8;

/// Fixed header: u32 flags + u32 uid + u32 gid + u32 usergroups_gid +
/// u64 caps + i32 initpid + u16 filter_len + u32 bind count + 4 * u64 limits.
const HEADER_BYTES: usize = 4 + 4 + 4 + 4 + 8 + 4 + 2 + 4 + 32;

const FILTER_INSN_BYTES: usize = 8;

// Wire bit positions for the flag set. Bit 21 marks the presence of the
// user-name payload, which is independent of the usergroups flag.
const FLAG_BITS: usize = 21;
const HAS_USER_BIT: u32 = 1 << FLAG_BITS;

fn flags_to_bits(flags: &Flags, has_user: bool) -> u32 {
    let ordered = [
        flags.uid,
        flags.gid,
        flags.caps,
        flags.vfs,
        flags.pids,
        flags.net,
        flags.seccomp_strict,
        flags.readonly_proc,
        flags.usergroups,
        flags.no_new_privs,
        flags.seccomp_filter,
        flags.log_seccomp_failures,
        flags.chroot,
        flags.mount_tmp,
        flags.chdir,
        flags.ptrace_disabled,
        flags.stack_limit,
        flags.time_limit,
        flags.output_limit,
        flags.memory_limit,
        flags.meta,
    ];
    let mut bits = 0u32;
    for (i, set) in ordered.into_iter().enumerate() {
        if set {
            bits |= 1 << i;
        }
    }
    if has_user {
        bits |= HAS_USER_BIT;
    }
    bits
}

fn bits_to_flags(bits: u32) -> (Flags, bool) {
    let bit = |i: usize| bits & (1 << i) != 0;
    let flags = Flags {
        uid: bit(0),
        gid: bit(1),
        caps: bit(2),
        vfs: bit(3),
        pids: bit(4),
        net: bit(5),
        seccomp_strict: bit(6),
        readonly_proc: bit(7),
        usergroups: bit(8),
        no_new_privs: bit(9),
        seccomp_filter: bit(10),
        log_seccomp_failures: bit(11),
        chroot: bit(12),
        mount_tmp: bit(13),
        chdir: bit(14),
        ptrace_disabled: bit(15),
        stack_limit: bit(16),
        time_limit: bit(17),
        output_limit: bit(18),
        memory_limit: bit(19),
        meta: bit(20),
    };
    (flags, bits & HAS_USER_BIT != 0)
}

fn string_bytes(s: &str) -> CageResult<&[u8]> {
    let bytes = s.as_bytes();
    if bytes.contains(&0) {
        return Err(CageError::InvalidArgument(format!(
            "string {s:?} contains an interior NUL"
        )));
    }
    Ok(bytes)
}

fn path_bytes(p: &std::path::Path) -> CageResult<&[u8]> {
    let bytes = p.as_os_str().as_bytes();
    if bytes.contains(&0) {
        return Err(CageError::InvalidArgument(format!(
            "path {p:?} contains an interior NUL"
        )));
    }
    Ok(bytes)
}

/// Sequential reader over the marshalled payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> CageResult<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(CageError::TruncatedInput(format!(
                "{what}: need {n} bytes, {} remain",
                self.buf.len() - self.pos
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u16(&mut self, what: &str) -> CageResult<u16> {
        Ok(u16::from_ne_bytes(self.take(2, what)?.try_into().unwrap()))
    }

    fn u32(&mut self, what: &str) -> CageResult<u32> {
        Ok(u32::from_ne_bytes(self.take(4, what)?.try_into().unwrap()))
    }

    fn i32(&mut self, what: &str) -> CageResult<i32> {
        Ok(i32::from_ne_bytes(self.take(4, what)?.try_into().unwrap()))
    }

    fn u64(&mut self, what: &str) -> CageResult<u64> {
        Ok(u64::from_ne_bytes(self.take(8, what)?.try_into().unwrap()))
    }

    /// A NUL-terminated byte string; consumes the terminator.
    fn cstr(&mut self) -> CageResult<&'a [u8]> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(CageError::NoTerminator)?;
        let out = &rest[..nul];
        self.pos += nul + 1;
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

impl Cage {
    /// Exact number of bytes [`Cage::marshal`] will emit, size prefix
    /// included.
    pub fn size(&self) -> usize {
        let mut n = SIZE_PREFIX_BYTES + HEADER_BYTES;
        if let Some(user) = &self.user {
            n += user.len() + 1;
        }
        if self.flags.chroot
            && let Some(dir) = &self.chrootdir
        {
            n += dir.as_os_str().len() + 1;
        }
        if self.flags.chdir
            && let Some(dir) = &self.workdir
        {
            n += dir.as_os_str().len() + 1;
        }
        if self.flags.seccomp_filter
            && let Some(filter) = &self.filter
        {
            n += filter.len() * FILTER_INSN_BYTES;
        }
        for bind in &self.binds {
            n += bind.src.as_os_str().len() + 1;
            n += bind.dest.as_os_str().len() + 1;
            n += 4;
        }
        n
    }

    /// Serialize the record. Emits exactly [`Cage::size`] bytes or nothing.
    pub fn marshal(&self) -> CageResult<Vec<u8>> {
        if self.flags.seccomp_filter {
            let len = self.filter.as_ref().map_or(0, Vec::len);
            if len > u16::MAX as usize {
                return Err(CageError::TooLarge(format!(
                    "filter program has {len} instructions"
                )));
            }
        }
        if self.binds.len() > u32::MAX as usize {
            return Err(CageError::TooLarge("too many bind entries".into()));
        }

        // Validate every string before writing anything.
        let user = self.user.as_deref().map(string_bytes).transpose()?;
        let chrootdir = self
            .chrootdir
            .as_deref()
            .filter(|_| self.flags.chroot)
            .map(path_bytes)
            .transpose()?;
        let workdir = self
            .workdir
            .as_deref()
            .filter(|_| self.flags.chdir)
            .map(path_bytes)
            .transpose()?;
        for bind in &self.binds {
            path_bytes(&bind.src)?;
            path_bytes(&bind.dest)?;
        }

        let total = self.size();
        let mut buf = Vec::new();
        buf.try_reserve_exact(total)?;

        buf.extend_from_slice(&((total - SIZE_PREFIX_BYTES) as u64).to_ne_bytes());
        buf.extend_from_slice(&flags_to_bits(&self.flags, user.is_some()).to_ne_bytes());
        buf.extend_from_slice(&self.uid.to_ne_bytes());
        buf.extend_from_slice(&self.gid.to_ne_bytes());
        buf.extend_from_slice(&self.usergroups_gid.to_ne_bytes());
        buf.extend_from_slice(&self.caps_mask.to_ne_bytes());
        buf.extend_from_slice(&self.initpid.to_ne_bytes());
        let filter_len = self
            .filter
            .as_ref()
            .filter(|_| self.flags.seccomp_filter)
            .map_or(0, |f| f.len() as u16);
        buf.extend_from_slice(&filter_len.to_ne_bytes());
        buf.extend_from_slice(&(self.binds.len() as u32).to_ne_bytes());
        buf.extend_from_slice(&self.stack_bytes.to_ne_bytes());
        buf.extend_from_slice(&self.cpu_ms.to_ne_bytes());
        buf.extend_from_slice(&self.memory_bytes.to_ne_bytes());
        buf.extend_from_slice(&self.output_bytes.to_ne_bytes());

        for segment in [user, chrootdir, workdir].into_iter().flatten() {
            buf.extend_from_slice(segment);
            buf.push(0);
        }
        if filter_len > 0
            && let Some(filter) = &self.filter
        {
            for insn in filter {
                buf.extend_from_slice(&insn.code.to_ne_bytes());
                buf.push(insn.jt);
                buf.push(insn.jf);
                buf.extend_from_slice(&insn.k.to_ne_bytes());
            }
        }
        for bind in &self.binds {
            buf.extend_from_slice(bind.src.as_os_str().as_bytes());
            buf.push(0);
            buf.extend_from_slice(bind.dest.as_os_str().as_bytes());
            buf.push(0);
            buf.extend_from_slice(&u32::from(bind.writable).to_ne_bytes());
        }

        debug_assert_eq!(buf.len(), total);
        Ok(buf)
    }

    /// Reconstruct a record from a complete marshalled stream (size prefix
    /// included). The metadata file handle does not cross the boundary; its
    /// flag is carried but the handle is absent on this side.
    pub fn unmarshal(buf: &[u8]) -> CageResult<Cage> {
        if buf.len() < SIZE_PREFIX_BYTES {
            return Err(CageError::TruncatedInput(format!(
                "stream of {} bytes is shorter than the size prefix",
                buf.len()
            )));
        }
        let declared = u64::from_ne_bytes(buf[..SIZE_PREFIX_BYTES].try_into().unwrap());
        if declared > MAX_STREAM_BYTES {
            return Err(CageError::TooLarge(format!(
                "declared payload of {declared} bytes"
            )));
        }
        let body = &buf[SIZE_PREFIX_BYTES..];
        if (body.len() as u64) < declared {
            return Err(CageError::TruncatedInput(format!(
                "declared {declared} payload bytes, got {}",
                body.len()
            )));
        }
        if (body.len() as u64) > declared {
            return Err(CageError::InvalidArgument(format!(
                "{} trailing bytes after declared payload",
                body.len() as u64 - declared
            )));
        }

        let mut r = Reader::new(body);
        let bits = r.u32("flags")?;
        let (flags, has_user) = bits_to_flags(bits);

        let uid = r.u32("uid")?;
        let gid = r.u32("gid")?;
        let usergroups_gid = r.u32("usergroups gid")?;
        let caps_mask = r.u64("caps mask")?;
        let initpid = r.i32("initpid")?;
        let filter_len = r.u16("filter length")? as usize;
        let bind_count = r.u32("bind count")? as usize;
        let stack_bytes = r.u64("stack limit")?;
        let cpu_ms = r.u64("time limit")?;
        let memory_bytes = r.u64("memory limit")?;
        let output_bytes = r.u64("output limit")?;

        let user = if has_user {
            let bytes = r.cstr()?;
            let name = String::from_utf8(bytes.to_vec())
                .map_err(|_| CageError::InvalidArgument("user name is not UTF-8".into()))?;
            Some(name)
        } else {
            None
        };
        let chrootdir = if flags.chroot {
            Some(PathBuf::from(std::ffi::OsString::from_vec(r.cstr()?.to_vec())))
        } else {
            None
        };
        let workdir = if flags.chdir {
            Some(PathBuf::from(std::ffi::OsString::from_vec(r.cstr()?.to_vec())))
        } else {
            None
        };

        let filter = if flags.seccomp_filter && filter_len > 0 {
            let bytes = r.take(filter_len * FILTER_INSN_BYTES, "filter program")?;
            let mut program: BpfProgram = Vec::new();
            program.try_reserve_exact(filter_len)?;
            for chunk in bytes.chunks_exact(FILTER_INSN_BYTES) {
                program.push(sock_filter {
                    code: u16::from_ne_bytes(chunk[0..2].try_into().unwrap()),
                    jt: chunk[2],
                    jf: chunk[3],
                    k: u32::from_ne_bytes(chunk[4..8].try_into().unwrap()),
                });
            }
            Some(program)
        } else {
            None
        };

        let mut binds = Vec::new();
        binds.try_reserve_exact(bind_count.min(4096))?;
        for _ in 0..bind_count {
            let src = PathBuf::from(std::ffi::OsString::from_vec(r.cstr()?.to_vec()));
            let dest = PathBuf::from(std::ffi::OsString::from_vec(r.cstr()?.to_vec()));
            let writable = r.u32("bind writable flag")? != 0;
            binds.push(BindMount {
                src,
                dest,
                writable,
            });
        }

        if r.remaining() != 0 {
            return Err(CageError::InvalidArgument(format!(
                "{} unconsumed bytes inside declared payload",
                r.remaining()
            )));
        }

        Ok(Cage {
            flags,
            uid,
            gid,
            usergroups_gid,
            caps_mask,
            initpid,
            user,
            chrootdir,
            workdir,
            filter,
            binds,
            stack_bytes,
            cpu_ms,
            memory_bytes,
            output_bytes,
            meta: None,
        })
    }

    /// Marshal into a file descriptor, typically the write end of the config
    /// pipe. Writes the complete stream or fails without side effects beyond
    /// the partial pipe write the kernel already accepted.
    pub fn to_fd(&self, fd: std::os::fd::RawFd) -> CageResult<()> {
        let buf = self.marshal()?;
        write_all_fd(fd, &buf)
    }

    /// Counterpart of [`Cage::to_fd`]: read one complete marshalled record
    /// from a file descriptor. Uses only raw `read` so the jailed child can
    /// call it between `fork` and `execve`.
    pub fn from_fd(fd: std::os::fd::RawFd) -> CageResult<Cage> {
        let mut prefix = [0u8; SIZE_PREFIX_BYTES];
        read_exact_fd(fd, &mut prefix)?;
        let declared = u64::from_ne_bytes(prefix);
        if declared > MAX_STREAM_BYTES {
            return Err(CageError::TooLarge(format!(
                "declared payload of {declared} bytes"
            )));
        }
        let mut buf = Vec::new();
        buf.try_reserve_exact(SIZE_PREFIX_BYTES + declared as usize)?;
        buf.extend_from_slice(&prefix);
        buf.resize(SIZE_PREFIX_BYTES + declared as usize, 0);
        read_exact_fd(fd, &mut buf[SIZE_PREFIX_BYTES..])?;
        Cage::unmarshal(&buf)
    }
}

fn write_all_fd(fd: std::os::fd::RawFd, mut buf: &[u8]) -> CageResult<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let errno = nix::errno::Errno::last();
            if errno == nix::errno::Errno::EINTR {
                continue;
            }
            return Err(CageError::kernel("write")(errno));
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

fn read_exact_fd(fd: std::os::fd::RawFd, mut buf: &mut [u8]) -> CageResult<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            let errno = nix::errno::Errno::last();
            if errno == nix::errno::Errno::EINTR {
                continue;
            }
            return Err(CageError::kernel("read")(errno));
        }
        if n == 0 {
            return Err(CageError::TruncatedInput(format!(
                "pipe closed with {} bytes outstanding",
                buf.len()
            )));
        }
        buf = &mut buf[n as usize..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sample_cage() -> Cage {
        let mut cage = Cage::new();
        cage.change_uid(1000).unwrap();
        cage.change_gid(1000).unwrap();
        cage.namespace_pids().unwrap();
        cage.namespace_net().unwrap();
        cage.no_new_privs().unwrap();
        cage.enter_chroot(Path::new("/srv/j")).unwrap();
        cage.chroot_chdir(Path::new("/bin")).unwrap();
        cage.bind(Path::new("/lib"), Path::new("/lib"), false).unwrap();
        cage.bind(Path::new("/data"), Path::new("/data"), true).unwrap();
        cage.mount_tmp().unwrap();
        cage.time_limit(250).unwrap();
        cage.memory_limit(64 << 20).unwrap();
        cage.set_seccomp_filter(vec![
            sock_filter {
                code: 0x20,
                jt: 0,
                jf: 0,
                k: 0,
            },
            sock_filter {
                code: 0x06,
                jt: 0,
                jf: 0,
                k: 0x7fff_0000,
            },
        ])
        .unwrap();
        cage
    }

    #[test]
    fn marshal_writes_exactly_size_bytes() {
        let cage = sample_cage();
        let buf = cage.marshal().unwrap();
        assert_eq!(buf.len(), cage.size());
    }

    #[test]
    fn round_trip_preserves_semantics() {
        let cage = sample_cage();
        let copy = Cage::unmarshal(&cage.marshal().unwrap()).unwrap();

        assert_eq!(copy.flags, cage.flags);
        assert_eq!(copy.uid, 1000);
        assert_eq!(copy.gid, 1000);
        assert_eq!(copy.chrootdir.as_deref(), Some(Path::new("/srv/j")));
        assert_eq!(copy.workdir.as_deref(), Some(Path::new("/bin")));
        assert_eq!(copy.binds, cage.binds);
        assert_eq!(copy.filter, cage.filter);
        assert_eq!(copy.cpu_ms, 250);
        assert_eq!(copy.memory_bytes, 64 << 20);
    }

    #[test]
    fn round_trip_of_minimal_record() {
        let cage = Cage::new();
        let copy = Cage::unmarshal(&cage.marshal().unwrap()).unwrap();
        assert_eq!(copy.flags, cage.flags);
        assert!(copy.user.is_none());
        assert!(copy.chrootdir.is_none());
        assert!(copy.filter.is_none());
        assert!(copy.binds.is_empty());
    }

    #[test]
    fn every_proper_prefix_fails_as_truncated() {
        let cage = sample_cage();
        let buf = cage.marshal().unwrap();
        for cut in 0..buf.len() {
            let err = Cage::unmarshal(&buf[..cut]).unwrap_err();
            assert!(
                matches!(
                    err,
                    CageError::TruncatedInput(_) | CageError::NoTerminator
                ),
                "prefix of {cut} bytes gave {err:?}"
            );
        }
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let cage = sample_cage();
        let mut buf = cage.marshal().unwrap();
        buf.push(0xAA);
        assert!(matches!(
            Cage::unmarshal(&buf),
            Err(CageError::InvalidArgument(_))
        ));
    }

    #[test]
    fn absurd_declared_size_is_rejected() {
        let mut buf = (u64::MAX).to_ne_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 16]);
        assert!(matches!(Cage::unmarshal(&buf), Err(CageError::TooLarge(_))));
    }

    #[test]
    fn bind_order_survives_the_round_trip() {
        let mut cage = Cage::new();
        for i in 0..8 {
            cage.bind(
                Path::new(&format!("/host/{i}")),
                Path::new(&format!("/jail/{i}")),
                i % 2 == 0,
            )
            .unwrap();
        }
        let copy = Cage::unmarshal(&cage.marshal().unwrap()).unwrap();
        assert_eq!(copy.binds, cage.binds);
    }

    #[test]
    fn fd_round_trip_through_a_pipe() {
        use std::os::fd::AsRawFd;

        let cage = sample_cage();
        let (rx, tx) = nix::unistd::pipe().unwrap();
        cage.to_fd(tx.as_raw_fd()).unwrap();
        drop(tx);
        let copy = Cage::from_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(copy.flags, cage.flags);
        assert_eq!(copy.binds, cage.binds);
        assert_eq!(copy.filter, cage.filter);
    }
}
