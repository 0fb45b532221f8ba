//! Process-wide descriptor metadata
//!
//! One entry per observed descriptor: send/recv timeouts, socket-ness
//! and closed/non-blocking flags. The socket type never caches
//! timeouts privately; it reads and writes through here, which is
//! also what the non-blocking hook layer consults, so both always
//! observe the same configuration.
//!
//! Entries are created on first observation of a descriptor and
//! removed when it is closed. A descriptor number the kernel reuses
//! gets a fresh entry on its next observation.

use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use crate::errno;
use strand_core::sdebug;

/// Which of the two per-descriptor timeouts is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Send,
    Recv,
}

/// Metadata for one descriptor. All fields are independently atomic;
/// the entry itself is shared via `Arc` across fibers and threads.
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    closed: AtomicBool,
    nonblocking: AtomicBool,
    /// Milliseconds; -1 means no timeout configured.
    send_timeout_ms: AtomicI64,
    recv_timeout_ms: AtomicI64,
}

impl FdCtx {
    /// Probe a live descriptor. Sockets are switched to non-blocking
    /// here: every I/O path in this crate relies on would-block
    /// returns instead of kernel blocking.
    fn probe(fd: RawFd) -> Option<FdCtx> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::fstat(fd, &mut stat) };
        if ret != 0 {
            sdebug!("fstat({}) errno={}", fd, errno());
            return None;
        }
        let is_socket = (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut nonblocking = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && flags & libc::O_NONBLOCK == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            nonblocking = true;
        }

        Some(FdCtx {
            fd,
            is_socket,
            closed: AtomicBool::new(false),
            nonblocking: AtomicBool::new(nonblocking),
            send_timeout_ms: AtomicI64::new(-1),
            recv_timeout_ms: AtomicI64::new(-1),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_nonblocking(&self, value: bool) {
        self.nonblocking.store(value, Ordering::Release);
    }

    pub fn timeout(&self, kind: TimeoutKind) -> Option<Duration> {
        let ms = match kind {
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
        };
        if ms < 0 {
            None
        } else {
            Some(Duration::from_millis(ms as u64))
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, timeout: Option<Duration>) {
        let ms = timeout.map_or(-1, |t| t.as_millis() as i64);
        match kind {
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// Shared mapping from descriptor to its metadata entry.
pub struct FdRegistry {
    entries: RwLock<HashMap<RawFd, Arc<FdCtx>>>,
}

impl FdRegistry {
    fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The process-wide registry instance.
    pub fn global() -> &'static FdRegistry {
        static REGISTRY: OnceLock<FdRegistry> = OnceLock::new();
        REGISTRY.get_or_init(FdRegistry::new)
    }

    /// Look up a descriptor's entry, creating it on first observation
    /// when `auto_create` is set. Returns None for invalid
    /// descriptors.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        if let Some(ctx) = self.entries.read().unwrap().get(&fd) {
            return Some(ctx.clone());
        }
        if !auto_create {
            return None;
        }

        let ctx = Arc::new(FdCtx::probe(fd)?);
        let mut entries = self.entries.write().unwrap();
        // Another thread may have observed the fd between the locks.
        Some(entries.entry(fd).or_insert(ctx).clone())
    }

    /// Drop the entry for a closed (or reused) descriptor.
    pub fn remove(&self, fd: RawFd) {
        self.entries.write().unwrap().remove(&fd);
    }

    /// Number of tracked descriptors (diagnostic).
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_tcp_socket() -> RawFd {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn test_socket_entry_probed_nonblocking() {
        let fd = raw_tcp_socket();
        let ctx = FdRegistry::global().get(fd, true).unwrap();
        assert!(ctx.is_socket());
        assert!(!ctx.is_closed());
        assert!(ctx.is_nonblocking());

        // The probe really flipped the descriptor to O_NONBLOCK.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        FdRegistry::global().remove(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_non_socket_entry() {
        let fd = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const _, libc::O_RDONLY) };
        assert!(fd >= 0);
        let ctx = FdRegistry::global().get(fd, true).unwrap();
        assert!(!ctx.is_socket());

        FdRegistry::global().remove(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_invalid_fd_has_no_entry() {
        assert!(FdRegistry::global().get(-1, true).is_none());
        let fd = raw_tcp_socket();
        unsafe { libc::close(fd) };
        // A closed fd fails the probe.
        assert!(FdRegistry::global().get(fd, true).is_none());
    }

    #[test]
    fn test_timeouts_shared_through_entry() {
        let fd = raw_tcp_socket();
        let ctx = FdRegistry::global().get(fd, true).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);

        ctx.set_timeout(TimeoutKind::Recv, Some(Duration::from_millis(50)));
        ctx.set_timeout(TimeoutKind::Send, Some(Duration::from_secs(2)));

        // A second lookup sees the same entry and the same values.
        let again = FdRegistry::global().get(fd, false).unwrap();
        assert_eq!(again.timeout(TimeoutKind::Recv), Some(Duration::from_millis(50)));
        assert_eq!(again.timeout(TimeoutKind::Send), Some(Duration::from_secs(2)));

        again.set_timeout(TimeoutKind::Recv, None);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), None);

        FdRegistry::global().remove(fd);
        unsafe { libc::close(fd) };
    }
}
