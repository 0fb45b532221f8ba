//! The socket resource
//!
//! A `Socket` owns exactly one descriptor (or none, pre-bind) and
//! provides connect/bind/listen/accept/send/recv with integrated
//! timeouts and cancellation. Every potentially blocking operation
//! attempts the non-blocking syscall first and, on would-block,
//! suspends the calling fiber through the installed reactor; the OS
//! thread is never blocked.
//!
//! A descriptor is owned by exactly one `Socket` at a time; accept
//! transfers ownership of the new descriptor to the `Socket` it
//! returns. A socket's mutable state (cached addresses, connected
//! flag) is exclusively owned: concurrent use of one socket from two
//! fibers must be serialized by the caller, which the missing `Sync`
//! impl enforces.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::RawFd;
use std::time::Duration;

use strand_core::{sdebug, serror, StrandError, StrandResult};

use crate::address::Address;
use crate::errno;
use crate::fd_registry::{FdRegistry, TimeoutKind};
use crate::reactor::{self, IoEvent, WakeReason};

const INVALID_FD: RawFd = -1;

/// A descriptor-backed network endpoint.
pub struct Socket {
    fd: Cell<RawFd>,
    family: i32,
    ty: i32,
    protocol: i32,
    connected: Cell<bool>,
    local: RefCell<Option<Address>>,
    remote: RefCell<Option<Address>>,
}

impl Socket {
    /// Construct an unbound wrapper; the OS descriptor is allocated
    /// lazily by the first operation that needs one.
    pub fn new(family: i32, ty: i32, protocol: i32) -> Socket {
        Socket {
            fd: Cell::new(INVALID_FD),
            family,
            ty,
            protocol,
            connected: Cell::new(false),
            local: RefCell::new(None),
            remote: RefCell::new(None),
        }
    }

    pub fn tcp() -> Socket {
        Socket::new(libc::AF_INET, libc::SOCK_STREAM, 0)
    }

    pub fn udp() -> Socket {
        Socket::new(libc::AF_INET, libc::SOCK_DGRAM, 0)
    }

    pub fn tcp6() -> Socket {
        Socket::new(libc::AF_INET6, libc::SOCK_STREAM, 0)
    }

    pub fn udp6() -> Socket {
        Socket::new(libc::AF_INET6, libc::SOCK_DGRAM, 0)
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.get()
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.fd.get() != INVALID_FD
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    #[inline]
    pub fn family(&self) -> i32 {
        self.family
    }

    #[inline]
    pub fn socket_type(&self) -> i32 {
        self.ty
    }

    #[inline]
    pub fn protocol(&self) -> i32 {
        self.protocol
    }

    /// Allocate the OS descriptor, register it, apply default options.
    fn create_fd(&self) -> StrandResult<()> {
        let fd = unsafe { libc::socket(self.family, self.ty, self.protocol) };
        if fd < 0 {
            let e = errno();
            serror!(
                "socket({}, {}, {}) errno={}",
                self.family,
                self.ty,
                self.protocol,
                e
            );
            return Err(StrandError::Os(e));
        }
        // First observation: registry entry created, fd flipped to
        // non-blocking. Without the entry the suspension protocol
        // cannot work, so a failed probe releases the descriptor.
        if FdRegistry::global().get(fd, true).is_none() {
            serror!("fd {} registration failed, closing", fd);
            unsafe { libc::close(fd) };
            return Err(StrandError::InvalidState);
        }
        self.fd.set(fd);
        self.init_options();
        Ok(())
    }

    /// Default option policy, applied at creation and on accept.
    fn init_options(&self) {
        let one: i32 = 1;
        self.set_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, &one);
        if self.ty == libc::SOCK_STREAM {
            // Disable Nagle segment coalescing on stream sockets.
            self.set_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, &one);
        }
    }

    /// Bind to a local address. Family mismatch is a pure usage error
    /// and allocates nothing; existing descriptor state is unchanged.
    pub fn bind(&self, addr: &Address) -> StrandResult<()> {
        if addr.family() != self.family {
            serror!(
                "bind: sock.family({}) != addr.family({}), addr={}",
                self.family,
                addr.family(),
                addr
            );
            return Err(StrandError::FamilyMismatch);
        }
        if !self.is_valid() {
            self.create_fd()?;
        }

        let ret = unsafe { libc::bind(self.fd.get(), addr.as_ptr(), addr.len()) };
        if ret != 0 {
            let e = errno();
            serror!("bind({}) errno={}", addr, e);
            return Err(StrandError::Os(e));
        }
        self.local.borrow_mut().take();
        self.local_address();
        Ok(())
    }

    /// Connect to a remote address, suspending the calling fiber
    /// while the connection is in flight.
    ///
    /// Without a timeout the wait has no deadline. With one, an
    /// unfinished connect fails with `Timeout`. Any in-flight failure
    /// closes and releases the descriptor, leaving `is_valid()` false.
    pub fn connect(&self, addr: &Address, timeout: Option<Duration>) -> StrandResult<()> {
        if addr.family() != self.family {
            serror!(
                "connect: sock.family({}) != addr.family({}), addr={}",
                self.family,
                addr.family(),
                addr
            );
            return Err(StrandError::FamilyMismatch);
        }
        if !self.is_valid() {
            self.create_fd()?;
        }
        let fd = self.fd.get();

        let ret = unsafe { libc::connect(fd, addr.as_ptr(), addr.len()) };
        if ret != 0 {
            let e = errno();
            if e == libc::EINPROGRESS || e == libc::EINTR {
                match reactor::suspend_on(fd, IoEvent::Write, timeout) {
                    Ok(WakeReason::Ready) | Ok(WakeReason::Pending) => {
                        let so_error = self.take_error().unwrap_or(0);
                        if so_error != 0 {
                            serror!("connect({}) errno={}", addr, so_error);
                            self.close();
                            return Err(StrandError::Os(so_error));
                        }
                    }
                    Ok(WakeReason::Timeout) => {
                        serror!("connect({}) timed out", addr);
                        self.close();
                        return Err(StrandError::Timeout);
                    }
                    Ok(WakeReason::Cancelled) => {
                        self.close();
                        return Err(StrandError::Cancelled);
                    }
                    Err(err) => {
                        self.close();
                        return Err(err);
                    }
                }
            } else {
                serror!("connect({}) errno={}", addr, e);
                self.close();
                return Err(StrandError::Os(e));
            }
        }

        self.connected.set(true);
        self.local.borrow_mut().take();
        self.remote.borrow_mut().take();
        self.local_address();
        self.remote_address();
        Ok(())
    }

    /// Start listening. Requires a valid, previously bound descriptor.
    pub fn listen(&self, backlog: i32) -> StrandResult<()> {
        if !self.is_valid() {
            serror!("listen on invalid socket");
            return Err(StrandError::InvalidState);
        }
        let ret = unsafe { libc::listen(self.fd.get(), backlog) };
        if ret != 0 {
            let e = errno();
            serror!("listen errno={}", e);
            return Err(StrandError::Os(e));
        }
        Ok(())
    }

    /// Accept one connection, suspending the calling fiber until a
    /// client arrives (bounded by the descriptor's recv timeout).
    ///
    /// The new descriptor is wrapped in a `Socket` of the same
    /// family/type/protocol with the default option policy applied.
    pub fn accept(&self) -> StrandResult<Socket> {
        if !self.is_valid() {
            serror!("accept on invalid socket");
            return Err(StrandError::InvalidState);
        }
        let fd = self.fd.get();
        loop {
            let new_fd =
                unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) };
            if new_fd >= 0 {
                return Socket::from_accepted(new_fd, self.family, self.ty, self.protocol);
            }
            let e = errno();
            match e {
                libc::EINTR => continue,
                libc::EAGAIN => {
                    let timeout = FdRegistry::global()
                        .get(fd, true)
                        .and_then(|c| c.timeout(TimeoutKind::Recv));
                    match reactor::suspend_on(fd, IoEvent::Read, timeout)? {
                        WakeReason::Ready | WakeReason::Pending => continue,
                        WakeReason::Timeout => return Err(StrandError::Timeout),
                        WakeReason::Cancelled => return Err(StrandError::Cancelled),
                    }
                }
                _ => {
                    serror!("accept({}) errno={}", fd, e);
                    return Err(StrandError::Os(e));
                }
            }
        }
    }

    /// Take ownership of an accepted descriptor. If registration or
    /// the post-accept probe fails, the descriptor is closed here —
    /// it must never leak.
    fn from_accepted(fd: RawFd, family: i32, ty: i32, protocol: i32) -> StrandResult<Socket> {
        let usable = FdRegistry::global()
            .get(fd, true)
            .map(|c| c.is_socket() && !c.is_closed())
            .unwrap_or(false);
        if !usable {
            serror!("accepted fd {} failed registration, closing", fd);
            FdRegistry::global().remove(fd);
            unsafe { libc::close(fd) };
            return Err(StrandError::InvalidState);
        }

        let sock = Socket {
            fd: Cell::new(fd),
            family,
            ty,
            protocol,
            connected: Cell::new(true),
            local: RefCell::new(None),
            remote: RefCell::new(None),
        };
        sock.init_options();
        sock.local_address();
        sock.remote_address();
        Ok(sock)
    }

    /// Non-blocking attempt loop shared by every data operation:
    /// retry on EINTR, suspend on would-block, surface everything
    /// else with the errno captured at the call site.
    fn io_loop<F>(&self, event: IoEvent, kind: TimeoutKind, mut op: F) -> StrandResult<usize>
    where
        F: FnMut() -> libc::ssize_t,
    {
        let fd = self.fd.get();
        loop {
            let n = op();
            if n >= 0 {
                return Ok(n as usize);
            }
            let e = errno();
            match e {
                libc::EINTR => continue,
                libc::EAGAIN => {
                    let timeout = FdRegistry::global()
                        .get(fd, true)
                        .and_then(|c| c.timeout(kind));
                    match reactor::suspend_on(fd, event, timeout)? {
                        WakeReason::Ready | WakeReason::Pending => continue,
                        WakeReason::Timeout => return Err(StrandError::Timeout),
                        WakeReason::Cancelled => return Err(StrandError::Cancelled),
                    }
                }
                _ => {
                    sdebug!("io fd={} errno={}", fd, e);
                    return Err(StrandError::Os(e));
                }
            }
        }
    }

    /// Send on a connected socket. Returns bytes written.
    pub fn send(&self, buf: &[u8], flags: i32) -> StrandResult<usize> {
        if !self.is_connected() {
            return Err(StrandError::NotConnected);
        }
        let fd = self.fd.get();
        self.io_loop(IoEvent::Write, TimeoutKind::Send, || unsafe {
            libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags)
        })
    }

    /// Scatter/gather send on a connected socket.
    pub fn send_vectored(&self, bufs: &[IoSlice<'_>], flags: i32) -> StrandResult<usize> {
        if !self.is_connected() {
            return Err(StrandError::NotConnected);
        }
        let fd = self.fd.get();
        self.io_loop(IoEvent::Write, TimeoutKind::Send, || {
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            // IoSlice is ABI-compatible with iovec on Unix.
            msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
            msg.msg_iovlen = bufs.len() as _;
            unsafe { libc::sendmsg(fd, &msg, flags) }
        })
    }

    /// Send a datagram to `to`; lazily allocates the descriptor.
    pub fn send_to(&self, buf: &[u8], flags: i32, to: &Address) -> StrandResult<usize> {
        if to.family() != self.family {
            serror!(
                "send_to: sock.family({}) != addr.family({}), addr={}",
                self.family,
                to.family(),
                to
            );
            return Err(StrandError::FamilyMismatch);
        }
        if !self.is_valid() {
            self.create_fd()?;
        }
        let fd = self.fd.get();
        self.io_loop(IoEvent::Write, TimeoutKind::Send, || unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                flags,
                to.as_ptr(),
                to.len(),
            )
        })
    }

    /// Scatter/gather datagram send.
    pub fn send_to_vectored(
        &self,
        bufs: &[IoSlice<'_>],
        flags: i32,
        to: &Address,
    ) -> StrandResult<usize> {
        if to.family() != self.family {
            return Err(StrandError::FamilyMismatch);
        }
        if !self.is_valid() {
            self.create_fd()?;
        }
        let fd = self.fd.get();
        self.io_loop(IoEvent::Write, TimeoutKind::Send, || {
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_name = to.as_ptr() as *mut libc::c_void;
            msg.msg_namelen = to.len();
            msg.msg_iov = bufs.as_ptr() as *mut libc::iovec;
            msg.msg_iovlen = bufs.len() as _;
            unsafe { libc::sendmsg(fd, &msg, flags) }
        })
    }

    /// Receive on a connected socket. Returns bytes read, 0 on EOF.
    pub fn recv(&self, buf: &mut [u8], flags: i32) -> StrandResult<usize> {
        if !self.is_connected() {
            return Err(StrandError::NotConnected);
        }
        let fd = self.fd.get();
        self.io_loop(IoEvent::Read, TimeoutKind::Recv, || unsafe {
            libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), flags)
        })
    }

    /// Scatter/gather receive on a connected socket.
    pub fn recv_vectored(&self, bufs: &mut [IoSliceMut<'_>], flags: i32) -> StrandResult<usize> {
        if !self.is_connected() {
            return Err(StrandError::NotConnected);
        }
        let fd = self.fd.get();
        self.io_loop(IoEvent::Read, TimeoutKind::Recv, || {
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = bufs.as_mut_ptr() as *mut libc::iovec;
            msg.msg_iovlen = bufs.len() as _;
            unsafe { libc::recvmsg(fd, &mut msg, flags) }
        })
    }

    /// Receive a datagram along with its sender address.
    pub fn recv_from(&self, buf: &mut [u8], flags: i32) -> StrandResult<(usize, Address)> {
        if !self.is_valid() {
            self.create_fd()?;
        }
        let fd = self.fd.get();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let n = self.io_loop(IoEvent::Read, TimeoutKind::Recv, || unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut addr_len,
            )
        })?;

        let addr = Address::from_raw(&storage, addr_len).ok_or(StrandError::InvalidState)?;
        Ok((n, addr))
    }

    /// Scatter/gather datagram receive with sender address.
    pub fn recv_from_vectored(
        &self,
        bufs: &mut [IoSliceMut<'_>],
        flags: i32,
    ) -> StrandResult<(usize, Address)> {
        if !self.is_valid() {
            self.create_fd()?;
        }
        let fd = self.fd.get();
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut msg_namelen: libc::socklen_t = 0;

        let n = self.io_loop(IoEvent::Read, TimeoutKind::Recv, || {
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_name = &mut storage as *mut libc::sockaddr_storage as *mut libc::c_void;
            msg.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            msg.msg_iov = bufs.as_mut_ptr() as *mut libc::iovec;
            msg.msg_iovlen = bufs.len() as _;
            let ret = unsafe { libc::recvmsg(fd, &mut msg, flags) };
            msg_namelen = msg.msg_namelen;
            ret
        })?;

        let addr = Address::from_raw(&storage, msg_namelen).ok_or(StrandError::InvalidState)?;
        Ok((n, addr))
    }

    /// Receive timeout, read through the descriptor's registry entry.
    pub fn recv_timeout(&self) -> Option<Duration> {
        FdRegistry::global()
            .get(self.fd.get(), false)
            .and_then(|c| c.timeout(TimeoutKind::Recv))
    }

    /// Set the receive timeout in the registry entry (the source of
    /// truth for the suspension path) and forward SO_RCVTIMEO to the
    /// OS so the hook layer and plain syscalls agree.
    pub fn set_recv_timeout(&self, timeout: Option<Duration>) {
        self.set_timeout(TimeoutKind::Recv, libc::SO_RCVTIMEO, timeout);
    }

    /// Send timeout, read through the descriptor's registry entry.
    pub fn send_timeout(&self) -> Option<Duration> {
        FdRegistry::global()
            .get(self.fd.get(), false)
            .and_then(|c| c.timeout(TimeoutKind::Send))
    }

    /// Set the send timeout; see `set_recv_timeout`.
    pub fn set_send_timeout(&self, timeout: Option<Duration>) {
        self.set_timeout(TimeoutKind::Send, libc::SO_SNDTIMEO, timeout);
    }

    fn set_timeout(&self, kind: TimeoutKind, option: i32, timeout: Option<Duration>) {
        if let Some(ctx) = FdRegistry::global().get(self.fd.get(), true) {
            ctx.set_timeout(kind, timeout);
        }
        let tv = match timeout {
            Some(t) => libc::timeval {
                tv_sec: t.as_secs() as libc::time_t,
                tv_usec: t.subsec_micros() as libc::suseconds_t,
            },
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        self.set_option(libc::SOL_SOCKET, option, &tv);
    }

    /// setsockopt passthrough. Failures are logged, not raised.
    pub fn set_option<T>(&self, level: i32, option: i32, value: &T) -> bool {
        let ret = unsafe {
            libc::setsockopt(
                self.fd.get(),
                level,
                option,
                value as *const T as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            sdebug!(
                "setsockopt fd={} level={} option={} errno={}",
                self.fd.get(),
                level,
                option,
                errno()
            );
            return false;
        }
        true
    }

    /// getsockopt passthrough. Failures are logged, not raised.
    pub fn get_option<T>(&self, level: i32, option: i32, value: &mut T) -> bool {
        let mut len = std::mem::size_of::<T>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd.get(),
                level,
                option,
                value as *mut T as *mut libc::c_void,
                &mut len,
            )
        };
        if ret != 0 {
            sdebug!(
                "getsockopt fd={} level={} option={} errno={}",
                self.fd.get(),
                level,
                option,
                errno()
            );
            return false;
        }
        true
    }

    /// Pending SO_ERROR value, if readable.
    pub fn take_error(&self) -> Option<i32> {
        let mut err: i32 = 0;
        if self.get_option(libc::SOL_SOCKET, libc::SO_ERROR, &mut err) {
            Some(err)
        } else {
            None
        }
    }

    /// Force-wake a fiber suspended reading this descriptor.
    pub fn cancel_read(&self) -> bool {
        reactor::current().map_or(false, |r| r.cancel(self.fd.get(), IoEvent::Read))
    }

    /// Force-wake a fiber suspended writing this descriptor.
    pub fn cancel_write(&self) -> bool {
        reactor::current().map_or(false, |r| r.cancel(self.fd.get(), IoEvent::Write))
    }

    /// Force-wake a fiber suspended in accept (a read-side wait).
    pub fn cancel_accept(&self) -> bool {
        self.cancel_read()
    }

    /// Force-wake every fiber suspended on this descriptor.
    pub fn cancel_all(&self) -> bool {
        reactor::current().map_or(false, |r| r.cancel_all(self.fd.get()))
    }

    /// Cached local address, populated lazily via getsockname.
    pub fn local_address(&self) -> Option<Address> {
        if let Some(addr) = *self.local.borrow() {
            return Some(addr);
        }
        let addr = self.query_name(libc::getsockname)?;
        *self.local.borrow_mut() = Some(addr);
        Some(addr)
    }

    /// Cached remote address, populated lazily via getpeername.
    pub fn remote_address(&self) -> Option<Address> {
        if let Some(addr) = *self.remote.borrow() {
            return Some(addr);
        }
        let addr = self.query_name(libc::getpeername)?;
        *self.remote.borrow_mut() = Some(addr);
        Some(addr)
    }

    fn query_name(
        &self,
        f: unsafe extern "C" fn(RawFd, *mut libc::sockaddr, *mut libc::socklen_t) -> i32,
    ) -> Option<Address> {
        if !self.is_valid() {
            return None;
        }
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            f(
                self.fd.get(),
                &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret != 0 {
            sdebug!("address query fd={} errno={}", self.fd.get(), errno());
            return None;
        }
        Address::from_raw(&storage, len)
    }

    /// Release the descriptor and clear cached state. Safe to call
    /// any number of times; the descriptor is closed at most once.
    pub fn close(&self) {
        let fd = self.fd.get();
        if fd != INVALID_FD {
            self.cancel_all();
            if let Some(ctx) = FdRegistry::global().get(fd, false) {
                ctx.set_closed();
            }
            FdRegistry::global().remove(fd);
            unsafe { libc::close(fd) };
            self.fd.set(INVALID_FD);
        }
        self.connected.set(false);
        self.local.borrow_mut().take();
        self.remote.borrow_mut().take();
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Socket(fd={} family={} type={} protocol={} connected={}",
            self.fd.get(),
            self.family,
            self.ty,
            self.protocol,
            self.connected.get()
        )?;
        if let Some(local) = *self.local.borrow() {
            write!(f, " local={}", local)?;
        }
        if let Some(remote) = *self.remote.borrow() {
            write!(f, " remote={}", remote)?;
        }
        write!(f, ")")
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_idempotent() {
        let sock = Socket::tcp();
        sock.bind(&Address::loopback(0)).unwrap();
        assert!(sock.is_valid());
        let fd = sock.fd();

        sock.close();
        assert!(!sock.is_valid());
        assert!(FdRegistry::global().get(fd, false).is_none());

        // Second close is a no-op, not a double release.
        sock.close();
        assert!(!sock.is_valid());
    }

    #[test]
    fn test_bind_family_mismatch_allocates_nothing() {
        let sock = Socket::tcp();
        let v6: Address = "[::1]:0".parse::<std::net::SocketAddr>().unwrap().into();

        assert_eq!(sock.bind(&v6), Err(StrandError::FamilyMismatch));
        // Pure usage error: no descriptor was allocated.
        assert!(!sock.is_valid());

        // A previously valid descriptor is left untouched.
        sock.bind(&Address::loopback(0)).unwrap();
        let fd = sock.fd();
        assert_eq!(sock.bind(&v6), Err(StrandError::FamilyMismatch));
        assert_eq!(sock.fd(), fd);
        assert!(sock.is_valid());

        assert_eq!(sock.connect(&v6, None), Err(StrandError::FamilyMismatch));
        assert_eq!(sock.fd(), fd);
    }

    #[test]
    fn test_listen_requires_bound_descriptor() {
        let sock = Socket::tcp();
        assert_eq!(sock.listen(16), Err(StrandError::InvalidState));
    }

    #[test]
    fn test_bind_listen_ephemeral_port() {
        let sock = Socket::tcp();
        sock.bind(&Address::loopback(0)).unwrap();
        sock.listen(16).unwrap();

        let local = sock.local_address().unwrap();
        assert_eq!(local.family(), libc::AF_INET);
        assert_ne!(local.port(), 0);
        assert!(format!("{}", sock).contains("fd="));
    }

    #[test]
    fn test_accept_without_reactor_fails_cleanly() {
        let sock = Socket::tcp();
        sock.bind(&Address::loopback(0)).unwrap();
        sock.listen(1).unwrap();

        // Nothing pending and no reactor installed: the would-block
        // path cannot suspend, and says so.
        crate::reactor::clear_current();
        assert_eq!(sock.accept().unwrap_err(), StrandError::NoReactor);
    }

    #[test]
    fn test_data_ops_require_connection() {
        let sock = Socket::tcp();
        let mut buf = [0u8; 8];
        assert_eq!(sock.send(b"x", 0), Err(StrandError::NotConnected));
        assert_eq!(sock.recv(&mut buf, 0), Err(StrandError::NotConnected));
    }

    #[test]
    fn test_timeouts_read_through_registry() {
        let sock = Socket::tcp();
        sock.bind(&Address::loopback(0)).unwrap();
        assert_eq!(sock.recv_timeout(), None);

        sock.set_recv_timeout(Some(Duration::from_millis(50)));
        sock.set_send_timeout(Some(Duration::from_secs(3)));
        assert_eq!(sock.recv_timeout(), Some(Duration::from_millis(50)));
        assert_eq!(sock.send_timeout(), Some(Duration::from_secs(3)));

        // The registry entry is the same state the socket reads.
        let ctx = FdRegistry::global().get(sock.fd(), false).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), Some(Duration::from_millis(50)));
        ctx.set_timeout(TimeoutKind::Recv, Some(Duration::from_millis(75)));
        assert_eq!(sock.recv_timeout(), Some(Duration::from_millis(75)));

        sock.set_recv_timeout(None);
        assert_eq!(sock.recv_timeout(), None);
    }

    #[test]
    fn test_option_passthrough() {
        let sock = Socket::tcp();
        sock.bind(&Address::loopback(0)).unwrap();

        let size: i32 = 64 * 1024;
        assert!(sock.set_option(libc::SOL_SOCKET, libc::SO_RCVBUF, &size));
        let mut read_back: i32 = 0;
        assert!(sock.get_option(libc::SOL_SOCKET, libc::SO_RCVBUF, &mut read_back));
        assert!(read_back > 0);

        // Failures report false instead of raising.
        sock.close();
        assert!(!sock.set_option(libc::SOL_SOCKET, libc::SO_RCVBUF, &size));
    }

    #[test]
    fn test_udp_datagram_roundtrip() {
        let a = Socket::udp();
        let b = Socket::udp();
        a.bind(&Address::loopback(0)).unwrap();
        b.bind(&Address::loopback(0)).unwrap();

        let to = a.local_address().unwrap();
        let sent = b.send_to(b"ping", 0, &to).unwrap();
        assert_eq!(sent, 4);

        // Loopback delivery is synchronous, but give the kernel a
        // beat so the receive below never hits the would-block path
        // (no reactor is installed in unit tests).
        std::thread::sleep(Duration::from_millis(20));

        let mut buf = [0u8; 16];
        let (n, from) = a.recv_from(&mut buf, 0).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from.port(), b.local_address().unwrap().port());
    }

    #[test]
    fn test_udp_vectored_roundtrip() {
        let a = Socket::udp();
        let b = Socket::udp();
        a.bind(&Address::loopback(0)).unwrap();
        b.bind(&Address::loopback(0)).unwrap();

        let to = a.local_address().unwrap();
        let parts = [IoSlice::new(b"he"), IoSlice::new(b"llo")];
        assert_eq!(b.send_to_vectored(&parts, 0, &to).unwrap(), 5);

        std::thread::sleep(Duration::from_millis(20));

        let mut head = [0u8; 2];
        let mut tail = [0u8; 8];
        let mut bufs = [IoSliceMut::new(&mut head), IoSliceMut::new(&mut tail)];
        let (n, _) = a.recv_from_vectored(&mut bufs, 0).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&head, b"he");
        assert_eq!(&tail[..3], b"llo");
    }
}
