//! Socket addresses
//!
//! Thin wrapper over the raw sockaddr forms the syscalls consume,
//! with conversions from and to `std::net::SocketAddr`.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// An IPv4 or IPv6 endpoint address.
#[derive(Clone, Copy)]
pub enum Address {
    V4(libc::sockaddr_in),
    V6(libc::sockaddr_in6),
}

impl Address {
    /// Loopback address for the given port (IPv4). Port 0 asks the
    /// OS to pick one at bind time.
    pub fn loopback(port: u16) -> Address {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port)).into()
    }

    /// OS address family (AF_INET / AF_INET6).
    #[inline]
    pub fn family(&self) -> i32 {
        match self {
            Address::V4(_) => libc::AF_INET,
            Address::V6(_) => libc::AF_INET6,
        }
    }

    /// Raw pointer for syscall use; valid while `self` is borrowed.
    #[inline]
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        match self {
            Address::V4(sin) => sin as *const libc::sockaddr_in as *const libc::sockaddr,
            Address::V6(sin6) => sin6 as *const libc::sockaddr_in6 as *const libc::sockaddr,
        }
    }

    #[inline]
    pub fn len(&self) -> libc::socklen_t {
        match self {
            Address::V4(_) => std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            Address::V6(_) => std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        }
    }

    #[inline]
    pub fn port(&self) -> u16 {
        match self {
            Address::V4(sin) => u16::from_be(sin.sin_port),
            Address::V6(sin6) => u16::from_be(sin6.sin6_port),
        }
    }

    /// Reconstruct from the storage filled in by getsockname,
    /// getpeername, or recvfrom. Unknown families yield None.
    pub fn from_raw(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> Option<Address> {
        match storage.ss_family as i32 {
            libc::AF_INET if len as usize >= std::mem::size_of::<libc::sockaddr_in>() => {
                let sin = unsafe {
                    *(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in)
                };
                Some(Address::V4(sin))
            }
            libc::AF_INET6 if len as usize >= std::mem::size_of::<libc::sockaddr_in6>() => {
                let sin6 = unsafe {
                    *(storage as *const libc::sockaddr_storage as *const libc::sockaddr_in6)
                };
                Some(Address::V6(sin6))
            }
            _ => None,
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        match self {
            Address::V4(sin) => SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()),
                u16::from_be(sin.sin_port),
            )),
            Address::V6(sin6) => SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => {
                let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                Address::V4(sin)
            }
            SocketAddr::V6(v6) => {
                let mut sin6: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_flowinfo = v6.flowinfo();
                sin6.sin6_scope_id = v6.scope_id();
                Address::V6(sin6)
            }
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_roundtrip() {
        let std_addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let addr = Address::from(std_addr);
        assert_eq!(addr.family(), libc::AF_INET);
        assert_eq!(addr.port(), 8080);
        assert_eq!(addr.to_socket_addr(), std_addr);
        assert_eq!(addr.len() as usize, std::mem::size_of::<libc::sockaddr_in>());
    }

    #[test]
    fn test_v6_roundtrip() {
        let std_addr: SocketAddr = "[::1]:443".parse().unwrap();
        let addr = Address::from(std_addr);
        assert_eq!(addr.family(), libc::AF_INET6);
        assert_eq!(addr.port(), 443);
        assert_eq!(addr.to_socket_addr(), std_addr);
    }

    #[test]
    fn test_loopback_display() {
        let addr = Address::loopback(9000);
        assert_eq!(format!("{}", addr), "127.0.0.1:9000");
    }

    #[test]
    fn test_from_raw_unknown_family() {
        let storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        assert!(Address::from_raw(&storage, std::mem::size_of_val(&storage) as libc::socklen_t)
            .is_none());
    }
}
