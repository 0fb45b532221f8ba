//! # strand-net
//!
//! The network resource model of the Strand substrate.
//!
//! A [`Socket`] owns one descriptor and performs blocking-style
//! connect/accept/send/recv by attempting the non-blocking syscall
//! and, on would-block, suspending only the calling fiber: interest
//! is registered with the thread's installed [`Reactor`] and the
//! fiber yields to HOLD until readiness, timeout, or cancellation
//! wakes it.
//!
//! Per-descriptor timeout configuration lives in the process-wide
//! [`FdRegistry`], never in the socket itself, so the non-blocking
//! hook layer and the socket observe the same values.
//!
//! ## Modules
//!
//! - `address` - sockaddr wrapper consumed by bind/connect/accept
//! - `fd_registry` - descriptor metadata (timeouts, flags), shared
//! - `reactor` - the reactor interface and suspension protocol
//! - `socket` - the socket resource itself

pub mod address;
pub mod fd_registry;
pub mod reactor;
pub mod socket;

pub use address::Address;
pub use fd_registry::{FdCtx, FdRegistry, TimeoutKind};
pub use reactor::{IoEvent, IoWait, Reactor, WakeReason};
pub use socket::Socket;

/// Capture errno for the syscall that just failed.
///
/// Must run immediately after the failing call, before anything else
/// can clobber the thread's error slot.
#[inline]
pub(crate) fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}
