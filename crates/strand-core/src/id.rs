//! Fiber identifier type

use core::fmt;

/// Unique identifier for a fiber.
///
/// Ids are handed out from a process-wide monotonic counter starting
/// at 1. The value 0 is reserved for per-thread root contexts, which
/// represent the native thread stack rather than a spawned task.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FiberId(u64);

impl FiberId {
    /// Id carried by every root context.
    pub const ROOT: FiberId = FiberId(0);

    /// Create a FiberId from a raw value.
    #[inline]
    pub const fn new(id: u64) -> Self {
        FiberId(id)
    }

    /// Get the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check whether this id names a root context.
    #[inline]
    pub const fn is_root(self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for FiberId {
    #[inline]
    fn from(id: u64) -> Self {
        FiberId(id)
    }
}

impl From<FiberId> for u64 {
    #[inline]
    fn from(id: FiberId) -> Self {
        id.0
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "FiberId(ROOT)")
        } else {
            write!(f, "FiberId({})", self.0)
        }
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "root")
        } else {
            write!(f, "{}", self.0)
        }
    }
}
