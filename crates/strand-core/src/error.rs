//! Error types shared across the Strand workspace

use core::fmt;

/// Result type for Strand operations
pub type StrandResult<T> = Result<T, StrandError>;

/// Errors surfaced at public call boundaries.
///
/// Fiber-internal usage violations (resume or reset in an illegal
/// state) are programming errors and assert instead; a fault raised
/// inside a fiber's entry callback is captured as `Except` state on
/// the fiber, not as one of these values. Nothing here ever unwinds
/// across a suspension point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrandError {
    /// Stack allocation for a new fiber failed
    StackAllocation,

    /// Operation requires a descriptor or connection the socket lacks
    InvalidState,

    /// Address family does not match the socket's family
    FamilyMismatch,

    /// Operation requires a connected socket
    NotConnected,

    /// No reactor installed on this thread for a suspending operation
    NoReactor,

    /// Syscall failure, errno captured at the call site
    Os(i32),

    /// Operation's timeout budget elapsed
    Timeout,

    /// Waiting fiber was force-woken by a cancel operation
    Cancelled,
}

impl StrandError {
    /// Capture the current OS error for the calling syscall.
    ///
    /// Must be called immediately after the failed call, before
    /// anything else can clobber errno.
    #[inline]
    pub fn last_os() -> Self {
        StrandError::Os(
            std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(0),
        )
    }

    /// The captured errno, when this is an OS error.
    #[inline]
    pub fn os_code(&self) -> Option<i32> {
        match self {
            StrandError::Os(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for StrandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrandError::StackAllocation => write!(f, "fiber stack allocation failed"),
            StrandError::InvalidState => write!(f, "operation invalid in current state"),
            StrandError::FamilyMismatch => write!(f, "address family mismatch"),
            StrandError::NotConnected => write!(f, "socket not connected"),
            StrandError::NoReactor => write!(f, "no reactor installed on this thread"),
            StrandError::Os(code) => {
                write!(f, "os error {} ({})", code, std::io::Error::from_raw_os_error(*code))
            }
            StrandError::Timeout => write!(f, "operation timed out"),
            StrandError::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for StrandError {}

impl From<std::io::Error> for StrandError {
    fn from(e: std::io::Error) -> Self {
        StrandError::Os(e.raw_os_error().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(format!("{}", StrandError::Timeout), "operation timed out");
        assert_eq!(format!("{}", StrandError::Cancelled), "operation cancelled");
        assert!(format!("{}", StrandError::Os(libc_einval())).starts_with("os error"));
    }

    #[test]
    fn test_os_code() {
        assert_eq!(StrandError::Os(11).os_code(), Some(11));
        assert_eq!(StrandError::Timeout.os_code(), None);
    }

    // Avoid a libc dependency in this crate just for one test constant.
    fn libc_einval() -> i32 {
        22
    }
}
