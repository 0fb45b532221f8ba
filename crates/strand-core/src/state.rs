//! Fiber lifecycle state

use core::fmt;

/// State of a fiber.
///
/// Transitions form a fixed machine: `Init -> Exec` on the first
/// resume, `Exec -> Hold | Ready` on a yield, `Hold | Ready -> Exec`
/// on a later resume, `Exec -> Term` when the entry callback returns
/// and `Exec -> Except` when it faults. `Init | Term | Except -> Init`
/// via reset. Root contexts are created in `Exec` and never leave it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Constructed or reset, not yet resumed
    Init = 0,

    /// Currently executing on its thread
    Exec = 1,

    /// Suspended, waiting for an external wake (I/O readiness, timer)
    Hold = 2,

    /// Voluntarily yielded, eligible for immediate re-resumption
    Ready = 3,

    /// Entry callback returned normally
    Term = 4,

    /// Entry callback faulted; the fault message is retained
    Except = 5,
}

impl FiberState {
    /// Check whether a resume is legal from this state.
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Hold | FiberState::Ready)
    }

    /// Check whether the fiber has run to completion (normally or not).
    #[inline]
    pub const fn is_finished(&self) -> bool {
        matches!(self, FiberState::Term | FiberState::Except)
    }

    /// Check whether a reset is legal from this state.
    #[inline]
    pub const fn can_reset(&self) -> bool {
        matches!(self, FiberState::Init | FiberState::Term | FiberState::Except)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Init,
            1 => FiberState::Exec,
            2 => FiberState::Hold,
            3 => FiberState::Ready,
            4 => FiberState::Term,
            5 => FiberState::Except,
            _ => FiberState::Init, // Default for invalid values
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Init => "INIT",
            FiberState::Exec => "EXEC",
            FiberState::Hold => "HOLD",
            FiberState::Ready => "READY",
            FiberState::Term => "TERM",
            FiberState::Except => "EXCEPT",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resumable_states() {
        assert!(FiberState::Init.is_resumable());
        assert!(FiberState::Hold.is_resumable());
        assert!(FiberState::Ready.is_resumable());
        assert!(!FiberState::Exec.is_resumable());
        assert!(!FiberState::Term.is_resumable());
        assert!(!FiberState::Except.is_resumable());
    }

    #[test]
    fn test_reset_states() {
        assert!(FiberState::Init.can_reset());
        assert!(FiberState::Term.can_reset());
        assert!(FiberState::Except.can_reset());
        assert!(!FiberState::Exec.can_reset());
        assert!(!FiberState::Hold.can_reset());
        assert!(!FiberState::Ready.can_reset());
    }

    #[test]
    fn test_finished_states() {
        assert!(FiberState::Term.is_finished());
        assert!(FiberState::Except.is_finished());
        assert!(!FiberState::Hold.is_finished());
    }

    #[test]
    fn test_u8_roundtrip() {
        for s in [
            FiberState::Init,
            FiberState::Exec,
            FiberState::Hold,
            FiberState::Ready,
            FiberState::Term,
            FiberState::Except,
        ] {
            assert_eq!(FiberState::from(u8::from(s)), s);
        }
        assert_eq!(FiberState::from(200u8), FiberState::Init);
    }
}
