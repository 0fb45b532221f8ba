//! The reactor interface and the suspension protocol
//!
//! A reactor multiplexes descriptor readiness and timers, resuming
//! fibers that suspended in a socket operation. This crate only
//! defines the contract; `strand-reactor` carries the epoll
//! implementation.
//!
//! Wake coordination uses an [`IoWait`] token shared between one
//! suspension and every wake source registered for it (readiness,
//! timer, cancel). The first source to settle the token wins and is
//! the only one allowed to resume the fiber, so a late timer firing
//! after readiness already woke the fiber cannot double-resume it.

use std::cell::RefCell;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strand_core::{StrandError, StrandResult};
use strand_fiber::Fiber;

/// Readiness interest for one suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoEvent {
    Read,
    Write,
}

/// Why a suspended fiber was resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WakeReason {
    /// Not yet settled (spurious resume; callers retry)
    Pending = 0,
    /// Descriptor became ready; retry the syscall
    Ready = 1,
    /// The registered timeout elapsed first
    Timeout = 2,
    /// A cancel operation force-woke the waiter
    Cancelled = 3,
}

impl From<u8> for WakeReason {
    fn from(v: u8) -> Self {
        match v {
            1 => WakeReason::Ready,
            2 => WakeReason::Timeout,
            3 => WakeReason::Cancelled,
            _ => WakeReason::Pending,
        }
    }
}

/// Wake token for a single suspension. First writer wins.
pub struct IoWait {
    reason: AtomicU8,
}

impl IoWait {
    pub fn new() -> Self {
        Self {
            reason: AtomicU8::new(WakeReason::Pending as u8),
        }
    }

    /// Try to settle the token with `reason`. Returns true when this
    /// caller won and therefore owns the resume.
    pub fn settle(&self, reason: WakeReason) -> bool {
        self.reason
            .compare_exchange(
                WakeReason::Pending as u8,
                reason as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub fn reason(&self) -> WakeReason {
        WakeReason::from(self.reason.load(Ordering::Acquire))
    }
}

impl Default for IoWait {
    fn default() -> Self {
        Self::new()
    }
}

/// Event multiplexer that resumes suspended fibers.
///
/// Implementations are thread-local collaborators: fibers are
/// thread-affine, so a reactor resumes only fibers created on its own
/// thread. Cross-thread cancellation, when an implementation offers
/// it, goes through that implementation's own handle type.
pub trait Reactor {
    /// Register readiness interest for `fd`. When it fires, settle
    /// `wait` with `Ready` and resume `fiber` if the settle won.
    fn add_watcher(
        &self,
        fd: RawFd,
        event: IoEvent,
        wait: Arc<IoWait>,
        fiber: Rc<Fiber>,
    ) -> StrandResult<()>;

    /// Register a one-shot timer. On expiry, settle `wait` with
    /// `Timeout` and resume `fiber` if the settle won.
    fn add_timer(
        &self,
        timeout: Duration,
        wait: Arc<IoWait>,
        fiber: Rc<Fiber>,
    ) -> StrandResult<()>;

    /// Force-wake the waiter (if any) suspended on `fd` for `event`
    /// with `Cancelled`. Returns whether a waiter was woken.
    fn cancel(&self, fd: RawFd, event: IoEvent) -> bool;

    /// Force-wake every waiter suspended on `fd`.
    fn cancel_all(&self, fd: RawFd) -> bool;

    /// Queue a resumable fiber for execution on the reactor's next
    /// turn.
    fn schedule(&self, fiber: Rc<Fiber>);
}

thread_local! {
    static CURRENT_REACTOR: RefCell<Option<Rc<dyn Reactor>>> = const { RefCell::new(None) };
}

/// Install the reactor socket operations on this thread will suspend
/// through.
pub fn set_current(reactor: Rc<dyn Reactor>) {
    CURRENT_REACTOR.with(|cell| *cell.borrow_mut() = Some(reactor));
}

/// Remove this thread's installed reactor.
pub fn clear_current() {
    CURRENT_REACTOR.with(|cell| *cell.borrow_mut() = None);
}

/// This thread's installed reactor, if any.
pub fn current() -> Option<Rc<dyn Reactor>> {
    CURRENT_REACTOR.with(|cell| cell.borrow().clone())
}

/// Suspend the calling fiber until `fd` is ready for `event`, the
/// timeout (when given) elapses, or a cancel force-wakes it.
///
/// This is the cooperative-suspension primitive behind every
/// would-block socket path: register interest, yield to HOLD, read
/// the settled reason after resumption.
pub fn suspend_on(
    fd: RawFd,
    event: IoEvent,
    timeout: Option<Duration>,
) -> StrandResult<WakeReason> {
    let reactor = current().ok_or(StrandError::NoReactor)?;
    let wait = Arc::new(IoWait::new());
    let fiber = Fiber::current();

    reactor.add_watcher(fd, event, wait.clone(), fiber.clone())?;
    if let Some(t) = timeout {
        if let Err(e) = reactor.add_timer(t, wait.clone(), fiber) {
            // Unwind the half-made registration before reporting.
            reactor.cancel(fd, event);
            return Err(e);
        }
    }

    Fiber::yield_to_hold();
    Ok(wait.reason())
}
