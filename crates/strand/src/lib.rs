//! # strand - cooperative fibers with blocking-style socket I/O
//!
//! One worker thread interleaves many logical tasks. Each task is a
//! stackful fiber; socket operations written in blocking style
//! suspend only the calling fiber when they would block, and the
//! reactor resumes it on readiness, timeout, or cancellation.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use strand::{Address, IoScheduler, Socket};
//!
//! fn main() -> Result<(), strand::StrandError> {
//!     let sched = IoScheduler::new()?;
//!
//!     let listener = Socket::tcp();
//!     listener.bind(&Address::loopback(7000))?;
//!     listener.listen(128)?;
//!
//!     sched.spawn(move || {
//!         loop {
//!             let conn = match listener.accept() {
//!                 Ok(conn) => conn,
//!                 Err(_) => break,
//!             };
//!             strand::spawn_with(move || {
//!                 let mut buf = [0u8; 4096];
//!                 while let Ok(n) = conn.recv(&mut buf, 0) {
//!                     if n == 0 || conn.send(&buf[..n], 0).is_err() {
//!                         break;
//!                     }
//!                 }
//!             });
//!         }
//!     });
//!
//!     sched.run();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                     Task code                          │
//! │        blocking-style connect/accept/send/recv         │
//! └────────────────────────────────────────────────────────┘
//!                  │ would-block: suspend fiber
//!                  ▼
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────────┐
//! │    Fiber     │   │  FdRegistry  │   │   IoScheduler   │
//! │ resume/yield │   │ fd timeouts  │   │ epoll + timers  │
//! └──────────────┘   └──────────────┘   └─────────────────┘
//! ```

// The fiber mechanism
pub use strand_fiber::{
    default_stack_size, set_default_stack_size, Fiber, MallocStack, MmapStack, Stack,
    StackAllocator, MIN_STACK_SIZE,
};

// Core vocabulary
pub use strand_core::{FiberId, FiberState, StrandError, StrandResult};

// Logging macros and env helpers
pub use strand_core::slog::{self, set_flush_enabled, set_log_level, LogLevel};
pub use strand_core::{env_get, env_get_bool, env_get_opt};
pub use strand_core::{sdebug, serror, sinfo, sprintln, strace, swarn};

// The resource model
pub use strand_net::reactor::{IoEvent, IoWait, Reactor, WakeReason};
pub use strand_net::{Address, FdCtx, FdRegistry, Socket, TimeoutKind};

// The reactor implementation
pub use strand_reactor::{sleep, IoScheduler, SchedulerHandle};

use std::rc::Rc;

/// Spawn a fiber onto this thread's installed scheduler.
///
/// Convenience for code already running inside `IoScheduler::run()`;
/// panics when no reactor is installed on the thread.
pub fn spawn_with<F>(f: F) -> Rc<Fiber>
where
    F: FnOnce() + 'static,
{
    let fiber = Fiber::new(f);
    schedule(fiber.clone());
    fiber
}

/// Queue an existing fiber onto this thread's installed scheduler.
pub fn schedule(fiber: Rc<Fiber>) {
    strand_net::reactor::current()
        .expect("no reactor installed on this thread")
        .schedule(fiber);
}
