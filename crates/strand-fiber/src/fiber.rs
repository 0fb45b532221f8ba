//! The fiber type and its lifecycle
//!
//! A fiber is a suspendable unit of work with its own call stack and
//! saved processor state. Exactly one fiber per thread is `Exec` at
//! any instant; the first access on a thread lazily creates a root
//! context representing the native stack itself.
//!
//! Switch discipline: state is updated *before* the register switch,
//! and the thread-current pointer always moves together with control.
//! A fault inside the entry callback is caught at the trampoline
//! boundary, recorded on the fiber, and never unwinds into the
//! resumer's call stack.

use std::any::Any;
use std::cell::{Cell, RefCell, UnsafeCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strand_core::{serror, FiberId, FiberState};

use crate::arch::{self, SavedRegs};
use crate::config;
use crate::stack::{default_allocator, Stack, StackAllocator};
use crate::tls;

/// Monotonic id source; 0 is reserved for root contexts.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Live fiber instances, root contexts included.
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

/// A cooperatively scheduled execution context.
///
/// Handles are `Rc`-based and fibers are thread-affine: a fiber is
/// created, resumed, and destroyed on one thread. The type is neither
/// `Send` nor `Sync` by construction.
pub struct Fiber {
    id: FiberId,
    state: Cell<FiberState>,
    regs: UnsafeCell<SavedRegs>,
    /// Absent only for the per-thread root context.
    stack: Option<Stack>,
    /// Taken out exactly once per Init -> Term/Except cycle, so
    /// resources captured by the callback are released when it runs.
    entry: Cell<Option<Box<dyn FnOnce()>>>,
    /// Context to switch back to on yield; recorded by each resume.
    resumer: RefCell<Option<Weak<Fiber>>>,
    /// Message of a contained fault, for diagnostics.
    fault: RefCell<Option<String>>,
}

impl Fiber {
    /// Create a fiber with the default stack size.
    ///
    /// Panics if stack allocation fails; that is an unrecoverable
    /// platform error, not a reportable one.
    pub fn new<F>(entry: F) -> Rc<Fiber>
    where
        F: FnOnce() + 'static,
    {
        Self::with_stack_size(entry, 0)
    }

    /// Create a fiber with an explicit stack size (0 = default).
    pub fn with_stack_size<F>(entry: F, stack_size: usize) -> Rc<Fiber>
    where
        F: FnOnce() + 'static,
    {
        Self::with_allocator(entry, stack_size, default_allocator())
    }

    /// Create a fiber whose stack comes from the given allocator.
    pub fn with_allocator<F>(
        entry: F,
        stack_size: usize,
        allocator: Arc<dyn StackAllocator>,
    ) -> Rc<Fiber>
    where
        F: FnOnce() + 'static,
    {
        let size = if stack_size == 0 {
            config::default_stack_size()
        } else {
            stack_size.max(config::MIN_STACK_SIZE)
        };

        let stack = Stack::alloc(allocator, size)
            .unwrap_or_else(|e| panic!("fiber stack allocation failed: {}", e));

        let fiber = Rc::new(Fiber {
            id: FiberId::new(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
            state: Cell::new(FiberState::Init),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            stack: Some(stack),
            entry: Cell::new(Some(Box::new(entry))),
            resumer: RefCell::new(None),
            fault: RefCell::new(None),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        unsafe {
            arch::init_context(
                fiber.regs.get(),
                fiber.stack.as_ref().unwrap().top(),
                fiber_main as usize,
                0,
            );
        }

        fiber
    }

    /// Root context for the calling thread: the native stack, already
    /// executing, with nothing to allocate.
    fn new_root() -> Rc<Fiber> {
        let root = Rc::new(Fiber {
            id: FiberId::ROOT,
            state: Cell::new(FiberState::Exec),
            regs: UnsafeCell::new(SavedRegs::zeroed()),
            stack: None,
            entry: Cell::new(None),
            resumer: RefCell::new(None),
            fault: RefCell::new(None),
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        root
    }

    /// The context representing the caller. On first invocation in a
    /// thread this constructs and registers the thread's root context.
    pub fn current() -> Rc<Fiber> {
        if let Some(cur) = tls::current() {
            return cur;
        }
        let root = Self::new_root();
        tls::set_root(root.clone());
        tls::set_current(root.clone());
        root
    }

    /// Process-wide count of live fiber instances (diagnostic).
    /// Root contexts count like any other live fiber.
    pub fn total_fibers() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        self.state.get()
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.stack.as_ref().map_or(0, Stack::size)
    }

    #[inline]
    pub fn is_root(&self) -> bool {
        self.stack.is_none()
    }

    /// Message of the fault that moved this fiber to `Except`, if any.
    pub fn fault(&self) -> Option<String> {
        self.fault.borrow().clone()
    }

    /// Reinitialize a finished (or never-started) fiber with a new
    /// entry callback, reusing its stack allocation.
    ///
    /// Panics unless the state is Init, Term, or Except; calling this
    /// on a running or suspended fiber is a programming error. The
    /// root context can never be reset.
    pub fn reset<F>(&self, entry: F)
    where
        F: FnOnce() + 'static,
    {
        assert!(self.stack.is_some(), "root context cannot be reset");
        let state = self.state.get();
        assert!(
            state.can_reset(),
            "fiber {} reset while {}",
            self.id,
            state
        );

        unsafe {
            arch::init_context(
                self.regs.get(),
                self.stack.as_ref().unwrap().top(),
                fiber_main as usize,
                0,
            );
        }
        self.entry.set(Some(Box::new(entry)));
        self.fault.borrow_mut().take();
        self.state.set(FiberState::Init);
    }

    /// Transfer control from the calling context to this fiber.
    ///
    /// The caller (root context or another fiber) is recorded as the
    /// resumer and suspended until this fiber yields or terminates.
    /// Panics if the fiber is not in a resumable state.
    pub fn resume(self: &Rc<Fiber>) {
        let caller = Fiber::current();
        assert!(
            !Rc::ptr_eq(self, &caller),
            "fiber {} cannot resume itself",
            self.id
        );
        let state = self.state.get();
        assert!(
            state.is_resumable(),
            "fiber {} resumed while {}",
            self.id,
            state
        );

        *self.resumer.borrow_mut() = Some(Rc::downgrade(&caller));
        self.state.set(FiberState::Exec);
        tls::set_current(self.clone());

        let from = caller.regs.get();
        let to = self.regs.get();
        unsafe { arch::context_switch(from, to) };
        // Back in the caller: the fiber yielded or finished, and the
        // yield path already restored the thread-current pointer.
    }

    /// Suspend the current fiber until an external wake resumes it.
    pub fn yield_to_hold() {
        switch_out(FiberState::Hold);
    }

    /// Yield the current fiber, leaving it eligible for immediate
    /// re-scheduling.
    pub fn yield_to_ready() {
        switch_out(FiberState::Ready);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            // Dropping a fiber that is mid-execution would free a live
            // stack out from under it.
            let state = self.state.get();
            assert!(
                state.can_reset(),
                "fiber {} dropped while {}",
                self.id,
                state
            );
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state.get())
            .field("stack_size", &self.stack_size())
            .finish()
    }
}

/// Set the current fiber's state and switch back to its resumer.
fn switch_out(to_state: FiberState) {
    let cur = tls::current().expect("yield with no fiber context on this thread");
    assert!(cur.stack.is_some(), "root context cannot yield");

    let resumer = cur
        .resumer
        .borrow()
        .as_ref()
        .and_then(Weak::upgrade)
        .unwrap_or_else(tls::root);

    cur.state.set(to_state);
    tls::set_current(resumer.clone());

    let from = cur.regs.get();
    let to = resumer.regs.get();
    drop(resumer);
    drop(cur);
    unsafe { arch::context_switch(from, to) };
    // Resumed again; nothing to restore here, resume() did the setup.
}

/// Trampoline target: runs the entry callback exactly once, records
/// the outcome, and hands control back to the resumer. Never returns.
extern "C" fn fiber_main(_arg: usize) {
    let (from, to) = {
        let cur = tls::current().expect("fiber entry with no current fiber");
        let cb = cur
            .entry
            .take()
            .expect("fiber entered without an entry callback");

        match catch_unwind(AssertUnwindSafe(cb)) {
            Ok(()) => cur.state.set(FiberState::Term),
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                serror!("fiber {} fault: {}", cur.id, msg);
                *cur.fault.borrow_mut() = Some(msg);
                cur.state.set(FiberState::Except);
                drop(payload);
            }
        }

        let resumer = cur
            .resumer
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .unwrap_or_else(tls::root);
        tls::set_current(resumer.clone());

        (cur.regs.get(), resumer.regs.get())
        // All handles drop here: this frame is never unwound, so
        // nothing may stay alive past the final switch.
    };
    unsafe { arch::context_switch(from, to) };
    unreachable!("terminated fiber resumed");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
