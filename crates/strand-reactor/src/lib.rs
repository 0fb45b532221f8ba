//! # strand-reactor
//!
//! The epoll reactor: multiplexes descriptor readiness and timers to
//! resume fibers suspended in socket operations.
//!
//! One [`IoScheduler`] serves one worker thread. It owns the epoll
//! instance, a per-descriptor waiter table, a min-heap of timers, and
//! a FIFO of fibers ready to run. `run()` installs the scheduler as
//! the thread's reactor and alternates between resuming ready fibers
//! and waiting for events; it returns once no work remains.
//!
//! Fibers are thread-affine, so readiness and timer wakes only ever
//! resume fibers created on this thread. The one cross-thread surface
//! is [`SchedulerHandle`]: a Send handle that feeds cancel/stop
//! commands through a lock-free queue, kicking the epoll wait via an
//! eventfd.
//!
//! ```ignore
//! let sched = IoScheduler::new()?;
//! sched.spawn(|| {
//!     let sock = Socket::tcp();
//!     sock.connect(&addr, Some(Duration::from_secs(3)))?;
//!     // blocking-style I/O; only this fiber suspends
//! });
//! sched.run();
//! ```

use std::cell::{Cell, RefCell};
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;

use strand_core::{serror, StrandError, StrandResult};
use strand_fiber::Fiber;
use strand_net::reactor::{self, IoEvent, IoWait, Reactor, WakeReason};

/// Sentinel epoll token for the command-queue eventfd.
const NOTIFY_TOKEN: u64 = u64::MAX;

/// Capacity of the cross-thread command queue.
const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// One suspended fiber plus its wake token.
struct Waiter {
    wait: Arc<IoWait>,
    fiber: Rc<Fiber>,
}

/// Read/write waiters for one descriptor. At most one fiber may wait
/// per (descriptor, event); sockets are exclusively owned, so two
/// simultaneous waiters indicate caller misuse.
#[derive(Default)]
struct FdWaiters {
    read: Option<Waiter>,
    write: Option<Waiter>,
}

impl FdWaiters {
    fn interest(&self) -> u32 {
        let mut events = 0u32;
        if self.read.is_some() {
            events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if self.write.is_some() {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

/// Heap entry; min-heap by deadline, sequence breaks ties.
struct TimerEntry {
    deadline: Instant,
    seq: u64,
    wait: Arc<IoWait>,
    fiber: Rc<Fiber>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        match other.deadline.cmp(&self.deadline) {
            std::cmp::Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

/// Command sent from other threads via [`SchedulerHandle`].
#[derive(Debug, Clone, Copy)]
enum Command {
    Cancel { fd: RawFd, event: IoEvent },
    CancelAll { fd: RawFd },
    Stop,
}

/// State shared between the scheduler and its Send handles.
struct Shared {
    commands: ArrayQueue<Command>,
    /// eventfd that kicks the epoll wait when a command arrives.
    notify_fd: RawFd,
    stopping: AtomicBool,
}

impl Shared {
    fn notify(&self) {
        let one: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.notify_fd,
                &one as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        // A full eventfd counter still wakes the waiter; ignore.
        let _ = ret;
    }

    fn push(&self, command: Command) {
        let mut pending = command;
        loop {
            match self.commands.push(pending) {
                Ok(()) => break,
                Err(returned) => {
                    // Queue full: give the loop thread a chance to drain.
                    std::thread::yield_now();
                    pending = returned;
                }
            }
        }
        self.notify();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        unsafe { libc::close(self.notify_fd) };
    }
}

/// Cross-thread control surface for a running [`IoScheduler`].
///
/// Commands are applied by the scheduler's own thread at its next
/// loop turn; fibers are never touched from here directly.
#[derive(Clone)]
pub struct SchedulerHandle {
    shared: Arc<Shared>,
}

impl SchedulerHandle {
    /// Force-wake the fiber waiting on `fd` for `event` with a
    /// cancellation error.
    pub fn cancel(&self, fd: RawFd, event: IoEvent) {
        self.shared.push(Command::Cancel { fd, event });
    }

    /// Force-wake every fiber waiting on `fd`.
    pub fn cancel_all(&self, fd: RawFd) {
        self.shared.push(Command::CancelAll { fd });
    }

    /// Ask the scheduler to stop. Still-suspended fibers are woken
    /// with a cancellation error and drained to completion.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.push(Command::Stop);
    }
}

/// Single-thread fiber scheduler over epoll readiness and timers.
pub struct IoScheduler {
    epfd: RawFd,
    waiters: RefCell<HashMap<RawFd, FdWaiters>>,
    timers: RefCell<BinaryHeap<TimerEntry>>,
    timer_seq: Cell<u64>,
    ready: RefCell<VecDeque<Rc<Fiber>>>,
    shared: Arc<Shared>,
    stopped: Cell<bool>,
}

impl IoScheduler {
    pub fn new() -> StrandResult<Rc<IoScheduler>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(StrandError::last_os());
        }

        let notify_fd =
            unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if notify_fd < 0 {
            let err = StrandError::last_os();
            unsafe { libc::close(epfd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: NOTIFY_TOKEN,
        };
        let ret = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, notify_fd, &mut ev) };
        if ret != 0 {
            let err = StrandError::last_os();
            unsafe {
                libc::close(notify_fd);
                libc::close(epfd);
            }
            return Err(err);
        }

        Ok(Rc::new(IoScheduler {
            epfd,
            waiters: RefCell::new(HashMap::new()),
            timers: RefCell::new(BinaryHeap::new()),
            timer_seq: Cell::new(0),
            ready: RefCell::new(VecDeque::new()),
            shared: Arc::new(Shared {
                commands: ArrayQueue::new(COMMAND_QUEUE_CAPACITY),
                notify_fd,
                stopping: AtomicBool::new(false),
            }),
            stopped: Cell::new(false),
        }))
    }

    /// A Send handle for cancel/stop from other threads.
    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Create a fiber and queue it for execution.
    pub fn spawn<F>(self: &Rc<Self>, f: F) -> Rc<Fiber>
    where
        F: FnOnce() + 'static,
    {
        let fiber = Fiber::new(f);
        self.ready.borrow_mut().push_back(fiber.clone());
        fiber
    }

    /// Queue an existing resumable fiber for execution.
    pub fn schedule(&self, fiber: Rc<Fiber>) {
        assert!(
            fiber.state().is_resumable(),
            "scheduled fiber {} while {}",
            fiber.id(),
            fiber.state()
        );
        self.ready.borrow_mut().push_back(fiber);
    }

    /// Install this scheduler as the thread's reactor without
    /// entering the loop. `run()` does this itself.
    pub fn install(self: &Rc<Self>) {
        reactor::set_current(self.clone());
    }

    /// Ask a running loop (on this thread) to stop at its next turn.
    pub fn stop(&self) {
        self.stopped.set(true);
    }

    /// Drive fibers and events until no work remains or `stop` is
    /// requested. On stop, still-suspended fibers are force-woken
    /// with a cancellation error and drained to completion, so every
    /// fiber ends in a droppable state.
    pub fn run(self: &Rc<Self>) {
        self.install();

        loop {
            self.drain_commands();
            self.run_ready();

            if self.stopped.get() || self.shared.stopping.load(Ordering::Acquire) {
                break;
            }

            self.fire_due_timers();
            if !self.ready.borrow().is_empty() {
                continue;
            }

            self.reap_settled();
            if self.is_idle() {
                break;
            }

            self.poll_wait();
        }

        self.drain_on_stop();
        reactor::clear_current();
        self.stopped.set(false);
        self.shared.stopping.store(false, Ordering::Release);
    }

    fn is_idle(&self) -> bool {
        self.ready.borrow().is_empty()
            && self.waiters.borrow().is_empty()
            && self.timers.borrow().is_empty()
    }

    /// Resume every queued fiber once; re-queue the ones that yield
    /// READY, leave HOLD for an external wake.
    fn run_ready(&self) {
        loop {
            let next = self.ready.borrow_mut().pop_front();
            let Some(fiber) = next else { break };
            if !fiber.state().is_resumable() {
                continue;
            }
            fiber.resume();
            if fiber.state() == strand_fiber::FiberState::Ready {
                self.ready.borrow_mut().push_back(fiber);
            }
        }
    }

    fn poll_wait(&self) {
        let timeout_ms = self.next_timer_timeout();

        let mut events: [libc::epoll_event; 64] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, timeout_ms)
        };
        if n < 0 {
            let e = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if e != libc::EINTR {
                serror!("epoll_wait errno={}", e);
            }
            return;
        }

        for ev in &events[..n as usize] {
            let token = ev.u64;
            if token == NOTIFY_TOKEN {
                self.drain_notify();
                continue;
            }
            let bits = ev.events;
            let error = bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
            let readable =
                error || bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0;
            let writable = error || bits & libc::EPOLLOUT as u32 != 0;
            self.dispatch(token as RawFd, readable, writable);
        }

        self.fire_due_timers();
    }

    /// Wake waiters for a descriptor that became ready (or errored;
    /// the retried syscall surfaces the actual error).
    fn dispatch(&self, fd: RawFd, readable: bool, writable: bool) {
        let mut waiters = self.waiters.borrow_mut();
        let Some(entry) = waiters.get_mut(&fd) else {
            return;
        };
        if readable {
            if let Some(w) = entry.read.take() {
                self.wake(w, WakeReason::Ready);
            }
        }
        if writable {
            if let Some(w) = entry.write.take() {
                self.wake(w, WakeReason::Ready);
            }
        }
        self.resync(&mut waiters, fd);
    }

    /// Settle and, on winning, queue the fiber. A lost settle means
    /// another source (timer, cancel, readiness) woke this suspension
    /// first; the stale wake is dropped.
    fn wake(&self, waiter: Waiter, reason: WakeReason) {
        if waiter.wait.settle(reason) {
            self.ready.borrow_mut().push_back(waiter.fiber);
        }
    }

    /// Re-register, adjust, or drop the epoll interest for `fd` after
    /// its waiter set changed.
    fn resync(&self, waiters: &mut HashMap<RawFd, FdWaiters>, fd: RawFd) {
        let Some(entry) = waiters.get(&fd) else {
            return;
        };
        if entry.is_empty() {
            waiters.remove(&fd);
            unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            return;
        }
        let mut ev = libc::epoll_event {
            events: entry.interest(),
            u64: fd as u64,
        };
        unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
    }

    fn next_timer_timeout(&self) -> i32 {
        let timers = self.timers.borrow();
        match timers.peek() {
            None => -1,
            Some(t) => {
                let now = Instant::now();
                if t.deadline <= now {
                    return 0;
                }
                let d = t.deadline - now;
                // Round up so the wait never returns before the deadline.
                let mut ms = d.as_millis();
                if d.as_nanos() % 1_000_000 != 0 {
                    ms += 1;
                }
                ms.min(i32::MAX as u128) as i32
            }
        }
    }

    fn fire_due_timers(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(t) if t.deadline <= now => timers.pop(),
                    _ => None,
                }
            };
            match due {
                Some(t) => self.wake(
                    Waiter {
                        wait: t.wait,
                        fiber: t.fiber,
                    },
                    WakeReason::Timeout,
                ),
                None => break,
            }
        }
    }

    /// Drop waiters and timers whose token was already settled by
    /// another wake source, so their fibers do not linger in the
    /// tables.
    fn reap_settled(&self) {
        {
            let mut waiters = self.waiters.borrow_mut();
            let fds: Vec<RawFd> = waiters.keys().copied().collect();
            for fd in fds {
                let entry = waiters.get_mut(&fd).unwrap();
                if entry
                    .read
                    .as_ref()
                    .is_some_and(|w| w.wait.reason() != WakeReason::Pending)
                {
                    entry.read = None;
                }
                if entry
                    .write
                    .as_ref()
                    .is_some_and(|w| w.wait.reason() != WakeReason::Pending)
                {
                    entry.write = None;
                }
                self.resync(&mut waiters, fd);
            }
        }
        self.timers
            .borrow_mut()
            .retain(|t| t.wait.reason() == WakeReason::Pending);
    }

    fn drain_notify(&self) {
        let mut counter: u64 = 0;
        loop {
            let n = unsafe {
                libc::read(
                    self.shared.notify_fd,
                    &mut counter as *mut u64 as *mut libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn drain_commands(&self) {
        while let Some(command) = self.shared.commands.pop() {
            match command {
                Command::Cancel { fd, event } => {
                    self.cancel(fd, event);
                }
                Command::CancelAll { fd } => {
                    self.cancel_all(fd);
                }
                Command::Stop => self.stopped.set(true),
            }
        }
    }

    /// After a stop request, force-wake everything still suspended so
    /// tasks observe cancellation and run to a droppable state.
    fn drain_on_stop(&self) {
        loop {
            let fds: Vec<RawFd> = self.waiters.borrow().keys().copied().collect();
            for fd in fds {
                self.cancel_all(fd);
            }
            {
                let mut timers = self.timers.borrow_mut();
                while let Some(t) = timers.pop() {
                    self.wake(
                        Waiter {
                            wait: t.wait,
                            fiber: t.fiber,
                        },
                        WakeReason::Cancelled,
                    );
                }
            }
            if self.ready.borrow().is_empty() {
                break;
            }
            self.run_ready();
        }
    }
}

impl Reactor for IoScheduler {
    fn add_watcher(
        &self,
        fd: RawFd,
        event: IoEvent,
        wait: Arc<IoWait>,
        fiber: Rc<Fiber>,
    ) -> StrandResult<()> {
        let mut waiters = self.waiters.borrow_mut();
        let existed = waiters.contains_key(&fd);
        let entry = waiters.entry(fd).or_default();

        let slot = match event {
            IoEvent::Read => &mut entry.read,
            IoEvent::Write => &mut entry.write,
        };
        if slot.is_some() {
            // One waiter per (descriptor, event); sockets are
            // exclusively owned, so a second is caller misuse.
            return Err(StrandError::InvalidState);
        }
        *slot = Some(Waiter { wait, fiber });

        let mut ev = libc::epoll_event {
            events: entry.interest(),
            u64: fd as u64,
        };
        let op = if existed {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret != 0 {
            let err = StrandError::last_os();
            serror!("epoll_ctl({}) failed: {}", fd, err);
            // Roll the slot back before reporting.
            let entry = waiters.get_mut(&fd).unwrap();
            match event {
                IoEvent::Read => entry.read = None,
                IoEvent::Write => entry.write = None,
            }
            if entry.is_empty() {
                waiters.remove(&fd);
            }
            return Err(err);
        }
        Ok(())
    }

    fn add_timer(
        &self,
        timeout: Duration,
        wait: Arc<IoWait>,
        fiber: Rc<Fiber>,
    ) -> StrandResult<()> {
        let seq = self.timer_seq.get();
        self.timer_seq.set(seq + 1);
        self.timers.borrow_mut().push(TimerEntry {
            deadline: Instant::now() + timeout,
            seq,
            wait,
            fiber,
        });
        Ok(())
    }

    fn cancel(&self, fd: RawFd, event: IoEvent) -> bool {
        let mut waiters = self.waiters.borrow_mut();
        let Some(entry) = waiters.get_mut(&fd) else {
            return false;
        };
        let slot = match event {
            IoEvent::Read => &mut entry.read,
            IoEvent::Write => &mut entry.write,
        };
        let woke = match slot.take() {
            Some(w) => {
                let won = w.wait.settle(WakeReason::Cancelled);
                if won {
                    self.ready.borrow_mut().push_back(w.fiber);
                }
                won
            }
            None => false,
        };
        self.resync(&mut waiters, fd);
        woke
    }

    fn cancel_all(&self, fd: RawFd) -> bool {
        let read = self.cancel(fd, IoEvent::Read);
        let write = self.cancel(fd, IoEvent::Write);
        read || write
    }

    fn schedule(&self, fiber: Rc<Fiber>) {
        IoScheduler::schedule(self, fiber);
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
        // notify_fd belongs to Shared and closes with the last handle.
    }
}

/// Suspend the calling fiber for at least `duration`.
///
/// Returns `Err(Cancelled)` when the wait was force-woken by a stop
/// or cancel instead of the timer.
pub fn sleep(duration: Duration) -> StrandResult<()> {
    let reactor = reactor::current().ok_or(StrandError::NoReactor)?;
    let wait = Arc::new(IoWait::new());
    reactor.add_timer(duration, wait.clone(), Fiber::current())?;
    Fiber::yield_to_hold();
    match wait.reason() {
        WakeReason::Cancelled => Err(StrandError::Cancelled),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_fiber::FiberState;

    #[test]
    fn test_ready_fibers_interleave() {
        let sched = IoScheduler::new().unwrap();
        let trace = Rc::new(RefCell::new(Vec::new()));

        let t = trace.clone();
        sched.spawn(move || {
            t.borrow_mut().push("a1");
            Fiber::yield_to_ready();
            t.borrow_mut().push("a2");
        });
        let t = trace.clone();
        sched.spawn(move || {
            t.borrow_mut().push("b1");
            Fiber::yield_to_ready();
            t.borrow_mut().push("b2");
        });

        sched.run();
        assert_eq!(*trace.borrow(), vec!["a1", "b1", "a2", "b2"]);
    }

    #[test]
    fn test_sleep_wakes_after_deadline() {
        let sched = IoScheduler::new().unwrap();
        let elapsed = Rc::new(Cell::new(Duration::ZERO));

        let e = elapsed.clone();
        sched.spawn(move || {
            let start = Instant::now();
            sleep(Duration::from_millis(30)).unwrap();
            e.set(start.elapsed());
        });

        sched.run();
        assert!(elapsed.get() >= Duration::from_millis(30));
        assert!(elapsed.get() < Duration::from_secs(2));
    }

    #[test]
    fn test_timer_order_earliest_first() {
        let sched = IoScheduler::new().unwrap();
        let trace = Rc::new(RefCell::new(Vec::new()));

        let t = trace.clone();
        sched.spawn(move || {
            sleep(Duration::from_millis(40)).unwrap();
            t.borrow_mut().push("late");
        });
        let t = trace.clone();
        sched.spawn(move || {
            sleep(Duration::from_millis(10)).unwrap();
            t.borrow_mut().push("early");
        });

        sched.run();
        assert_eq!(*trace.borrow(), vec!["early", "late"]);
    }

    #[test]
    fn test_stop_handle_from_other_thread() {
        let sched = IoScheduler::new().unwrap();
        let handle = sched.handle();

        let fiber = sched.spawn(|| loop {
            // A stop force-wakes the sleep with Cancelled.
            if sleep(Duration::from_millis(5)).is_err() {
                break;
            }
        });

        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(40));
            handle.stop();
        });

        sched.run();
        stopper.join().unwrap();
        assert_eq!(fiber.state(), FiberState::Term);
    }
}
