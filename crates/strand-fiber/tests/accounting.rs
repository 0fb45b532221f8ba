//! Live-fiber accounting
//!
//! Runs as its own process with a single test function, so the
//! process-global counter sees no interference from parallel tests.

use std::rc::Rc;

use strand_fiber::Fiber;

#[test]
fn live_count_tracks_creation_destruction_and_roots() {
    // Pin this thread's root so it is part of the baseline.
    let root = Fiber::current();
    assert!(root.is_root());
    let baseline = Fiber::total_fibers();
    assert!(baseline >= 1);

    // Creation raises the count, destruction lowers it by exactly one.
    let a = Fiber::new(|| {});
    let b = Fiber::new(|| {});
    assert_eq!(Fiber::total_fibers(), baseline + 2);

    a.resume();
    b.resume();
    drop(a);
    assert_eq!(Fiber::total_fibers(), baseline + 1);
    drop(b);
    assert_eq!(Fiber::total_fibers(), baseline);

    // A root context counts like any other live fiber, and is
    // released with its thread.
    let handle = std::thread::spawn(move || {
        let thread_root = Fiber::current();
        assert!(thread_root.is_root());
        assert!(Rc::ptr_eq(&thread_root, &Fiber::current()));
        Fiber::total_fibers()
    });
    let inside = handle.join().unwrap();
    assert_eq!(inside, baseline + 1);
    assert_eq!(Fiber::total_fibers(), baseline);
}
