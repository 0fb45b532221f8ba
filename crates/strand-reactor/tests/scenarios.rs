//! End-to-end loopback scenarios
//!
//! Each test builds one scheduler on its own thread, runs fibers that
//! exercise the socket suspension protocol against real descriptors,
//! and checks the observable contract: readiness resumes, timeouts
//! are bounded, cancellation force-wakes, and failed connects release
//! their descriptor.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use strand_core::StrandError;
use strand_fiber::FiberState;
use strand_net::reactor::IoEvent;
use strand_net::{Address, Socket};
use strand_reactor::IoScheduler;

#[test]
fn listen_connect_accept_echo() {
    let sched = IoScheduler::new().unwrap();

    let listener = Socket::tcp();
    listener.bind(&Address::loopback(0)).unwrap();
    listener.listen(8).unwrap();
    let server_addr = listener.local_address().unwrap();
    let server_port = server_addr.port();
    assert_ne!(server_port, 0);

    let server_side = Rc::new(Cell::new(false));
    let client_side = Rc::new(Cell::new(false));
    let echoed = Rc::new(RefCell::new(Vec::new()));

    let flag = server_side.clone();
    sched.spawn(move || {
        let conn = listener.accept().unwrap();
        flag.set(conn.is_connected());

        let mut buf = [0u8; 64];
        let n = conn.recv(&mut buf, 0).unwrap();
        assert_eq!(conn.send(&buf[..n], 0).unwrap(), n);
    });

    let flag = client_side.clone();
    let out = echoed.clone();
    sched.spawn(move || {
        let sock = Socket::tcp();
        sock.connect(&server_addr, Some(Duration::from_secs(2))).unwrap();
        flag.set(sock.is_connected());
        assert_eq!(sock.remote_address().unwrap().port(), server_port);

        sock.send(b"around the loop", 0).unwrap();
        let mut buf = [0u8; 64];
        let n = sock.recv(&mut buf, 0).unwrap();
        out.borrow_mut().extend_from_slice(&buf[..n]);
    });

    sched.run();

    assert!(server_side.get(), "accepted side must report connected");
    assert!(client_side.get(), "connecting side must report connected");
    assert_eq!(&*echoed.borrow(), b"around the loop");
}

#[test]
fn recv_timeout_is_bounded() {
    let sched = IoScheduler::new().unwrap();

    let result = Rc::new(RefCell::new(None));
    let elapsed = Rc::new(Cell::new(Duration::ZERO));

    let res = result.clone();
    let el = elapsed.clone();
    sched.spawn(move || {
        let sock = Socket::udp();
        sock.bind(&Address::loopback(0)).unwrap();
        sock.set_recv_timeout(Some(Duration::from_millis(50)));

        let start = Instant::now();
        let mut buf = [0u8; 16];
        *res.borrow_mut() = Some(sock.recv_from(&mut buf, 0));
        el.set(start.elapsed());
    });

    sched.run();

    let got = result.borrow_mut().take().expect("fiber must complete");
    assert_eq!(got.unwrap_err(), StrandError::Timeout);
    // Suspended, then woken by the timer: neither early nor unbounded.
    assert!(elapsed.get() >= Duration::from_millis(45), "{:?}", elapsed.get());
    assert!(elapsed.get() < Duration::from_millis(500), "{:?}", elapsed.get());
}

#[test]
fn accept_respects_recv_timeout() {
    let sched = IoScheduler::new().unwrap();

    let result = Rc::new(RefCell::new(None));
    let res = result.clone();
    sched.spawn(move || {
        let listener = Socket::tcp();
        listener.bind(&Address::loopback(0)).unwrap();
        listener.listen(1).unwrap();
        listener.set_recv_timeout(Some(Duration::from_millis(50)));

        *res.borrow_mut() = Some(listener.accept().map(|_| ()));
    });

    sched.run();
    let got = result.borrow_mut().take().expect("fiber must complete");
    assert_eq!(got.unwrap_err(), StrandError::Timeout);
}

#[test]
fn cancel_read_force_wakes_waiter() {
    let sched = IoScheduler::new().unwrap();

    let sock = Rc::new(Socket::udp());
    sock.bind(&Address::loopback(0)).unwrap();

    let result = Rc::new(RefCell::new(None));

    let s = sock.clone();
    let res = result.clone();
    let waiter = sched.spawn(move || {
        let mut buf = [0u8; 16];
        // No timeout: only an external wake can end this.
        *res.borrow_mut() = Some(s.recv_from(&mut buf, 0));
    });

    let s = sock.clone();
    sched.spawn(move || {
        // Runs after the waiter suspended (FIFO order).
        assert!(s.cancel_read());
    });

    sched.run();

    assert_eq!(waiter.state(), FiberState::Term);
    let got = result.borrow_mut().take().expect("waiter must complete");
    assert_eq!(got.unwrap_err(), StrandError::Cancelled);
}

#[test]
fn cancel_all_wakes_both_directions() {
    let sched = IoScheduler::new().unwrap();

    let sock = Rc::new(Socket::udp());
    sock.bind(&Address::loopback(0)).unwrap();

    let read_result = Rc::new(RefCell::new(None));

    let s = sock.clone();
    let res = read_result.clone();
    sched.spawn(move || {
        let mut buf = [0u8; 16];
        *res.borrow_mut() = Some(s.recv_from(&mut buf, 0));
    });

    let s = sock.clone();
    sched.spawn(move || {
        assert!(s.cancel_all());
    });

    sched.run();
    let got = read_result.borrow_mut().take().unwrap();
    assert_eq!(got.unwrap_err(), StrandError::Cancelled);
}

#[test]
fn failed_connect_releases_descriptor() {
    let sched = IoScheduler::new().unwrap();

    // Grab an ephemeral port, then close the listener so nothing
    // accepts there.
    let probe = Socket::tcp();
    probe.bind(&Address::loopback(0)).unwrap();
    let dead_addr = probe.local_address().unwrap();
    probe.close();

    let outcome = Rc::new(RefCell::new(None));
    let valid_after = Rc::new(Cell::new(true));

    let out = outcome.clone();
    let valid = valid_after.clone();
    sched.spawn(move || {
        let sock = Socket::tcp();
        let r = sock.connect(&dead_addr, Some(Duration::from_secs(2)));
        *out.borrow_mut() = Some(r);
        valid.set(sock.is_valid());
    });

    sched.run();

    let got = outcome.borrow_mut().take().expect("fiber must complete");
    assert!(got.is_err(), "connect to a dead port must fail");
    // Whatever the failure mode, the in-flight descriptor is gone.
    assert!(!valid_after.get());
}

#[test]
#[ignore = "needs a blackholed external address; run manually"]
fn connect_timeout_releases_descriptor() {
    let sched = IoScheduler::new().unwrap();

    // Non-routable test address: SYNs are dropped, the connect hangs
    // until the budget elapses.
    let blackhole: Address = "10.255.255.1:80".parse::<std::net::SocketAddr>().unwrap().into();

    let outcome = Rc::new(RefCell::new(None));
    let valid_after = Rc::new(Cell::new(true));

    let out = outcome.clone();
    let valid = valid_after.clone();
    sched.spawn(move || {
        let sock = Socket::tcp();
        let start = Instant::now();
        let r = sock.connect(&blackhole, Some(Duration::from_millis(100)));
        assert!(start.elapsed() >= Duration::from_millis(95));
        *out.borrow_mut() = Some(r);
        valid.set(sock.is_valid());
    });

    sched.run();

    let got = outcome.borrow_mut().take().expect("fiber must complete");
    assert_eq!(got.unwrap_err(), StrandError::Timeout);
    assert!(!valid_after.get());
}

#[test]
fn cross_thread_cancel_via_handle() {
    let sched = IoScheduler::new().unwrap();
    let handle = sched.handle();

    let sock = Rc::new(Socket::udp());
    sock.bind(&Address::loopback(0)).unwrap();
    let fd = sock.fd();

    let result = Rc::new(RefCell::new(None));
    let s = sock.clone();
    let res = result.clone();
    sched.spawn(move || {
        let mut buf = [0u8; 16];
        *res.borrow_mut() = Some(s.recv_from(&mut buf, 0));
    });

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        handle.cancel(fd, IoEvent::Read);
    });

    sched.run();
    canceller.join().unwrap();

    let got = result.borrow_mut().take().expect("waiter must complete");
    assert_eq!(got.unwrap_err(), StrandError::Cancelled);
}
