//! Echo server on fibers
//!
//! One worker thread, one fiber per connection, blocking-style I/O.
//!
//! ```text
//! strand-echo [port]          # default 7000
//! STRAND_LOG_LEVEL=debug strand-echo 9000
//! ```
//!
//! Try it with: `nc 127.0.0.1 7000`

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use strand::{sinfo, swarn, Address, IoScheduler, Socket};

fn main() {
    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(7000);

    let sched = IoScheduler::new().expect("epoll setup failed");

    let listener = Socket::tcp();
    let bind_addr: Address = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into();
    listener.bind(&bind_addr).expect("bind failed");
    listener.listen(128).expect("listen failed");
    sinfo!("echo listening on {}", listener.local_address().unwrap());

    sched.spawn(move || loop {
        let conn = match listener.accept() {
            Ok(conn) => conn,
            Err(e) => {
                swarn!("accept failed: {}", e);
                break;
            }
        };
        sinfo!("client {}", conn.remote_address().map(|a| a.to_string()).unwrap_or_default());

        strand::spawn_with(move || {
            // Idle connections are shed rather than held forever.
            conn.set_recv_timeout(Some(Duration::from_secs(60)));
            let mut buf = [0u8; 4096];
            loop {
                match conn.recv(&mut buf, 0) {
                    Ok(0) => break,
                    Ok(n) => {
                        if conn.send(&buf[..n], 0).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        swarn!("connection dropped: {}", e);
                        break;
                    }
                }
            }
        });
    });

    sched.run();
}
