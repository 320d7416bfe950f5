use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use log::warn;

use crate::sys::{self, EventFd};

use super::{Interest, PollEvent, Poller, TAG_AWAKEN};

/// The level-triggered epoll facility.
///
/// A single instance serves any number of sockets, and `epoll_ctl` may run
/// concurrently with a blocked `epoll_wait`, so the multiplexer calls
/// through directly instead of queueing modifications.
pub struct EpollPoller {
    epoll: sys::Epoll,
    awakener: EventFd,
    tracked: AtomicUsize,
    terminated: AtomicBool,
}

impl EpollPoller {
    pub fn new() -> std::io::Result<EpollPoller> {
        let epoll = sys::Epoll::new()?;
        let awakener = EventFd::new()?;

        epoll.add(awakener.as_raw_fd(), TAG_AWAKEN, Interest::READ)?;

        Ok(EpollPoller {
            epoll,
            awakener,
            tracked: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
        })
    }
}

impl Poller for EpollPoller {
    fn subscribe(&self, fd: RawFd, tag: u64, interest: Interest) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }

        match self.epoll.add(fd, tag, interest) {
            Ok(()) => {
                self.tracked.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!("epoll subscribe failed for fd {}: {}", fd, e);
                false
            }
        }
    }

    fn unsubscribe(&self, fd: RawFd) -> bool {
        match self.epoll.delete(fd) {
            Ok(()) => {
                self.tracked.fetch_sub(1, Ordering::Relaxed);
                true
            }
            // The fd may already be closed, which drops it from the set.
            Err(_) => false,
        }
    }

    fn wait_for_modified(&self, results: &mut Vec<PollEvent>, timeout_ms: u64) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }

        let mut raw: Vec<libc::epoll_event> = Vec::with_capacity(256);

        match self
            .epoll
            .wait(&mut raw, Some(Duration::from_millis(timeout_ms)))
        {
            Ok(0) => false,
            Ok(_) => {
                let before = results.len();
                for event in &raw {
                    if event.u64 == TAG_AWAKEN {
                        // Left signalled on terminate so every waiter wakes.
                        if !self.terminated.load(Ordering::Acquire) {
                            let _ = self.awakener.finish();
                        }
                        continue;
                    }
                    results.push(sys::epoll::epoll_to_event(event));
                }
                results.len() > before
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => false,
            Err(e) => {
                warn!("epoll wait failed: {}", e);
                false
            }
        }
    }

    fn max_sockets(&self) -> usize {
        usize::MAX
    }

    fn count(&self) -> usize {
        self.tracked.load(Ordering::Relaxed)
    }

    fn follow_epoll(&self) -> bool {
        true
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        let _ = self.awakener.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::NetSocket;
    use std::io::Write;
    use std::net::TcpListener;

    #[test]
    fn readable_event_carries_tag() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let sock = NetSocket::connect_tcp(&addr).unwrap();
        sock.make_async();
        let (mut peer, _) = listener.accept().unwrap();

        let poller = EpollPoller::new().unwrap();
        assert!(poller.subscribe(sock.raw(), 42, Interest::READ));

        peer.write_all(b"x").unwrap();

        let mut results = Vec::new();
        let mut got = false;
        for _ in 0..50 {
            if poller.wait_for_modified(&mut results, 100) {
                got = true;
                break;
            }
        }
        assert!(got);
        assert_eq!(results[0].tag(), 42);
        assert!(results[0].events().is_readable());

        assert!(poller.unsubscribe(sock.raw()));
        sock.close();
    }

    #[test]
    fn terminate_wakes_waiters() {
        let poller = std::sync::Arc::new(EpollPoller::new().unwrap());
        let waiter = poller.clone();

        let th = std::thread::spawn(move || {
            let mut results = Vec::new();
            waiter.wait_for_modified(&mut results, 60_000);
        });

        std::thread::sleep(std::time::Duration::from_millis(50));
        poller.terminate();
        th.join().unwrap();
    }
}
