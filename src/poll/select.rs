use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::warn;

use crate::sys::EventFd;

use super::{Interest, PollEvent, Poller};

/// How many sockets one snapshot poller tracks before the multiplexer
/// grows another instance.
const MAX_TRACKED: usize = 512;

struct Tracked {
    fd: RawFd,
    tag: u64,
    interest: Interest,
}

/// Portable facility over `poll(2)`.
///
/// The tracked set must be stable for the duration of one `poll` call, so
/// subscription changes are only legal between waits. The [`PollMux`]
/// guarantees that by queueing changes and applying them at the head of each
/// poll cycle.
///
/// [`PollMux`]: super::PollMux
pub struct SelectPoller {
    tracked: Mutex<Vec<Tracked>>,
    awakener: EventFd,
    terminated: AtomicBool,
}

impl SelectPoller {
    pub fn new() -> io::Result<SelectPoller> {
        Ok(SelectPoller {
            tracked: Mutex::new(Vec::new()),
            awakener: EventFd::new()?,
            terminated: AtomicBool::new(false),
        })
    }
}

impl Poller for SelectPoller {
    fn subscribe(&self, fd: RawFd, tag: u64, interest: Interest) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }

        let mut tracked = self.tracked.lock().unwrap();
        if tracked.len() >= MAX_TRACKED {
            return false;
        }
        if tracked.iter().any(|t| t.fd == fd) {
            warn!("fd {} already tracked by this poller", fd);
            return false;
        }
        tracked.push(Tracked { fd, tag, interest });
        true
    }

    fn unsubscribe(&self, fd: RawFd) -> bool {
        let mut tracked = self.tracked.lock().unwrap();
        match tracked.iter().position(|t| t.fd == fd) {
            Some(pos) => {
                tracked.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    fn wait_for_modified(&self, results: &mut Vec<PollEvent>, timeout_ms: u64) -> bool {
        if self.terminated.load(Ordering::Acquire) {
            return false;
        }

        // Snapshot the set; the mux holds modifications until we return.
        let (mut pollfds, tags): (Vec<libc::pollfd>, Vec<u64>) = {
            let tracked = self.tracked.lock().unwrap();
            let mut fds = Vec::with_capacity(tracked.len() + 1);
            let mut tags = Vec::with_capacity(tracked.len());
            for t in tracked.iter() {
                let mut events: libc::c_short = 0;
                if t.interest.is_readable() {
                    events |= libc::POLLIN;
                }
                if t.interest.is_writable() {
                    events |= libc::POLLOUT;
                }
                fds.push(libc::pollfd {
                    fd: t.fd,
                    events,
                    revents: 0,
                });
                tags.push(t.tag);
            }
            fds.push(libc::pollfd {
                fd: self.awakener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            (fds, tags)
        };

        let timeout = timeout_ms.min(libc::c_int::MAX as u64) as libc::c_int;
        let ret = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout) };

        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("poll wait failed: {}", err);
            }
            return false;
        }
        if ret == 0 {
            return false;
        }

        let awakener = pollfds.pop().unwrap();
        if awakener.revents & libc::POLLIN != 0 && !self.terminated.load(Ordering::Acquire) {
            let _ = self.awakener.finish();
        }

        let before = results.len();
        for (pollfd, tag) in pollfds.iter().zip(tags) {
            let mut kind = Interest::empty();
            if pollfd.revents & (libc::POLLIN | libc::POLLPRI) != 0 {
                kind.insert(Interest::READ);
            }
            if pollfd.revents & libc::POLLOUT != 0 {
                kind.insert(Interest::WRITE);
            }
            if pollfd.revents & libc::POLLERR != 0 {
                kind.insert(Interest::ERROR);
            }
            if pollfd.revents & (libc::POLLHUP | libc::POLLRDHUP) != 0 {
                kind.insert(Interest::CLOSED);
            }
            if !kind.is_empty() {
                results.push(PollEvent::new(tag, kind));
            }
        }

        results.len() > before
    }

    fn max_sockets(&self) -> usize {
        MAX_TRACKED
    }

    fn count(&self) -> usize {
        self.tracked.lock().unwrap().len()
    }

    fn follow_epoll(&self) -> bool {
        false
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        let _ = self.awakener.wakeup();
    }
}
