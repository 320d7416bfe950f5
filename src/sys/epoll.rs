use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::{cmp, time::Duration};

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

use crate::poll::{Interest, PollEvent};

/// Level-triggered epoll instance.
///
/// `epoll_ctl` is safe to call from any thread while another is blocked in
/// `epoll_wait`, which is what lets the engine modify subscriptions without
/// a deferred queue on this facility.
pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll { epfd })
    }

    pub fn wait(&self, evts: &mut Vec<libc::epoll_event>, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let cnt = syscall!(epoll_wait(
            self.epfd,
            evts.as_mut_ptr(),
            evts.capacity() as i32,
            timeout
        ))?;

        unsafe { evts.set_len(cnt as usize) };

        Ok(cnt as usize)
    }

    pub fn add(&self, fd: RawFd, tag: u64, interest: Interest) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: tag,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;

        Ok(())
    }

    pub fn modify(&self, fd: RawFd, tag: u64, interest: Interest) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: tag,
        };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;

        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };

        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info))?;

        Ok(())
    }
}

fn interest_to_epoll(interest: Interest) -> u32 {
    let mut kind = EPOLLRDHUP;

    if interest.is_readable() {
        kind |= EPOLLIN;
    }

    if interest.is_writable() {
        kind |= EPOLLOUT;
    }

    kind as u32
}

/// Translate one raw epoll event into the packed engine representation.
pub fn epoll_to_event(raw: &libc::epoll_event) -> PollEvent {
    let epoll = raw.events as libc::c_int;
    let mut kind = Interest::empty();

    if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
        kind = kind | Interest::READ;
    }

    if (epoll & EPOLLOUT) != 0 {
        kind = kind | Interest::WRITE;
    }

    if (epoll & EPOLLERR) != 0 {
        kind = kind | Interest::ERROR;
    }

    if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
        kind = kind | Interest::CLOSED;
    }

    PollEvent::new(raw.u64, kind)
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        let _ = unsafe { libc::close(self.epfd) };
    }
}
