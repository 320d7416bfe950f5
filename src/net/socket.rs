use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::poll::Interest;
use crate::sys::socket as sys;

use super::NetResult;

/// Copyable view of a connected socket descriptor.
///
/// `NetSocket` does not own the descriptor: the connection slot does, via its
/// atomic fd cell, and hands out short-lived views while a slot lock is held.
/// Every operation returns a [`NetResult`] and never panics; OS errors are
/// classified, not raised.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NetSocket(RawFd);

impl NetSocket {
    pub fn new(fd: RawFd) -> NetSocket {
        NetSocket(fd)
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Open a TCP socket and connect it, blocking. Used by the shutdown
    /// sentinel and by test clients.
    pub fn connect_tcp(addr: &SocketAddr) -> io::Result<NetSocket> {
        let fd = sys::new_socket(inet_family(addr), libc::SOCK_STREAM)?;
        if let Err(e) = sys::connect(fd, addr) {
            sys::close(fd);
            return Err(e);
        }
        Ok(NetSocket(fd))
    }

    /// Connect with a deadline: the socket goes non-blocking, the
    /// in-progress connect is awaited with `poll`, and the pending error
    /// slot decides the outcome.
    pub fn connect_timeout(addr: &SocketAddr, timeout: Duration) -> (NetResult, Option<NetSocket>) {
        let fd = match sys::new_socket(inet_family(addr), libc::SOCK_STREAM) {
            Ok(fd) => fd,
            Err(e) => return (NetResult::from_error(&e), None),
        };
        let sock = NetSocket(fd);

        if !sock.make_async().is_ok() {
            sock.close();
            return (NetResult::Fatal, None);
        }

        match sys::connect(fd, addr) {
            Ok(()) => return (NetResult::Ok, Some(sock)),
            Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => (),
            Err(e) => {
                let res = NetResult::from_error(&e);
                sock.close();
                return (res, None);
            }
        }

        match sock.wait_for(timeout, Interest::WRITE) {
            NetResult::Ok => match sock.take_error() {
                None => (NetResult::Ok, Some(sock)),
                Some(e) => {
                    let res = NetResult::from_error(&e);
                    sock.close();
                    (res, None)
                }
            },
            NetResult::Retry => {
                sock.close();
                (NetResult::ConnectTimeout, None)
            }
            other => {
                // Refused connections surface as HUP on Linux; the error
                // slot has the precise reason.
                let res = sock
                    .take_error()
                    .map(|e| NetResult::from_error(&e))
                    .unwrap_or(other);
                sock.close();
                (res, None)
            }
        }
    }

    /// A UDP socket bound to `addr`, for the datagram send/receive calls.
    pub fn bind_udp(addr: &SocketAddr) -> io::Result<NetSocket> {
        let fd = sys::new_socket(inet_family(addr), libc::SOCK_DGRAM)?;
        if let Err(e) = sys::bind(fd, addr) {
            sys::close(fd);
            return Err(e);
        }
        Ok(NetSocket(fd))
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        sys::local_addr(self.0).ok()
    }

    pub fn make_async(&self) -> NetResult {
        match sys::set_nonblocking(self.0, true) {
            Ok(()) => NetResult::Ok,
            Err(e) => NetResult::from_error(&e),
        }
    }

    pub fn make_blocking(&self) -> NetResult {
        match sys::set_nonblocking(self.0, false) {
            Ok(()) => NetResult::Ok,
            Err(e) => NetResult::from_error(&e),
        }
    }

    /// Send as much of `buf` as the kernel will take right now.
    ///
    /// Returns the classified outcome and the byte count actually written.
    /// `Retry` with a short count means the send buffer filled mid-way.
    pub fn send(&self, buf: &[u8]) -> (NetResult, usize) {
        let mut sent = 0;

        while sent < buf.len() {
            match sys::send(self.0, &buf[sent..]) {
                Ok(0) => return (NetResult::Closed, sent),
                Ok(n) => sent += n,
                Err(e) => return (NetResult::from_error(&e), sent),
            }
        }

        (NetResult::Ok, sent)
    }

    /// Receive into `buf`, once. A graceful peer shutdown (`recv` of zero)
    /// reports `Closed`.
    pub fn recv(&self, buf: &mut [u8]) -> (NetResult, usize) {
        match sys::recv(self.0, buf) {
            Ok(0) => (NetResult::Closed, 0),
            Ok(n) => (NetResult::Ok, n),
            Err(e) => (NetResult::from_error(&e), 0),
        }
    }

    pub fn send_to(&self, buf: &[u8], addr: &SocketAddr) -> (NetResult, usize) {
        match sys::send_to(self.0, buf, addr) {
            Ok(n) => (NetResult::Ok, n),
            Err(e) => (NetResult::from_error(&e), 0),
        }
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> (NetResult, usize, Option<SocketAddr>) {
        match sys::recv_from(self.0, buf) {
            Ok((n, addr)) => (NetResult::Ok, n, Some(addr)),
            Err(e) => (NetResult::from_error(&e), 0, None),
        }
    }

    /// Block up to `timeout` for any of `interest` on this one descriptor.
    pub fn wait_for(&self, timeout: Duration, interest: Interest) -> NetResult {
        let mut events: libc::c_short = 0;
        if interest.is_readable() {
            events |= libc::POLLIN;
        }
        if interest.is_writable() {
            events |= libc::POLLOUT;
        }

        let mut pollfd = libc::pollfd {
            fd: self.0,
            events,
            revents: 0,
        };

        let timeout = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

        match syscall!(poll(&mut pollfd, 1, timeout)) {
            Ok(0) => NetResult::Retry,
            Ok(_) => {
                if pollfd.revents & (libc::POLLHUP | libc::POLLRDHUP) != 0 {
                    NetResult::Closed
                } else if pollfd.revents & libc::POLLERR != 0 {
                    NetResult::Fatal
                } else {
                    NetResult::Ok
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => NetResult::Retry,
            Err(e) => NetResult::from_error(&e),
        }
    }

    /// Bytes already queued in the kernel receive buffer.
    pub fn recv_pending(&self) -> (NetResult, usize) {
        match sys::bytes_pending(self.0) {
            Ok(n) => (NetResult::Ok, n),
            Err(e) => (NetResult::from_error(&e), 0),
        }
    }

    /// Half or full shutdown without closing the descriptor.
    pub fn shutdown(&self, rdwr: bool) -> NetResult {
        let how = if rdwr { Shutdown::Both } else { Shutdown::Write };
        match sys::shutdown(self.0, how) {
            Ok(()) => NetResult::Ok,
            Err(e) => NetResult::from_error(&e),
        }
    }

    /// Half or full shutdown followed by close. The descriptor is invalid
    /// afterwards regardless of the outcome.
    pub fn shutdown_and_close(&self, rdwr: bool) {
        let _ = self.shutdown(rdwr);
        sys::close(self.0);
    }

    pub fn close(&self) {
        sys::close(self.0);
    }

    pub fn set_keepalive(&self, enabled: bool) -> NetResult {
        to_result(sys::setsockopt(
            self.0,
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            enabled as libc::c_int,
        ))
    }

    pub fn set_nodelay(&self, nodelay: bool) -> NetResult {
        to_result(sys::setsockopt(
            self.0,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            nodelay as libc::c_int,
        ))
    }

    pub fn set_linger(&self, linger: Option<Duration>) -> NetResult {
        let linger = libc::linger {
            l_onoff: linger.is_some() as libc::c_int,
            l_linger: linger.map(|d| d.as_secs() as libc::c_int).unwrap_or(0),
        };
        to_result(sys::setsockopt(
            self.0,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            linger,
        ))
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> NetResult {
        to_result(sys::setsockopt(
            self.0,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            size as libc::c_int,
        ))
    }

    pub fn set_send_buffer_size(&self, size: usize) -> NetResult {
        to_result(sys::setsockopt(
            self.0,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            size as libc::c_int,
        ))
    }

    pub fn reuse_addr(&self) -> NetResult {
        to_result(sys::setsockopt(
            self.0,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            1 as libc::c_int,
        ))
    }

    pub fn reuse_port(&self) -> NetResult {
        to_result(sys::setsockopt(
            self.0,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            1 as libc::c_int,
        ))
    }

    pub fn set_recv_timeout(&self, dur: Duration) -> NetResult {
        to_result(sys::setsockopt(
            self.0,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            to_timeval(dur),
        ))
    }

    pub fn set_send_timeout(&self, dur: Duration) -> NetResult {
        to_result(sys::setsockopt(
            self.0,
            libc::SOL_SOCKET,
            libc::SO_SNDTIMEO,
            to_timeval(dur),
        ))
    }

    pub fn take_error(&self) -> Option<io::Error> {
        sys::take_error(self.0).ok().flatten()
    }
}

fn inet_family(addr: &SocketAddr) -> libc::c_int {
    match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    }
}

fn to_result(res: io::Result<()>) -> NetResult {
    match res {
        Ok(()) => NetResult::Ok,
        Err(e) => NetResult::from_error(&e),
    }
}

fn to_timeval(dur: Duration) -> libc::timeval {
    let mut tv = libc::timeval {
        tv_sec: dur.as_secs() as libc::time_t,
        tv_usec: dur.subsec_micros() as libc::suseconds_t,
    };
    if tv.tv_sec == 0 && tv.tv_usec == 0 {
        tv.tv_usec = 1;
    }
    tv
}
