//! Raw socket calls over bare file descriptors.
//!
//! The connection slots keep their descriptor in an atomic cell, so the
//! operations here take `RawFd` instead of an owning wrapper. Ownership is
//! only materialized for listeners, see [`FileDesc`](super::FileDesc).

use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::{Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::path::Path;

use libc::{c_int, c_void, sockaddr, sockaddr_storage, socklen_t, SOCK_CLOEXEC};

pub fn new_socket(family: c_int, ty: c_int) -> io::Result<RawFd> {
    syscall!(socket(family, ty | SOCK_CLOEXEC, 0))
}

pub fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        fd,
        level,
        name,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(fd: RawFd, level: c_int, name: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        fd,
        level,
        name,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    debug_assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

/// An inet address encoded for the kernel, with its length.
pub struct RawAddr {
    storage: sockaddr_storage,
    len: socklen_t,
}

impl RawAddr {
    pub fn from_std(addr: &SocketAddr) -> RawAddr {
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
        let len = match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin;
                }
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                unsafe {
                    *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6;
                }
                mem::size_of::<libc::sockaddr_in6>()
            }
        };

        RawAddr {
            storage,
            len: len as socklen_t,
        }
    }

    pub fn as_ptr(&self) -> *const sockaddr {
        &self.storage as *const _ as *const sockaddr
    }

    pub fn len(&self) -> socklen_t {
        self.len
    }
}

pub fn sockaddr_to_addr(storage: &sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            debug_assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let sin = unsafe { *(storage as *const _ as *const libc::sockaddr_in) };
            let ip = sin.sin_addr.s_addr.to_ne_bytes();
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip.into(),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            debug_assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let sin6 = unsafe { *(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                sin6.sin6_addr.s6_addr.into(),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid address family")),
    }
}

pub fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let raw = RawAddr::from_std(addr);
    syscall!(bind(fd, raw.as_ptr(), raw.len()))?;
    Ok(())
}

pub fn bind_unix(fd: RawFd, path: &Path) -> io::Result<()> {
    let (addr, len) = unix_addr(path)?;
    syscall!(bind(fd, &addr as *const _ as *const sockaddr, len))?;
    Ok(())
}

pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let raw = RawAddr::from_std(addr);
    syscall!(connect(fd, raw.as_ptr(), raw.len()))?;
    Ok(())
}

pub fn connect_unix(fd: RawFd, path: &Path) -> io::Result<()> {
    let (addr, len) = unix_addr(path)?;
    syscall!(connect(fd, &addr as *const _ as *const sockaddr, len))?;
    Ok(())
}

fn unix_addr(path: &Path) -> io::Result<(libc::sockaddr_un, socklen_t)> {
    use std::os::unix::ffi::OsStrExt;

    let bytes = path.as_os_str().as_bytes();
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    if bytes.len() >= addr.sun_path.len() {
        return Err(Error::new(ErrorKind::InvalidInput, "socket path too long"));
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as socklen_t))
}

pub fn listen(fd: RawFd, backlog: c_int) -> io::Result<()> {
    syscall!(listen(fd, backlog))?;
    Ok(())
}

/// Accept one pending connection, returning the new descriptor and the peer
/// address when it is an inet one.
pub fn accept(fd: RawFd) -> io::Result<(RawFd, Option<SocketAddr>)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;

    let client = loop {
        match syscall!(accept4(
            fd,
            &mut storage as *mut _ as *mut sockaddr,
            &mut len,
            SOCK_CLOEXEC
        )) {
            Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
            other => break other,
        }
    }?;

    let addr = sockaddr_to_addr(&storage, len as usize).ok();
    Ok((client, addr))
}

pub fn send(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = syscall!(send(
        fd,
        buf.as_ptr() as *const c_void,
        buf.len(),
        libc::MSG_NOSIGNAL
    ))?;
    Ok(n as usize)
}

pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = syscall!(recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0))?;
    Ok(n as usize)
}

pub fn send_to(fd: RawFd, buf: &[u8], addr: &SocketAddr) -> io::Result<usize> {
    let raw = RawAddr::from_std(addr);
    let n = syscall!(sendto(
        fd,
        buf.as_ptr() as *const c_void,
        buf.len(),
        libc::MSG_NOSIGNAL,
        raw.as_ptr(),
        raw.len()
    ))?;
    Ok(n as usize)
}

pub fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut c_void,
        buf.len(),
        0,
        &mut storage as *mut _ as *mut _,
        &mut len
    ))?;
    Ok((n as usize, sockaddr_to_addr(&storage, len as usize)?))
}

pub fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let mut nonblocking = nonblocking as c_int;
    syscall!(ioctl(fd, libc::FIONBIO, &mut nonblocking)).map(|_| ())
}

/// Bytes queued in the kernel receive buffer.
pub fn bytes_pending(fd: RawFd) -> io::Result<usize> {
    let mut pending: c_int = 0;
    syscall!(ioctl(fd, libc::FIONREAD, &mut pending))?;
    Ok(pending as usize)
}

pub fn shutdown(fd: RawFd, how: Shutdown) -> io::Result<()> {
    let how = match how {
        Shutdown::Write => libc::SHUT_WR,
        Shutdown::Read => libc::SHUT_RD,
        Shutdown::Both => libc::SHUT_RDWR,
    };
    syscall!(shutdown(fd, how))?;
    Ok(())
}

pub fn close(fd: RawFd) {
    let _ = unsafe { libc::close(fd) };
}

pub fn take_error(fd: RawFd) -> io::Result<Option<Error>> {
    let raw: c_int = getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
    if raw == 0 {
        Ok(None)
    } else {
        Ok(Some(Error::from_raw_os_error(raw)))
    }
}

pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of_val(&storage) as socklen_t;
    syscall!(getsockname(fd, &mut storage as *mut _ as *mut _, &mut len))?;
    sockaddr_to_addr(&storage, len as usize)
}
