//! The per-connection slot: socket cell, buffers, and the two side locks.

use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::buffer::ByteBuffer;
use crate::handle::Handle;
use crate::http::HttpConnState;
use crate::net::{NetResult, NetSocket};
use crate::ws::WsConnState;

const NO_SOCKET: RawFd = -1;

/// Which side of a connection a lock protects.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LockSide {
    Read,
    Write,
}

/// A one-deep counting lock.
///
/// Acquisition atomically increments the counter and succeeds only when the
/// post-increment value is one; otherwise the increment is rolled back.
/// Not re-entrant: a holder attempting to re-acquire will fail.
#[derive(Debug, Default)]
pub struct SlotLock {
    count: AtomicU32,
}

impl SlotLock {
    pub fn new() -> SlotLock {
        SlotLock {
            count: AtomicU32::new(0),
        }
    }

    /// One acquisition attempt, no waiting.
    pub fn try_enter(&self) -> bool {
        if self.count.fetch_add(1, Ordering::AcqRel) == 0 {
            true
        } else {
            self.count.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    pub fn leave(&self) {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced SlotLock::leave");
    }

    pub fn held(&self) -> bool {
        self.count.load(Ordering::Acquire) > 0
    }
}

/// One live connection.
///
/// The reader side (read buffer, protocol parse) and the writer side (write
/// buffer, sends) may proceed concurrently, each serialized by its own
/// [`SlotLock`]. The buffer cells are `UnsafeCell`s whose access contract is
/// "hold the matching lock"; the unsafe accessors assert that in debug
/// builds.
pub struct Connection {
    fd: AtomicI32,
    handle: AtomicU32,
    /// Arena tag the registry assigned; packed into poll events.
    tag: AtomicU64,
    remote_ip: Mutex<String>,
    read_lock: SlotLock,
    write_lock: SlotLock,
    read_buffer: UnsafeCell<ByteBuffer>,
    write_buffer: UnsafeCell<ByteBuffer>,
    last_error: Mutex<NetResult>,
    was_active: AtomicBool,
    last_operation_sec: AtomicU32,
    write_subscribed: AtomicBool,
    http: Mutex<HttpConnState>,
    ws: Mutex<Option<Arc<WsConnState>>>,
}

// The UnsafeCell contents are guarded by the side locks.
unsafe impl Send for Connection {}
unsafe impl Sync for Connection {}

impl Connection {
    pub fn new(fd: RawFd, remote_ip: String) -> Connection {
        Connection {
            fd: AtomicI32::new(fd),
            handle: AtomicU32::new(0),
            tag: AtomicU64::new(0),
            remote_ip: Mutex::new(remote_ip),
            read_lock: SlotLock::new(),
            write_lock: SlotLock::new(),
            read_buffer: UnsafeCell::new(ByteBuffer::new()),
            write_buffer: UnsafeCell::new(ByteBuffer::new()),
            last_error: Mutex::new(NetResult::Ok),
            was_active: AtomicBool::new(false),
            last_operation_sec: AtomicU32::new(0),
            write_subscribed: AtomicBool::new(false),
            http: Mutex::new(HttpConnState::new()),
            ws: Mutex::new(None),
        }
    }

    /// The current socket, or `None` once the slot was stopped.
    pub fn socket(&self) -> Option<NetSocket> {
        match self.fd.load(Ordering::Acquire) {
            NO_SOCKET => None,
            fd => Some(NetSocket::new(fd)),
        }
    }

    /// Atomically clear the socket cell. Only the first caller gets the
    /// socket; the Some→None transition never reverses.
    pub fn take_socket(&self) -> Option<NetSocket> {
        match self.fd.swap(NO_SOCKET, Ordering::AcqRel) {
            NO_SOCKET => None,
            fd => Some(NetSocket::new(fd)),
        }
    }

    pub fn has_socket(&self) -> bool {
        self.fd.load(Ordering::Acquire) != NO_SOCKET
    }

    pub fn handle(&self) -> Handle {
        Handle(self.handle.load(Ordering::Acquire))
    }

    pub(crate) fn set_handle(&self, handle: Handle) {
        self.handle.store(handle.0, Ordering::Release);
    }

    pub fn tag(&self) -> u64 {
        self.tag.load(Ordering::Acquire)
    }

    pub(crate) fn set_tag(&self, tag: u64) {
        self.tag.store(tag, Ordering::Release);
    }

    pub fn remote_ip(&self) -> String {
        self.remote_ip.lock().unwrap().clone()
    }

    fn lock_of(&self, side: LockSide) -> &SlotLock {
        match side {
            LockSide::Read => &self.read_lock,
            LockSide::Write => &self.write_lock,
        }
    }

    /// One immediate acquisition attempt.
    pub fn lock_now(&self, side: LockSide) -> bool {
        if self.lock_of(side).try_enter() {
            self.was_active.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Acquire with a bounded spin: 0 ms and 1 ms sleeps alternate until
    /// the lock is free, the timeout passes, or the socket disappears.
    pub fn try_lock(&self, side: LockSide, timeout_ms: u64) -> bool {
        self.try_lock_inner(side, timeout_ms, true)
    }

    /// Like [`try_lock`](Connection::try_lock) but keeps waiting after the
    /// socket is cleared. `stop` uses this to drain in-flight callbacks.
    pub fn wait_lock(&self, side: LockSide, timeout_ms: u64) -> bool {
        self.try_lock_inner(side, timeout_ms, false)
    }

    fn try_lock_inner(&self, side: LockSide, timeout_ms: u64, need_socket: bool) -> bool {
        if need_socket && !self.has_socket() {
            return false;
        }
        if self.lock_now(side) {
            return true;
        }
        if timeout_ms == 0 {
            return false;
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut tick = 0u32;

        loop {
            std::thread::sleep(Duration::from_millis((tick & 1) as u64));
            tick += 1;

            if need_socket && !self.has_socket() {
                return false;
            }
            if self.lock_now(side) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
        }
    }

    pub fn unlock(&self, side: LockSide) {
        self.lock_of(side).leave();
    }

    pub fn locked(&self, side: LockSide) -> bool {
        self.lock_of(side).held()
    }

    /// # Safety
    /// The caller must hold the read lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn read_buffer(&self) -> &mut ByteBuffer {
        debug_assert!(self.read_lock.held());
        &mut *self.read_buffer.get()
    }

    /// # Safety
    /// The caller must hold the write lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn write_buffer(&self) -> &mut ByteBuffer {
        debug_assert!(self.write_lock.held());
        &mut *self.write_buffer.get()
    }

    /// Work with the read buffer from inside `on_read`, where the engine
    /// holds the read lock.
    pub fn with_read_buffer<R>(&self, f: impl FnOnce(&mut ByteBuffer) -> R) -> R {
        debug_assert!(self.read_lock.held());
        f(unsafe { &mut *self.read_buffer.get() })
    }

    /// Bytes queued for sending. Advisory; the writer may be flushing.
    pub fn write_backlog(&self) -> usize {
        unsafe { (*self.write_buffer.get()).len() }
    }

    pub fn last_error(&self) -> NetResult {
        *self.last_error.lock().unwrap()
    }

    pub fn set_last_error(&self, err: NetResult) {
        *self.last_error.lock().unwrap() = err;
    }

    /// Clear the activity flag, reporting whether any lock was taken since
    /// the previous scan.
    pub fn take_active(&self) -> bool {
        self.was_active.swap(false, Ordering::AcqRel)
    }

    pub fn last_operation_sec(&self) -> u32 {
        self.last_operation_sec.load(Ordering::Acquire)
    }

    pub fn set_last_operation_sec(&self, sec: u32) {
        self.last_operation_sec.store(sec, Ordering::Release);
    }

    /// One shot per subscription: true when the caller should subscribe the
    /// socket for write readiness.
    pub(crate) fn begin_write_subscription(&self) -> bool {
        !self.write_subscribed.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_write_subscription(&self) {
        self.write_subscribed.store(false, Ordering::Release);
    }

    pub fn http(&self) -> std::sync::MutexGuard<'_, HttpConnState> {
        self.http.lock().unwrap()
    }

    /// The WebSocket state installed at upgrade, if any.
    pub fn ws(&self) -> Option<Arc<WsConnState>> {
        self.ws.lock().unwrap().clone()
    }

    pub(crate) fn install_ws(&self, state: WsConnState) -> Arc<WsConnState> {
        let state = Arc::new(state);
        *self.ws.lock().unwrap() = Some(state.clone());
        state
    }

    /// Shrink both buffers. Caller holds both locks.
    pub(crate) fn release_memory(&self) {
        debug_assert!(self.read_lock.held() && self.write_lock.held());
        unsafe {
            (*self.read_buffer.get()).release_memory();
            (*self.write_buffer.get()).release_memory();
        }
    }

    /// Refit a cleared slot for a fresh accept. The caller guarantees no
    /// other thread references this connection any more.
    pub(crate) fn recycle(&self, fd: RawFd, remote_ip: String) {
        debug_assert!(!self.has_socket());
        unsafe {
            (*self.read_buffer.get()).clear();
            (*self.write_buffer.get()).clear();
        }
        *self.remote_ip.lock().unwrap() = remote_ip;
        *self.last_error.lock().unwrap() = NetResult::Ok;
        self.was_active.store(false, Ordering::Release);
        self.last_operation_sec.store(0, Ordering::Release);
        self.write_subscribed.store(false, Ordering::Release);
        self.http.lock().unwrap().reset();
        *self.ws.lock().unwrap() = None;
        self.handle.store(0, Ordering::Release);
        self.tag.store(0, Ordering::Release);
        self.fd.store(fd, Ordering::Release);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "Connection(handle: {}, fd: {})",
            self.handle(),
            self.fd.load(Ordering::Relaxed)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_lock_is_one_deep_and_not_reentrant() {
        let lock = SlotLock::new();
        assert!(lock.try_enter());
        assert!(!lock.try_enter());
        lock.leave();
        assert!(lock.try_enter());
        lock.leave();
    }

    #[test]
    fn reader_and_writer_are_orthogonal() {
        let conn = Connection::new(10, "127.0.0.1".into());
        assert!(conn.lock_now(LockSide::Read));
        assert!(conn.lock_now(LockSide::Write));
        assert!(!conn.lock_now(LockSide::Read));
        assert!(!conn.lock_now(LockSide::Write));
        conn.unlock(LockSide::Read);
        conn.unlock(LockSide::Write);
        // Never close fd 10; this slot is synthetic.
        conn.take_socket();
    }

    #[test]
    fn try_lock_gives_up_without_a_socket() {
        let conn = Connection::new(-1, String::new());
        assert!(!conn.try_lock(LockSide::Read, 50));
        // wait_lock ignores the missing socket.
        assert!(conn.wait_lock(LockSide::Read, 50));
        conn.unlock(LockSide::Read);
    }

    #[test]
    fn try_lock_times_out_against_a_holder() {
        let conn = Arc::new(Connection::new(11, String::new()));
        assert!(conn.lock_now(LockSide::Write));

        let contender = conn.clone();
        let th = std::thread::spawn(move || contender.try_lock(LockSide::Write, 30));
        assert!(!th.join().unwrap());

        conn.unlock(LockSide::Write);
        assert!(conn.try_lock(LockSide::Write, 30));
        conn.unlock(LockSide::Write);
        conn.take_socket();
    }

    #[test]
    fn take_socket_happens_once() {
        let conn = Connection::new(12, String::new());
        assert!(conn.has_socket());
        assert_eq!(conn.take_socket().map(|s| s.raw()), Some(12));
        assert_eq!(conn.take_socket(), None);
        assert!(!conn.has_socket());
    }

    #[test]
    fn activity_flag_set_by_lock_acquisition() {
        let conn = Connection::new(13, String::new());
        assert!(!conn.take_active());
        conn.lock_now(LockSide::Read);
        conn.unlock(LockSide::Read);
        assert!(conn.take_active());
        assert!(!conn.take_active());
        conn.take_socket();
    }
}
