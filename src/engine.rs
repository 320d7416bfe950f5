//! The async sockets engine: pollers below, callbacks above.
//!
//! Worker threads call [`process_read`](Engine::process_read) and
//! [`process_write`](Engine::process_write) in a loop; each call takes one
//! readiness event off the matching multiplexer, resolves its tag through
//! the registry (stale tags from deleted connections are dropped there) and
//! drives the connection's buffers, invoking the plugged
//! [`ConnectionHandler`] at the protocol seams.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::conn::{Connection, LockSide};
use crate::net::{NetResult, TlsLayer};
use crate::poll::{Interest, PollEvent, PollMux};
use crate::registry::Registry;

/// Read drains go through a stack chunk of this size.
const READ_CHUNK: usize = 32 * 1024;

/// What `on_read` wants done with the connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Continue,
    Close,
}

/// The capability set plugged into the engine.
///
/// One implementation serves all connections of a server; per-connection
/// state lives in the [`Connection`] slot. Callbacks run on worker threads:
/// `on_read` under the connection's read lock, `after_write` under its write
/// lock, `on_close` after both locks were drained. A panic inside any
/// callback closes the connection and the server carries on.
pub trait ConnectionHandler: Send + Sync {
    /// Bytes arrived in the read buffer. Consume what is parseable.
    fn on_read(&self, conn: &Arc<Connection>) -> ReadOutcome;

    /// The write buffer was fully flushed.
    fn after_write(&self, _conn: &Arc<Connection>) {}

    /// The connection is gone. Called exactly once, with no concurrent
    /// `on_read` or `after_write` in flight.
    fn on_close(&self, _conn: &Arc<Connection>) {}

    /// A transport error was reported. Return true to keep the connection.
    fn on_error(&self, _conn: &Arc<Connection>, _events: Interest) -> bool {
        false
    }

    /// The idle scan found no activity for `idle_secs`.
    fn on_last_operation_idle(&self, _conn: &Arc<Connection>, _idle_secs: u32) {}
}

/// Engine construction knobs; a subset of the server options.
#[derive(Clone, Debug, Default)]
pub struct EngineOptions {
    /// Never attempt a direct send from `write`; always queue and wait for
    /// write readiness.
    pub write_poll_only: bool,
    /// Let the read multiplexer close sockets when applying deferred
    /// unsubscribes.
    pub unsubscribe_closes_socket: bool,
    /// Force the `poll(2)` facility even where epoll exists.
    pub force_select_facility: bool,
    /// Seconds of inactivity before `on_last_operation_idle` fires.
    /// Zero disables the callback.
    pub last_operation_idle_seconds: u32,
    /// Seconds of inactivity before idle buffers are shrunk. Zero disables
    /// the garbage collection.
    pub last_operation_release_memory_seconds: u32,
}

pub struct Engine {
    registry: Arc<Registry>,
    read_mux: PollMux,
    write_mux: PollMux,
    handler: OnceLock<Weak<dyn ConnectionHandler>>,
    tls: Option<Arc<dyn TlsLayer>>,
    options: EngineOptions,
    started: Instant,
    in_flight: AtomicUsize,
}

impl Engine {
    pub fn new(registry: Arc<Registry>, options: EngineOptions) -> std::io::Result<Engine> {
        let (read_mux, write_mux) = if options.force_select_facility {
            (
                PollMux::with_select_facility(options.unsubscribe_closes_socket)?,
                PollMux::with_select_facility(false)?,
            )
        } else {
            (
                PollMux::new(options.unsubscribe_closes_socket)?,
                PollMux::new(false)?,
            )
        };

        Ok(Engine {
            registry,
            read_mux,
            write_mux,
            handler: OnceLock::new(),
            tls: None,
            options,
            started: Instant::now(),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Plug the callback set. Must happen before the first `start`.
    pub fn bind_handler(&self, handler: Weak<dyn ConnectionHandler>) {
        if self.handler.set(handler).is_err() {
            warn!("engine handler was already bound");
        }
    }

    pub fn set_tls(&mut self, tls: Arc<dyn TlsLayer>) {
        self.tls = Some(tls);
    }

    fn handler(&self) -> Option<Arc<dyn ConnectionHandler>> {
        self.handler.get().and_then(|weak| weak.upgrade())
    }

    /// Seconds since the engine started; the clock `last_operation_sec`
    /// values are measured on.
    pub fn uptime_sec(&self) -> u32 {
        self.started.elapsed().as_secs() as u32
    }

    pub fn terminated(&self) -> bool {
        self.read_mux.terminated()
    }

    /// Make the connection's socket non-blocking and subscribe it for read
    /// readiness.
    pub fn start(&self, conn: &Arc<Connection>) -> NetResult {
        let socket = match conn.socket() {
            Some(socket) => socket,
            None => return NetResult::NoSocket,
        };

        let res = socket.make_async();
        if !res.is_ok() {
            return res;
        }

        // The idle clock starts at subscription, not at first traffic.
        conn.set_last_operation_sec(self.uptime_sec());

        if !self
            .read_mux
            .subscribe(socket.raw(), conn.tag(), Interest::READ)
        {
            return NetResult::Fatal;
        }

        trace!("connection {} started", conn.handle());
        NetResult::Ok
    }

    /// Tear the transport down.
    ///
    /// Atomically clears the socket cell (so every concurrent operation
    /// starts observing `NoSocket`), unsubscribes both sides, drains the
    /// kernel error slot, shuts the socket down, and finally waits out both
    /// side locks so no callback is mid-flight when this returns.
    ///
    /// Returns true for the caller that actually performed the stop; the
    /// `on_close` notification belongs to that caller alone.
    pub fn stop(&self, conn: &Arc<Connection>) -> bool {
        let socket = match conn.take_socket() {
            Some(socket) => socket,
            None => return false,
        };

        let tag = conn.tag();
        self.read_mux.unsubscribe(socket.raw(), tag);
        self.write_mux.unsubscribe(socket.raw(), tag);
        self.read_mux.delete_one_pending(tag);
        self.write_mux.delete_one_pending(tag);

        let mut drain = [0u8; 1];
        let _ = socket.recv(&mut drain);
        if self.options.unsubscribe_closes_socket {
            // The read multiplexer owns the close once the deferred
            // unsubscribe is applied.
            let _ = socket.shutdown(true);
        } else {
            socket.shutdown_and_close(true);
        }

        for side in [LockSide::Read, LockSide::Write] {
            if conn.wait_lock(side, 5_000) {
                conn.unlock(side);
            } else {
                warn!(
                    "connection {}: {:?} side still busy while stopping",
                    conn.handle(),
                    side
                );
            }
        }

        trace!("connection {} stopped", conn.handle());
        true
    }

    /// Send `data`, directly when possible, spilling the rest into the
    /// write buffer. Returns false when the write lock could not be taken
    /// within `timeout_ms` or the transport failed.
    pub fn write(&self, conn: &Arc<Connection>, data: &[u8], timeout_ms: u64) -> bool {
        if data.is_empty() {
            return true;
        }
        if !conn.try_lock(LockSide::Write, timeout_ms) {
            return false;
        }

        let socket = match conn.socket() {
            Some(socket) => socket,
            None => {
                conn.unlock(LockSide::Write);
                return false;
            }
        };

        let buffer = unsafe { conn.write_buffer() };
        let mut rest: &[u8] = data;

        if buffer.is_empty() && !self.options.write_poll_only {
            let (res, sent) = self.transport_send(socket, data);
            match res {
                NetResult::Ok => {
                    conn.unlock(LockSide::Write);
                    self.notify_after_write(conn);
                    return true;
                }
                NetResult::Retry => rest = &data[sent..],
                _ => {
                    // Closing here could deadlock against a lock the caller
                    // holds; the poll loop observes the dead socket and
                    // performs the close with nothing held.
                    conn.set_last_error(res);
                    conn.unlock(LockSide::Write);
                    return false;
                }
            }
        }

        buffer.append(rest);
        self.subscribe_write(conn, &socket);
        conn.unlock(LockSide::Write);
        true
    }

    fn subscribe_write(&self, conn: &Arc<Connection>, socket: &crate::net::NetSocket) {
        if conn.begin_write_subscription()
            && !self
                .write_mux
                .subscribe(socket.raw(), conn.tag(), Interest::WRITE)
        {
            conn.end_write_subscription();
        }
    }

    /// Take one read-side event and dispatch it. Returns true when an event
    /// was handled (even if it turned out stale).
    pub fn process_read(&self, timeout_ms: u64) -> bool {
        let mut ev = PollEvent::new(0, Interest::empty());
        if !self.read_mux.get_one(timeout_ms, &mut ev) {
            return false;
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.dispatch_read(ev);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        true
    }

    fn dispatch_read(&self, ev: PollEvent) {
        let conn = match self.registry.resolve_tag(ev.tag()) {
            Some(conn) => conn,
            None => {
                debug!("stale read event for tag {}", ev.tag());
                return;
            }
        };
        let events = ev.events();

        if events.is_error() {
            let keep = self
                .handler()
                .map(|h| {
                    catch_unwind(AssertUnwindSafe(|| h.on_error(&conn, events)))
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            if !keep {
                conn.set_last_error(NetResult::Fatal);
                self.unlock_and_close(&conn, None);
                return;
            }
        }

        if events.is_readable() {
            // Strict: when another thread is mid-read, leave the event to
            // the level-triggered facility to re-report.
            if !conn.lock_now(LockSide::Read) {
                return;
            }
            self.drain_read(&conn);
            return;
        }

        if events.is_closed() {
            conn.set_last_error(NetResult::Closed);
            self.unlock_and_close(&conn, None);
        }
    }

    /// Pull everything the kernel has into the read buffer, then hand it to
    /// `on_read`. Enters with the read lock held; always releases it.
    fn drain_read(&self, conn: &Arc<Connection>) {
        let socket = match conn.socket() {
            Some(socket) => socket,
            None => {
                conn.unlock(LockSide::Read);
                return;
            }
        };

        let mut transport_down = NetResult::Ok;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let (res, n) = self.transport_recv(socket, &mut chunk);
            if n > 0 {
                unsafe { conn.read_buffer() }.append(&chunk[..n]);
            }
            match res {
                NetResult::Ok => continue,
                NetResult::Retry => break,
                other => {
                    transport_down = other;
                    break;
                }
            }
        }

        let has_bytes = !unsafe { conn.read_buffer() }.is_empty();
        let outcome = if has_bytes {
            match self.handler() {
                Some(handler) => {
                    catch_unwind(AssertUnwindSafe(|| handler.on_read(conn))).unwrap_or_else(
                        |_| {
                            warn!("on_read panicked for {}", conn.handle());
                            ReadOutcome::Close
                        },
                    )
                }
                None => ReadOutcome::Close,
            }
        } else {
            ReadOutcome::Continue
        };

        if !transport_down.is_recoverable() || outcome == ReadOutcome::Close {
            if !transport_down.is_recoverable() {
                conn.set_last_error(transport_down);
            }
            self.unlock_and_close(conn, Some(LockSide::Read));
        } else {
            conn.unlock(LockSide::Read);
        }
    }

    /// Take one write-side event: drain the write buffer, and once it is
    /// empty drop the write subscription and fire `after_write`.
    pub fn process_write(&self, timeout_ms: u64) -> bool {
        let mut ev = PollEvent::new(0, Interest::empty());
        if !self.write_mux.get_one(timeout_ms, &mut ev) {
            return false;
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.dispatch_write(ev);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        true
    }

    fn dispatch_write(&self, ev: PollEvent) {
        let conn = match self.registry.resolve_tag(ev.tag()) {
            Some(conn) => conn,
            None => {
                debug!("stale write event for tag {}", ev.tag());
                return;
            }
        };

        // Anything but a pure write notification means the transport is in
        // trouble; the read side owns error reporting, this side closes.
        if ev.events() != Interest::WRITE {
            conn.set_last_error(if ev.events().is_closed() {
                NetResult::Closed
            } else {
                NetResult::Fatal
            });
            self.unlock_and_close(&conn, None);
            return;
        }

        if !conn.lock_now(LockSide::Write) {
            // Another thread holds the writer; requeue so the flush is not
            // lost on an edge-style facility.
            self.write_mux
                .add_one_pending(conn.tag(), Interest::WRITE, true);
            return;
        }

        let socket = match conn.socket() {
            Some(socket) => socket,
            None => {
                conn.unlock(LockSide::Write);
                return;
            }
        };

        let buffer = unsafe { conn.write_buffer() };
        let (res, sent) = self.transport_send(socket, buffer.as_slice());
        buffer.consume(sent);

        match res {
            NetResult::Ok if buffer.is_empty() => {
                conn.end_write_subscription();
                self.write_mux.unsubscribe(socket.raw(), conn.tag());
                conn.unlock(LockSide::Write);
                self.notify_after_write(&conn);
            }
            NetResult::Ok | NetResult::Retry => {
                conn.unlock(LockSide::Write);
            }
            other => {
                conn.set_last_error(other);
                self.unlock_and_close(&conn, Some(LockSide::Write));
            }
        }
    }

    fn notify_after_write(&self, conn: &Arc<Connection>) {
        if let Some(handler) = self.handler() {
            if catch_unwind(AssertUnwindSafe(|| handler.after_write(conn))).is_err() {
                warn!("after_write panicked for {}", conn.handle());
                self.unlock_and_close(conn, None);
            }
        }
    }

    /// Release the held lock (if any), stop the transport, fire `on_close`
    /// once, and drop the connection from the registry.
    pub fn unlock_and_close(&self, conn: &Arc<Connection>, held: Option<LockSide>) {
        if let Some(side) = held {
            conn.unlock(side);
        }

        if self.stop(conn) {
            if let Some(handler) = self.handler() {
                if catch_unwind(AssertUnwindSafe(|| handler.on_close(conn))).is_err() {
                    warn!("on_close panicked for {}", conn.handle());
                }
            }
            self.registry.remove(conn);
        }
    }

    /// The once-per-second pass over all connections.
    ///
    /// Connections that took a lock since the last scan get their
    /// `last_operation_sec` stamped; the rest are measured against the
    /// memory-release and idle thresholds. Per-connection failures are
    /// swallowed; the scan always completes.
    pub fn idle_every_second(&self) {
        let now = self.uptime_sec();
        let release_after = self.options.last_operation_release_memory_seconds;
        let idle_after = self.options.last_operation_idle_seconds;

        for conn in self.registry.snapshot() {
            if !conn.has_socket() {
                continue;
            }

            if conn.take_active() {
                conn.set_last_operation_sec(now);
                continue;
            }

            let idle = now.saturating_sub(conn.last_operation_sec());

            if release_after > 0 && idle >= release_after {
                if conn.lock_now(LockSide::Read) {
                    if conn.lock_now(LockSide::Write) {
                        conn.release_memory();
                        conn.unlock(LockSide::Write);
                    }
                    conn.unlock(LockSide::Read);
                }
            } else if idle_after > 0 && idle >= idle_after {
                if let Some(handler) = self.handler() {
                    let _ = catch_unwind(AssertUnwindSafe(|| {
                        handler.on_last_operation_idle(&conn, idle)
                    }));
                }
            }
        }
    }

    /// Stop the multiplexers and wait up to `wait_ms` for in-flight
    /// processors to drain.
    pub fn terminate(&self, wait_ms: u64) {
        self.read_mux.terminate();
        self.write_mux.terminate();

        let deadline = Instant::now() + Duration::from_millis(wait_ms);
        while self.in_flight.load(Ordering::Acquire) > 0 {
            if Instant::now() >= deadline {
                warn!(
                    "terminating with {} processors still in flight",
                    self.in_flight.load(Ordering::Acquire)
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn transport_recv(&self, socket: crate::net::NetSocket, buf: &mut [u8]) -> (NetResult, usize) {
        match &self.tls {
            Some(tls) => tls.receive(socket, buf),
            None => socket.recv(buf),
        }
    }

    fn transport_send(&self, socket: crate::net::NetSocket, buf: &[u8]) -> (NetResult, usize) {
        match &self.tls {
            Some(tls) => tls.send(socket, buf),
            None => socket.send(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Mutex;

    /// Records engine callbacks; echoes nothing.
    struct StubHandler {
        reads: Mutex<Vec<Vec<u8>>>,
        closes: AtomicUsize,
        after_writes: AtomicUsize,
    }

    impl StubHandler {
        fn new() -> Arc<StubHandler> {
            Arc::new(StubHandler {
                reads: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
                after_writes: AtomicUsize::new(0),
            })
        }
    }

    impl ConnectionHandler for StubHandler {
        fn on_read(&self, conn: &Arc<Connection>) -> ReadOutcome {
            let bytes = conn.with_read_buffer(|buf| {
                let n = buf.len();
                buf.take(n)
            });
            self.reads.lock().unwrap().push(bytes);
            ReadOutcome::Continue
        }

        fn after_write(&self, _conn: &Arc<Connection>) {
            self.after_writes.fetch_add(1, Ordering::SeqCst);
        }

        fn on_close(&self, _conn: &Arc<Connection>) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn rig(handler: &Arc<StubHandler>) -> (Arc<Registry>, Engine) {
        let registry = Arc::new(Registry::new());
        let engine = Engine::new(registry.clone(), EngineOptions::default()).unwrap();
        let weak: Weak<StubHandler> = Arc::downgrade(handler);
        engine.bind_handler(weak);
        (registry, engine)
    }

    fn connect(
        registry: &Arc<Registry>,
        engine: &Engine,
    ) -> (Arc<Connection>, std::net::TcpStream, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sock = crate::net::NetSocket::connect_tcp(&addr).unwrap();
        let (peer, _) = listener.accept().unwrap();

        let conn = registry
            .add(Connection::new(sock.raw(), "127.0.0.1".into()))
            .unwrap();
        assert_eq!(engine.start(&conn), NetResult::Ok);
        (conn, peer, listener)
    }

    #[test]
    fn read_event_delivers_ordered_bytes() {
        let handler = StubHandler::new();
        let (registry, engine) = rig(&handler);
        let (conn, mut peer, _listener) = connect(&registry, &engine);

        peer.write_all(b"first").unwrap();
        while !engine.process_read(200) {}

        peer.write_all(b"second").unwrap();
        while !engine.process_read(200) {}

        let reads = handler.reads.lock().unwrap();
        let all: Vec<u8> = reads.iter().flatten().copied().collect();
        assert_eq!(all, b"firstsecond");
        drop(reads);

        engine.unlock_and_close(&conn, None);
    }

    #[test]
    fn peer_close_fires_on_close_once() {
        let handler = StubHandler::new();
        let (registry, engine) = rig(&handler);
        let (conn, peer, _listener) = connect(&registry, &engine);

        drop(peer);
        // Drain events until the close lands.
        for _ in 0..100 {
            engine.process_read(50);
            if handler.closes.load(Ordering::SeqCst) == 1 {
                break;
            }
        }
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);

        // A second close attempt is a no-op.
        engine.unlock_and_close(&conn, None);
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
        assert!(registry.find(conn.handle()).is_none());
    }

    #[test]
    fn write_spills_and_flushes_via_write_events() {
        let handler = StubHandler::new();
        let (registry, engine) = rig(&handler);
        let (conn, mut peer, _listener) = connect(&registry, &engine);

        // A payload far beyond the socket buffer forces a partial direct
        // send and a spill into the write buffer.
        conn.socket().unwrap().set_send_buffer_size(8 * 1024);
        let payload = vec![0x5a_u8; 4 * 1024 * 1024];
        assert!(engine.write(&conn, &payload, 1_000));

        let reader = std::thread::spawn(move || {
            let mut got = Vec::new();
            let mut chunk = [0u8; 64 * 1024];
            loop {
                match peer.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => got.extend_from_slice(&chunk[..n]),
                }
                if got.len() == 4 * 1024 * 1024 {
                    break;
                }
            }
            got
        });

        while conn.write_backlog() > 0 {
            engine.process_write(200);
        }

        let got = reader.join().unwrap();
        assert_eq!(got.len(), payload.len());
        assert!(got == payload);
        assert!(handler.after_writes.load(Ordering::SeqCst) >= 1);

        engine.unlock_and_close(&conn, None);
    }

    #[test]
    fn write_times_out_when_lock_is_held() {
        let handler = StubHandler::new();
        let (registry, engine) = rig(&handler);
        let (conn, _peer, _listener) = connect(&registry, &engine);

        assert!(conn.lock_now(LockSide::Write));
        let backlog_before = conn.write_backlog();
        assert!(!engine.write(&conn, b"data", 30));
        assert_eq!(conn.write_backlog(), backlog_before);
        conn.unlock(LockSide::Write);

        engine.unlock_and_close(&conn, None);
    }

    #[test]
    fn stale_tag_is_ignored() {
        let handler = StubHandler::new();
        let (registry, engine) = rig(&handler);
        let (conn, mut peer, _listener) = connect(&registry, &engine);

        let tag = conn.tag();
        engine.unlock_and_close(&conn, None);
        let _ = peer.write_all(b"late");

        // Resolution of the dead tag must fail rather than touch a slot.
        assert!(registry.resolve_tag(tag).is_none());
    }

    #[test]
    fn panicking_on_read_closes_the_connection() {
        struct PanicHandler {
            closes: AtomicUsize,
        }

        impl ConnectionHandler for PanicHandler {
            fn on_read(&self, _conn: &Arc<Connection>) -> ReadOutcome {
                panic!("application bug")
            }

            fn on_close(&self, _conn: &Arc<Connection>) {
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }

        let handler = Arc::new(PanicHandler {
            closes: AtomicUsize::new(0),
        });
        let registry = Arc::new(Registry::new());
        let engine = Engine::new(registry.clone(), EngineOptions::default()).unwrap();
        let weak: Weak<PanicHandler> = Arc::downgrade(&handler);
        engine.bind_handler(weak);

        let (conn, mut peer, _listener) = connect(&registry, &engine);
        peer.write_all(b"boom").unwrap();

        for _ in 0..100 {
            engine.process_read(50);
            if handler.closes.load(Ordering::SeqCst) == 1 {
                break;
            }
        }
        assert_eq!(handler.closes.load(Ordering::SeqCst), 1);
        assert!(!conn.has_socket());
    }
}
