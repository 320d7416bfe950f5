//! The WebSocket server: accept loop, upgrade orchestration, broadcast.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use indexmap::IndexSet;
use log::{debug, error, info, trace, warn};

use crate::conn::Connection;
use crate::engine::{ConnectionHandler, Engine, EngineOptions, ReadOutcome};
use crate::error::ServerError;
use crate::handle::Handle;
use crate::http::{self, HttpRequest, ParseOutcome};
use crate::net::{BindAddr, NetResult, NetSocket};
use crate::poll::Interest;
use crate::registry::{Registry, WorkerPool};
use crate::sys::socket as sys;
use crate::ws::{
    frame::Frame, try_upgrade, FrameAction, HeartbeatAction, Opcode, ProtocolRegistry,
    UpgradeOutcome, WsConnState, WsContext, WsPhase,
};

/// A jumbo drain round slower than this gets logged.
const SLOW_DRAIN: Duration = Duration::from_micros(500);

/// Per-connection write-lock deadline inside a drain round. One stuck
/// connection must not stall the writer thread for everyone else.
const DRAIN_WRITE_TIMEOUT_MS: u64 = 100;

/// Everything tunable on a [`WsServer`]. All fields have working defaults.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    /// Idle time before the server pings a WebSocket connection.
    pub heartbeat_delay_ms: u64,
    /// Consecutive unanswered pings before the connection is dropped.
    pub disconnect_after_invalid_heartbeat_count: u32,
    /// Zero disables Nagle on accepted sockets.
    pub send_delay_ms: u64,
    /// Lock deadline for replies produced inside callbacks.
    pub callback_answer_timeout_ms: u64,
    /// Socket-level send/receive timeout on accepted connections.
    pub keep_alive_timeout_ms: u64,
    /// Reader threads; zero picks the platform default.
    pub thread_pool_count: usize,
    /// Let the poll layer close sockets when applying deferred
    /// unsubscribes.
    pub unsubscribe_closes_socket: bool,
    /// Seconds before `on_last_operation_idle` fires; zero derives it from
    /// `heartbeat_delay_ms`.
    pub last_operation_idle_seconds: u32,
    /// Seconds before idle buffers are shrunk; zero disables.
    pub last_operation_release_memory_seconds: u32,
    /// Per-connection outgoing frame cap; zero means application-limited.
    pub max_outgoing_queue_per_connection: usize,
    /// Never send directly from `write`; always wait for write readiness.
    pub write_poll_only: bool,
    /// Fold the writer thread's duties into the readers.
    pub no_write_thread: bool,
    /// How long worker threads block waiting for events.
    pub poll_timeout_ms: u64,
    /// Set `SO_REUSEPORT` on the listener.
    pub reuse_port: bool,
    /// Force the portable `poll(2)` facility.
    pub force_select_facility: bool,
}

impl Default for ServerOptions {
    fn default() -> ServerOptions {
        ServerOptions {
            heartbeat_delay_ms: 20_000,
            disconnect_after_invalid_heartbeat_count: 5,
            send_delay_ms: 0,
            callback_answer_timeout_ms: 30_000,
            keep_alive_timeout_ms: 30_000,
            thread_pool_count: 0,
            unsubscribe_closes_socket: false,
            last_operation_idle_seconds: 0,
            last_operation_release_memory_seconds: 60,
            max_outgoing_queue_per_connection: 0,
            write_poll_only: false,
            no_write_thread: false,
            poll_timeout_ms: 30_000,
            reuse_port: false,
            force_select_facility: false,
        }
    }
}

/// The HTTP-side collaborator: header veto and plain-request handling.
pub trait RequestHandler: Send + Sync {
    /// Inspect a complete request head. Any status other than 200 is sent
    /// to the client and the connection closes.
    fn decode_headers(&self, _req: &HttpRequest) -> u16 {
        200
    }

    /// Serve a plain (non-upgrade) request.
    fn on_request(&self, _req: &HttpRequest) -> (u16, String) {
        (404, String::new())
    }

    /// A connection finished its upgrade to `protocol`.
    fn on_upgraded(&self, _handle: Handle, _protocol: &str) {}
}

struct NullRequestHandler;

impl RequestHandler for NullRequestHandler {}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    closed: AtomicU64,
    transport_faults: AtomicU64,
}

/// Aggregate server counters.
#[cfg(feature = "stats")]
#[derive(Copy, Clone, Debug, Default)]
pub struct ServerStats {
    pub accepted: u64,
    pub closed: u64,
    pub transport_faults: u64,
    pub live: usize,
}

struct ServerInner {
    engine: Arc<Engine>,
    registry: Arc<Registry>,
    protocols: ProtocolRegistry,
    request_handler: Arc<dyn RequestHandler>,
    options: ServerOptions,
    listener_fd: AtomicI32,
    local_addr: Mutex<Option<SocketAddr>>,
    bind_addr: BindAddr,
    shutting_down: AtomicBool,
    /// Handles with frames queued for the writer thread's gathering drain.
    outgoing: Mutex<IndexSet<Handle>>,
    counters: Counters,
}

/// An event-driven HTTP/1.1 + WebSocket server.
///
/// Construction binds and starts the worker pool; the server runs until
/// [`shutdown`](WsServer::shutdown) or drop.
///
/// # Examples
///
/// ```no_run
/// use swarm_ws::{ProtocolRegistry, ServerOptions, WsServer};
///
/// let registry = ProtocolRegistry::new();
/// // registry.register(...) your subprotocols
/// let server = WsServer::listen("127.0.0.1:9001", registry, ServerOptions::default()).unwrap();
/// // ...
/// server.shutdown();
/// ```
pub struct WsServer {
    inner: Arc<ServerInner>,
    accept_thread: Option<JoinHandle<()>>,
    pool: Option<WorkerPool>,
}

impl WsServer {
    /// Bind `addr` (`host:port`, bare `port`, or `unix:/path`) and start
    /// serving.
    pub fn listen(
        addr: &str,
        protocols: ProtocolRegistry,
        options: ServerOptions,
    ) -> Result<WsServer, ServerError> {
        WsServer::listen_with_handler(addr, protocols, Arc::new(NullRequestHandler), options)
    }

    pub fn listen_with_handler(
        addr: &str,
        protocols: ProtocolRegistry,
        request_handler: Arc<dyn RequestHandler>,
        options: ServerOptions,
    ) -> Result<WsServer, ServerError> {
        let bind_addr: BindAddr = addr.parse()?;
        let listener_fd = bind_listener(&bind_addr, &options)?;
        let local_addr = match bind_addr {
            BindAddr::Tcp(_) => sys::local_addr(listener_fd).ok(),
            BindAddr::Unix(_) => None,
        };

        let registry = Arc::new(Registry::new());
        let engine = Arc::new(Engine::new(
            registry.clone(),
            EngineOptions {
                write_poll_only: options.write_poll_only,
                unsubscribe_closes_socket: options.unsubscribe_closes_socket,
                force_select_facility: options.force_select_facility,
                last_operation_idle_seconds: if options.last_operation_idle_seconds > 0 {
                    options.last_operation_idle_seconds
                } else {
                    (options.heartbeat_delay_ms / 1_000).max(1) as u32
                },
                last_operation_release_memory_seconds: options
                    .last_operation_release_memory_seconds,
            },
        )?);

        let inner = Arc::new(ServerInner {
            engine: engine.clone(),
            registry,
            protocols,
            request_handler,
            options: options.clone(),
            listener_fd: AtomicI32::new(listener_fd),
            local_addr: Mutex::new(local_addr),
            bind_addr,
            shutting_down: AtomicBool::new(false),
            outgoing: Mutex::new(IndexSet::new()),
            counters: Counters::default(),
        });

        let weak: std::sync::Weak<ServerInner> = Arc::downgrade(&inner);
        engine.bind_handler(weak);

        let readers = if options.thread_pool_count > 0 {
            options.thread_pool_count
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        };

        let drain_inner = inner.clone();
        let pool = WorkerPool::start(
            engine,
            readers,
            options.no_write_thread,
            options.poll_timeout_ms,
            Arc::new(move || drain_inner.drain_outgoing_frames()),
        );

        let accept_inner = inner.clone();
        let accept_thread = std::thread::Builder::new()
            .name("swarm-accept".to_string())
            .spawn(move || accept_loop(accept_inner))
            .map_err(ServerError::Io)?;

        info!("listening on {}", inner.bind_addr);

        Ok(WsServer {
            inner,
            accept_thread: Some(accept_thread),
            pool: Some(pool),
        })
    }

    /// The bound TCP address; useful after binding port zero.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.count()
    }

    /// Send one frame to every target, encoding it once.
    ///
    /// With an empty `targets` list, every upgraded connection is
    /// addressed; otherwise each handle is looked up (duplicates are sent
    /// to once). A `timeout_ms` of zero skips write-locked connections
    /// instead of waiting. Returns the number of successful sends.
    pub fn broadcast(&self, frame: &Frame, targets: &[Handle], timeout_ms: u64) -> usize {
        self.inner.broadcast(frame, targets, timeout_ms)
    }

    /// Queue a frame on one connection for the writer thread's gathering
    /// drain.
    pub fn send_frame(&self, handle: Handle, frame: Frame) -> bool {
        self.inner.send_frame_queued(handle, frame)
    }

    /// Start a server-side close handshake and drop the transport.
    pub fn close_connection(&self, handle: Handle, status: u16) -> bool {
        let conn = match self.inner.registry.find(handle) {
            Some(conn) => conn,
            None => return false,
        };
        if let Some(ws) = conn.ws() {
            if ws.mark_close_sent() {
                let wire = Frame::close(status, "").encode(None);
                self.inner
                    .engine
                    .write(&conn, &wire, self.inner.options.callback_answer_timeout_ms);
            }
        }
        self.inner.engine.unlock_and_close(&conn, None);
        true
    }

    /// Aggregate counters since startup.
    #[cfg(feature = "stats")]
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            accepted: self.inner.counters.accepted.load(Ordering::Relaxed),
            closed: self.inner.counters.closed.load(Ordering::Relaxed),
            transport_faults: self.inner.counters.transport_faults.load(Ordering::Relaxed),
            live: self.inner.registry.count(),
        }
    }

    /// Stop accepting, close every connection, and join the workers.
    pub fn shutdown(mut self) {
        self.shutdown_in_place();
    }

    fn shutdown_in_place(&mut self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down {}", self.inner.bind_addr);

        // A sentinel connect unblocks the accept call so the loop can
        // observe the flag.
        match &self.inner.bind_addr {
            BindAddr::Tcp(_) => {
                if let Some(addr) = *self.inner.local_addr.lock().unwrap() {
                    let port = addr.port();
                    let candidates = [
                        SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), port),
                        SocketAddr::new(std::net::Ipv6Addr::LOCALHOST.into(), port),
                    ];
                    for sentinel in candidates {
                        if let Ok(sock) = NetSocket::connect_tcp(&sentinel) {
                            sock.close();
                            break;
                        }
                    }
                }
            }
            BindAddr::Unix(path) => {
                if let Ok(fd) = sys::new_socket(libc::AF_UNIX, libc::SOCK_STREAM) {
                    let _ = sys::connect_unix(fd, path);
                    sys::close(fd);
                }
            }
        }

        if let Some(th) = self.accept_thread.take() {
            let _ = th.join();
        }

        let fd = self.inner.listener_fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            sys::close(fd);
        }
        if let BindAddr::Unix(path) = &self.inner.bind_addr {
            let _ = std::fs::remove_file(path);
        }

        self.inner.engine.terminate(5_000);
        if let Some(pool) = self.pool.take() {
            pool.join();
        }

        // Tear down whatever is still connected; disconnect callbacks are
        // best-effort at this point.
        for conn in self.inner.registry.snapshot() {
            self.inner.engine.unlock_and_close(&conn, None);
        }
    }
}

impl Drop for WsServer {
    fn drop(&mut self) {
        self.shutdown_in_place();
    }
}

fn bind_listener(addr: &BindAddr, options: &ServerOptions) -> Result<RawFd, ServerError> {
    let fd = match addr {
        BindAddr::Tcp(addr) => {
            let family = match addr {
                SocketAddr::V4(..) => libc::AF_INET,
                SocketAddr::V6(..) => libc::AF_INET6,
            };
            let fd = sys::new_socket(family, libc::SOCK_STREAM)?;
            let sock = NetSocket::new(fd);
            sock.reuse_addr();
            if options.reuse_port {
                sock.reuse_port();
            }
            sock.set_linger(Some(Duration::from_secs(1)));
            if let Err(e) = sys::bind(fd, addr) {
                sys::close(fd);
                return Err(e.into());
            }
            fd
        }
        BindAddr::Unix(path) => {
            let _ = std::fs::remove_file(path);
            let fd = sys::new_socket(libc::AF_UNIX, libc::SOCK_STREAM)?;
            if let Err(e) = sys::bind_unix(fd, path) {
                sys::close(fd);
                return Err(e.into());
            }
            fd
        }
    };

    if let Err(e) = sys::listen(fd, libc::SOMAXCONN) {
        sys::close(fd);
        return Err(e.into());
    }
    Ok(fd)
}

fn accept_loop(inner: Arc<ServerInner>) {
    loop {
        let fd = inner.listener_fd.load(Ordering::Acquire);
        if fd < 0 || inner.shutting_down.load(Ordering::Acquire) {
            break;
        }

        match sys::accept(fd) {
            Ok((client, addr)) => {
                if inner.shutting_down.load(Ordering::Acquire) {
                    sys::close(client);
                    break;
                }
                inner.on_accept(client, addr);
            }
            Err(e) => match NetResult::from_error(&e) {
                NetResult::Retry => continue,
                NetResult::TooManyConnections => {
                    warn!("accept: descriptor table full, backing off");
                    std::thread::sleep(Duration::from_millis(100));
                }
                _ => {
                    if inner.shutting_down.load(Ordering::Acquire) {
                        break;
                    }
                    warn!("accept failed: {}", e);
                    std::thread::sleep(Duration::from_millis(100));
                }
            },
        }
    }
    debug!("accept loop exited");
}

impl ServerInner {
    fn on_accept(&self, fd: RawFd, addr: Option<SocketAddr>) {
        let sock = NetSocket::new(fd);
        if self.options.send_delay_ms == 0 {
            sock.set_nodelay(true);
        }
        sock.set_keepalive(true);
        if self.options.keep_alive_timeout_ms > 0 {
            let dur = Duration::from_millis(self.options.keep_alive_timeout_ms);
            sock.set_recv_timeout(dur);
            sock.set_send_timeout(dur);
        }

        let remote_ip = addr.map(|a| a.ip().to_string()).unwrap_or_default();

        let conn = match self.registry.checkout(fd, remote_ip) {
            Ok(conn) => conn,
            Err(ServerError::HandleOverflow) => {
                // The handle space never wraps; nothing to recover to.
                error!("handle space exhausted, refusing all further connections");
                sys::close(fd);
                self.shutting_down.store(true, Ordering::Release);
                return;
            }
            Err(e) => {
                warn!("cannot register connection: {}", e);
                sys::close(fd);
                return;
            }
        };

        let res = self.engine.start(&conn);
        if !res.is_ok() {
            warn!("cannot start connection {}: {}", conn.handle(), res);
            self.engine.unlock_and_close(&conn, None);
            return;
        }

        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        trace!("accepted {} from {}", conn.handle(), conn.remote_ip());
    }

    /// Direct frame transmission with the engine's spill semantics.
    fn send_frame_direct(&self, conn: &Arc<Connection>, frame: &Frame, timeout_ms: u64) -> bool {
        let ws = match conn.ws() {
            Some(ws) => ws,
            None => return false,
        };
        if frame.opcode == Opcode::Close {
            if !ws.mark_close_sent() {
                return false;
            }
        } else if ws.close_sent() {
            return false;
        }

        let wire = frame.encode(None);
        self.engine.write(conn, &wire, timeout_ms)
    }

    /// Queue a frame and post the handle on the outgoing-notify list.
    fn send_frame_queued(&self, handle: Handle, frame: Frame) -> bool {
        let conn = match self.registry.find(handle) {
            Some(conn) => conn,
            None => return false,
        };
        let ws = match conn.ws() {
            Some(ws) => ws,
            None => return false,
        };
        if !ws.queue_frame(frame, self.options.max_outgoing_queue_per_connection) {
            return false;
        }
        self.outgoing.lock().unwrap().insert(handle);
        true
    }

    /// The writer thread's gathering pass: swap the notify list out, then
    /// per connection coalesce all queued frames into a single write.
    fn drain_outgoing_frames(&self) {
        let handles: Vec<Handle> = {
            let mut outgoing = self.outgoing.lock().unwrap();
            if outgoing.is_empty() {
                return;
            }
            outgoing.drain(..).collect()
        };

        let started = Instant::now();

        for handle in handles {
            let conn = match self.registry.find(handle) {
                Some(conn) => conn,
                None => continue,
            };
            let ws = match conn.ws() {
                Some(ws) => ws,
                None => continue,
            };

            let frames = ws.drain_outgoing();
            if frames.is_empty() {
                continue;
            }

            let mut wire = Vec::new();
            for frame in &frames {
                wire.extend_from_slice(&frame.encode(None));
            }
            if !self.engine.write(&conn, &wire, DRAIN_WRITE_TIMEOUT_MS) {
                debug!("outgoing drain dropped {} frames for {}", frames.len(), handle);
            }
        }

        let elapsed = started.elapsed();
        if elapsed > SLOW_DRAIN {
            warn!("slow outgoing drain: {:?}", elapsed);
        }
    }

    fn broadcast(&self, frame: &Frame, targets: &[Handle], timeout_ms: u64) -> usize {
        if !matches!(frame.opcode, Opcode::Text | Opcode::Binary | Opcode::Close) {
            return 0;
        }

        // Encode once; every connection gets the same bytes.
        let wire = frame.encode(None);

        let conns: Vec<Arc<Connection>> = if targets.is_empty() {
            self.registry.snapshot()
        } else {
            let unique: IndexSet<Handle> = targets.iter().copied().collect();
            unique
                .into_iter()
                .filter_map(|handle| self.registry.find(handle))
                .collect()
        };

        let mut sent = 0;
        for conn in conns {
            let ws = match conn.ws() {
                Some(ws) => ws,
                None => continue,
            };
            if ws.phase() != WsPhase::Run || ws.close_sent() {
                continue;
            }
            if frame.opcode == Opcode::Close && !ws.mark_close_sent() {
                continue;
            }
            if self.engine.write(&conn, &wire, timeout_ms) {
                sent += 1;
            }
        }
        sent
    }

    /// HTTP phase of `on_read`: drive the head parser, answer or upgrade.
    fn http_step(&self, conn: &Arc<Connection>) -> ReadOutcome {
        let outcome = {
            let mut http = conn.http();
            conn.with_read_buffer(|buf| http.parse(buf))
        };

        match outcome {
            ParseOutcome::NeedsMoreData => ReadOutcome::Continue,
            ParseOutcome::Invalid => {
                let response = http::simple_response(400, "");
                self.engine
                    .write(conn, response.as_bytes(), self.options.callback_answer_timeout_ms);
                ReadOutcome::Close
            }
            ParseOutcome::HeadersComplete => {
                let (status, body) = {
                    let http = conn.http();
                    let veto = self.request_handler.decode_headers(http.request());
                    if veto != 200 {
                        (veto, String::new())
                    } else {
                        self.request_handler.on_request(http.request())
                    }
                };
                let response = http::simple_response(status, &body);
                self.engine
                    .write(conn, response.as_bytes(), self.options.callback_answer_timeout_ms);
                conn.http().mark_done();
                ReadOutcome::Close
            }
            ParseOutcome::UpgradeRequested => match self.perform_upgrade(conn) {
                // Frames may already sit in the read spill.
                Ok(()) => self.ws_step(conn),
                Err(outcome) => outcome,
            },
        }
    }

    fn perform_upgrade(&self, conn: &Arc<Connection>) -> Result<(), ReadOutcome> {
        let veto = {
            let http = conn.http();
            self.request_handler.decode_headers(http.request())
        };
        if veto != 200 {
            let response = http::simple_response(veto, "");
            self.engine
                .write(conn, response.as_bytes(), self.options.callback_answer_timeout_ms);
            return Err(ReadOutcome::Close);
        }

        let outcome = {
            let http = conn.http();
            try_upgrade(http.request(), &self.protocols)
        };

        match outcome {
            UpgradeOutcome::Refused { status, reason } => {
                debug!("upgrade refused for {}: {}", conn.handle(), reason);
                let response = http::simple_response(status, reason);
                self.engine
                    .write(conn, response.as_bytes(), self.options.callback_answer_timeout_ms);
                Err(ReadOutcome::Close)
            }
            UpgradeOutcome::Accepted {
                response,
                protocol_name,
                protocol,
                extensions,
            } => {
                // Install the framing state before the response leaves, so
                // a peer that fires frames right after the 101 never races
                // an un-upgraded slot.
                conn.http().mark_upgraded();
                let ws = conn.install_ws(WsConnState::new(
                    protocol_name.clone(),
                    protocol,
                    extensions,
                ));

                ws.advance(WsPhase::Run);
                if !self.engine.write(
                    conn,
                    response.as_bytes(),
                    self.options.callback_answer_timeout_ms,
                ) {
                    return Err(ReadOutcome::Close);
                }

                self.request_handler
                    .on_upgraded(conn.handle(), &protocol_name);

                let remote_ip = conn.remote_ip();
                let send = |frame: Frame| {
                    self.send_frame_direct(conn, &frame, self.options.callback_answer_timeout_ms)
                };
                let ctx = WsContext::new(conn.handle(), &remote_ip, ws.protocol_name(), &send);
                ws.protocol.lock().unwrap().on_connect(&ctx);

                info!(
                    "{} upgraded to websocket ({})",
                    conn.handle(),
                    if protocol_name.is_empty() {
                        "unnamed"
                    } else {
                        &protocol_name
                    }
                );
                Ok(())
            }
        }
    }

    /// WebSocket phase of `on_read`: pull frames out of the read buffer and
    /// dispatch them.
    fn ws_step(&self, conn: &Arc<Connection>) -> ReadOutcome {
        let ws = match conn.ws() {
            Some(ws) => ws,
            None => return ReadOutcome::Close,
        };

        loop {
            let mut reader = ws.reader.lock().unwrap();
            let stepped = conn.with_read_buffer(|buf| reader.step(buf));
            drop(reader);

            let frame = match stepped {
                Ok(Some(frame)) => frame,
                Ok(None) => return ReadOutcome::Continue,
                Err(e) => {
                    debug!("protocol error from {}: {}", conn.handle(), e);
                    if ws.mark_close_sent() {
                        let close = Frame::close(e.close_status(), "").encode(None);
                        self.engine.write(conn, &close, 0);
                    }
                    return ReadOutcome::Close;
                }
            };

            match ws.on_frame(&frame) {
                FrameAction::Deliver => {
                    let remote_ip = conn.remote_ip();
                    let send = |frame: Frame| {
                        self.send_frame_direct(
                            conn,
                            &frame,
                            self.options.callback_answer_timeout_ms,
                        )
                    };
                    let ctx =
                        WsContext::new(conn.handle(), &remote_ip, ws.protocol_name(), &send);
                    ws.protocol.lock().unwrap().on_frame(&ctx, &frame);
                }
                FrameAction::Reply(reply) => {
                    let wire = reply.encode(None);
                    self.engine
                        .write(conn, &wire, self.options.callback_answer_timeout_ms);
                }
                FrameAction::ReplyThenClose(reply) => {
                    let wire = reply.encode(None);
                    self.engine
                        .write(conn, &wire, self.options.callback_answer_timeout_ms);
                    return ReadOutcome::Close;
                }
                FrameAction::CloseNow => return ReadOutcome::Close,
                FrameAction::Ignore => {}
            }
        }
    }
}

impl ConnectionHandler for ServerInner {
    fn on_read(&self, conn: &Arc<Connection>) -> ReadOutcome {
        if conn.ws().is_some() {
            self.ws_step(conn)
        } else {
            self.http_step(conn)
        }
    }

    fn on_close(&self, conn: &Arc<Connection>) {
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        if !conn.last_error().is_recoverable() && conn.last_error() != NetResult::Closed {
            self.counters.transport_faults.fetch_add(1, Ordering::Relaxed);
        }

        self.outgoing.lock().unwrap().swap_remove(&conn.handle());

        if let Some(ws) = conn.ws() {
            let remote_ip = conn.remote_ip();
            let send = |_frame: Frame| false;
            let ctx = WsContext::new(conn.handle(), &remote_ip, ws.protocol_name(), &send);
            // Disconnect notifications are best-effort.
            let _ = catch_unwind(AssertUnwindSafe(|| {
                ws.protocol.lock().unwrap().on_disconnect(&ctx)
            }));
        }
        trace!("{} closed ({})", conn.handle(), conn.last_error());
    }

    fn on_error(&self, conn: &Arc<Connection>, events: Interest) -> bool {
        debug!("transport error on {}: {:?}", conn.handle(), events);
        false
    }

    fn on_last_operation_idle(&self, conn: &Arc<Connection>, idle_secs: u32) {
        let ws = match conn.ws() {
            Some(ws) => ws,
            None => return,
        };
        if (idle_secs as u64) * 1_000 < self.options.heartbeat_delay_ms {
            return;
        }

        match ws.heartbeat(self.options.disconnect_after_invalid_heartbeat_count) {
            HeartbeatAction::SendPing => {
                let ping = Frame::ping(Vec::new()).encode(None);
                // Zero timeout: a busy writer means traffic, no ping needed.
                self.engine.write(conn, &ping, 0);
            }
            HeartbeatAction::Drop => {
                info!("{} dropped after missed heartbeats", conn.handle());
                self.engine.unlock_and_close(conn, None);
            }
            HeartbeatAction::None => {}
        }
    }
}
