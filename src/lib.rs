//! An event-driven HTTP/1.1 and WebSocket server core.
//!
//! `swarm-ws` multiplexes thousands of long-lived TCP (or Unix-domain)
//! connections on a small pool of OS threads, over a non-blocking readiness
//! polling engine (epoll where available, `poll(2)` elsewhere). Incoming
//! HTTP requests that qualify are upgraded to RFC 6455 WebSockets; framed
//! traffic then flows between registered subprotocol callbacks and the
//! remote peers.
//!
//! # Example
//!
//! An echo server:
//!
//! ```no_run
//! use swarm_ws::ws::{Frame, WsContext, WsProtocol, WsProtocolFactory};
//! use swarm_ws::{ProtocolRegistry, ServerOptions, WsServer};
//!
//! struct EchoFactory;
//!
//! impl WsProtocolFactory for EchoFactory {
//!     fn name(&self) -> &str {
//!         "" // unnamed: accepts any subprotocol request
//!     }
//!
//!     fn create(&self) -> Box<dyn WsProtocol> {
//!         Box::new(Echo)
//!     }
//! }
//!
//! struct Echo;
//!
//! impl WsProtocol for Echo {
//!     fn on_frame(&mut self, ctx: &WsContext, frame: &Frame) {
//!         ctx.send(frame.clone());
//!     }
//! }
//!
//! let mut protocols = ProtocolRegistry::new();
//! protocols.register(Box::new(EchoFactory));
//!
//! let server = WsServer::listen("127.0.0.1:9001", protocols, ServerOptions::default()).unwrap();
//! std::thread::park();
//! # drop(server);
//! ```
//!
//! # Architecture
//!
//! The layers, bottom up:
//!
//! - [`net`], over a thin raw-syscall layer: non-blocking sockets with
//!   classified [`NetResult`] outcomes instead of errors.
//! - [`poll`]: pollers over the OS readiness facility, multiplexed behind
//!   [`PollMux`] with a thread-safe pending-event queue.
//! - [`conn`]: per-connection slots with independent read/write locks and
//!   reusable buffers.
//! - [`engine`]: drains readiness events into the slots and invokes the
//!   plugged [`ConnectionHandler`].
//! - [`registry`]: the connection arena (generation-tagged, O(1) stale
//!   rejection) plus the worker thread pool.
//! - [`http`] and [`ws`]: the protocol layers, joined by the upgrade
//!   handshake.
//! - [`server`]: the accept loop tying everything together.

#[macro_use]
mod sys;

pub mod buffer;
pub mod conn;
pub mod engine;
mod error;
mod handle;
pub mod http;
pub mod net;
pub mod poll;
pub mod registry;
pub mod server;
pub mod ws;

pub use conn::{Connection, LockSide};
pub use engine::{ConnectionHandler, Engine, EngineOptions, ReadOutcome};
pub use error::ServerError;
pub use handle::Handle;
pub use net::{BindAddr, NetResult, NetSocket, TlsLayer};
pub use poll::{Interest, PollEvent, PollMux, Poller};
pub use registry::{Registry, WorkerPool};
pub use server::{RequestHandler, ServerOptions, WsServer};
pub use ws::{Frame, Opcode, ProtocolRegistry, WsContext, WsProtocol, WsProtocolFactory};

#[cfg(feature = "stats")]
pub use server::ServerStats;
