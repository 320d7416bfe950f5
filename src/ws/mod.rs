//! WebSocket framing, upgrade handshake, and per-connection processing.

pub mod frame;
mod process;
mod upgrade;

pub use frame::{Frame, FrameError, FrameReader, Opcode};
pub use process::{FrameAction, HeartbeatAction, WsConnState, WsPhase};
pub use upgrade::{
    accept_key, try_upgrade, ProtocolRegistry, UpgradeOutcome, WsProtocol, WsProtocolFactory,
};

use crate::handle::Handle;

/// What a subprotocol callback gets to work with: the connection identity
/// and a way to send frames back without reaching into the engine.
pub struct WsContext<'a> {
    pub handle: Handle,
    pub remote_ip: &'a str,
    pub protocol: &'a str,
    send: &'a dyn Fn(Frame) -> bool,
}

impl<'a> WsContext<'a> {
    pub(crate) fn new(
        handle: Handle,
        remote_ip: &'a str,
        protocol: &'a str,
        send: &'a dyn Fn(Frame) -> bool,
    ) -> WsContext<'a> {
        WsContext {
            handle,
            remote_ip,
            protocol,
            send,
        }
    }

    /// Send a frame to this connection. Returns false when the connection
    /// is closing or its outgoing queue refused the frame.
    pub fn send(&self, frame: Frame) -> bool {
        (self.send)(frame)
    }
}
