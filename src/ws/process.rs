//! Per-connection WebSocket processing state.
//!
//! Everything here is shared between the reader thread (frame dispatch), the
//! writer thread (jumbo drain, heartbeats) and arbitrary application threads
//! (`send_frame`), so the pieces synchronize independently: phase and close
//! flags are atomics, the frame reader and outgoing queue sit behind their
//! own short-held mutexes.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Mutex;

use super::frame::{Frame, FrameReader, Opcode};
use super::upgrade::WsProtocol;

/// Connection-level phase. Strictly forward: `Create` until the upgrade
/// response is on the wire, `Run` while frames flow, `Close` once shutdown
/// started for any reason.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WsPhase {
    Create = 0,
    Run = 1,
    Close = 2,
}

/// How the engine should react to one incoming frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameAction {
    /// Data frame for the subprotocol.
    Deliver,
    /// Transmit this control reply.
    Reply(Frame),
    /// Transmit the reply, then drop the transport: the close handshake is
    /// complete.
    ReplyThenClose(Frame),
    /// Both close frames have passed; drop the transport.
    CloseNow,
    Ignore,
}

/// Outcome of one idle-scan heartbeat check.
#[derive(Debug, PartialEq, Eq)]
pub enum HeartbeatAction {
    SendPing,
    /// Too many pings went unanswered.
    Drop,
    None,
}

/// Valid close status codes a peer may echo, per RFC 6455 section 7.4.
fn is_valid_close_status(status: u16) -> bool {
    matches!(status, 1000..=1003 | 1007..=1011 | 3000..=4999)
}

pub struct WsConnState {
    phase: AtomicU8,
    pub(crate) reader: Mutex<FrameReader>,
    protocol_name: String,
    pub(crate) protocol: Mutex<Box<dyn WsProtocol>>,
    /// Negotiated Sec-WebSocket-Extensions answer, if the subprotocol
    /// opted in.
    extensions: Option<String>,
    close_sent: AtomicBool,
    close_received: AtomicBool,
    outgoing: Mutex<Vec<Frame>>,
    awaiting_pong: AtomicBool,
    missed_pongs: AtomicU32,
}

impl WsConnState {
    pub fn new(
        protocol_name: String,
        protocol: Box<dyn WsProtocol>,
        extensions: Option<String>,
    ) -> WsConnState {
        let mut reader = FrameReader::new();
        if extensions.is_some() {
            reader.allow_reserved_bits();
        }
        WsConnState {
            phase: AtomicU8::new(WsPhase::Create as u8),
            reader: Mutex::new(reader),
            protocol_name,
            protocol: Mutex::new(protocol),
            extensions,
            close_sent: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            outgoing: Mutex::new(Vec::new()),
            awaiting_pong: AtomicBool::new(false),
            missed_pongs: AtomicU32::new(0),
        }
    }

    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    pub fn extensions(&self) -> Option<&str> {
        self.extensions.as_deref()
    }

    pub fn phase(&self) -> WsPhase {
        match self.phase.load(Ordering::Acquire) {
            0 => WsPhase::Create,
            1 => WsPhase::Run,
            _ => WsPhase::Close,
        }
    }

    /// Forward-only transition; a later phase never goes back.
    pub fn advance(&self, phase: WsPhase) {
        self.phase.fetch_max(phase as u8, Ordering::AcqRel);
    }

    pub fn close_sent(&self) -> bool {
        self.close_sent.load(Ordering::Acquire)
    }

    /// Returns true the first time, so the close frame is sent exactly once.
    pub fn mark_close_sent(&self) -> bool {
        let first = !self.close_sent.swap(true, Ordering::AcqRel);
        if first {
            self.advance(WsPhase::Close);
        }
        first
    }

    /// Classify one incoming frame and update the handshake bookkeeping.
    pub fn on_frame(&self, frame: &Frame) -> FrameAction {
        match frame.opcode {
            Opcode::Ping => FrameAction::Reply(Frame::pong(frame.payload.clone())),
            Opcode::Pong => {
                self.awaiting_pong.store(false, Ordering::Release);
                self.missed_pongs.store(0, Ordering::Release);
                FrameAction::Ignore
            }
            Opcode::Close => {
                self.close_received.store(true, Ordering::Release);
                self.advance(WsPhase::Close);

                if self.mark_close_sent() {
                    let reply = match frame.close_status() {
                        Some(status) if is_valid_close_status(status) => {
                            Frame::close(status, "")
                        }
                        Some(_) => Frame::close(1002, ""),
                        None => Frame {
                            fin: true,
                            opcode: Opcode::Close,
                            payload: Vec::new(),
                        },
                    };
                    FrameAction::ReplyThenClose(reply)
                } else {
                    // Our close was already on the wire; the echo completes
                    // the handshake.
                    FrameAction::CloseNow
                }
            }
            Opcode::Text | Opcode::Binary => {
                if self.phase() == WsPhase::Run {
                    FrameAction::Deliver
                } else {
                    FrameAction::Ignore
                }
            }
            Opcode::Continuation => FrameAction::Ignore,
        }
    }

    /// Idle-scan step: decide whether to ping or give up on the peer.
    pub fn heartbeat(&self, max_missed: u32) -> HeartbeatAction {
        if self.phase() != WsPhase::Run {
            return HeartbeatAction::None;
        }

        if self.awaiting_pong.load(Ordering::Acquire) {
            let missed = self.missed_pongs.fetch_add(1, Ordering::AcqRel) + 1;
            if missed >= max_missed {
                return HeartbeatAction::Drop;
            }
        } else {
            self.awaiting_pong.store(true, Ordering::Release);
        }

        HeartbeatAction::SendPing
    }

    /// Queue a frame for the writer thread's gathering drain.
    ///
    /// `max_queue` of zero means unbounded. Refuses once the close frame is
    /// out or the queue is full.
    pub fn queue_frame(&self, frame: Frame, max_queue: usize) -> bool {
        if self.close_sent() {
            return false;
        }
        let mut outgoing = self.outgoing.lock().unwrap();
        if max_queue != 0 && outgoing.len() >= max_queue {
            return false;
        }
        outgoing.push(frame);
        true
    }

    /// Swap the queued frames out. Frames queued behind an already-sent
    /// close are dropped, never transmitted.
    pub fn drain_outgoing(&self) -> Vec<Frame> {
        let mut outgoing = self.outgoing.lock().unwrap();
        if self.close_sent() {
            outgoing.clear();
            return Vec::new();
        }
        std::mem::take(&mut *outgoing)
    }

    pub fn outgoing_len(&self) -> usize {
        self.outgoing.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::upgrade::WsProtocol;
    use crate::ws::WsContext;

    struct NullProtocol;

    impl WsProtocol for NullProtocol {
        fn on_frame(&mut self, _ctx: &WsContext, _frame: &Frame) {}
    }

    fn state() -> WsConnState {
        WsConnState::new(String::new(), Box::new(NullProtocol), None)
    }

    #[test]
    fn phase_never_goes_backward() {
        let ws = state();
        assert_eq!(ws.phase(), WsPhase::Create);
        ws.advance(WsPhase::Run);
        assert_eq!(ws.phase(), WsPhase::Run);
        ws.advance(WsPhase::Close);
        ws.advance(WsPhase::Run);
        assert_eq!(ws.phase(), WsPhase::Close);
    }

    #[test]
    fn ping_answered_with_echoing_pong() {
        let ws = state();
        ws.advance(WsPhase::Run);
        match ws.on_frame(&Frame::ping(b"stamp".to_vec())) {
            FrameAction::Reply(frame) => {
                assert_eq!(frame.opcode, Opcode::Pong);
                assert_eq!(frame.payload, b"stamp");
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn close_is_echoed_once_with_status() {
        let ws = state();
        ws.advance(WsPhase::Run);

        match ws.on_frame(&Frame::close(1000, "")) {
            FrameAction::ReplyThenClose(frame) => {
                assert_eq!(frame.close_status(), Some(1000));
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert!(ws.close_sent());
        assert_eq!(ws.phase(), WsPhase::Close);
    }

    #[test]
    fn invalid_close_status_answered_with_protocol_error() {
        let ws = state();
        ws.advance(WsPhase::Run);
        match ws.on_frame(&Frame::close(5, "")) {
            FrameAction::ReplyThenClose(frame) => {
                assert_eq!(frame.close_status(), Some(1002));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn close_after_close_sent_just_drops() {
        let ws = state();
        ws.advance(WsPhase::Run);
        assert!(ws.mark_close_sent());
        assert!(!ws.mark_close_sent());
        assert_eq!(ws.on_frame(&Frame::close(1000, "")), FrameAction::CloseNow);
    }

    #[test]
    fn heartbeat_escalates_to_drop() {
        let ws = state();
        ws.advance(WsPhase::Run);

        assert_eq!(ws.heartbeat(3), HeartbeatAction::SendPing);
        assert_eq!(ws.heartbeat(3), HeartbeatAction::SendPing);
        assert_eq!(ws.heartbeat(3), HeartbeatAction::SendPing);
        assert_eq!(ws.heartbeat(3), HeartbeatAction::Drop);

        // A pong resets the counter.
        ws.on_frame(&Frame::pong(Vec::new()));
        assert_eq!(ws.heartbeat(3), HeartbeatAction::SendPing);
    }

    #[test]
    fn queue_respects_cap_and_close() {
        let ws = state();
        ws.advance(WsPhase::Run);

        assert!(ws.queue_frame(Frame::text("a"), 2));
        assert!(ws.queue_frame(Frame::text("b"), 2));
        assert!(!ws.queue_frame(Frame::text("c"), 2));
        assert_eq!(ws.outgoing_len(), 2);

        assert_eq!(ws.drain_outgoing().len(), 2);
        assert_eq!(ws.outgoing_len(), 0);

        ws.queue_frame(Frame::text("d"), 0);
        ws.mark_close_sent();
        // Frames stuck behind a sent close never hit the wire.
        assert!(ws.drain_outgoing().is_empty());
        assert!(!ws.queue_frame(Frame::text("e"), 0));
    }
}
