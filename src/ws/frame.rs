//! RFC 6455 frame encoding and the resumable frame reader.

use std::fmt;

use crate::buffer::ByteBuffer;

/// Frames above this are refused with a 1009 close. Fragmented messages are
/// bounded by the same limit once assembled.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Frame type, per RFC 6455 section 5.2.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0,
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl Opcode {
    pub fn from_u4(bits: u8) -> Option<Opcode> {
        match bits {
            0 => Some(Opcode::Continuation),
            1 => Some(Opcode::Text),
            2 => Some(Opcode::Binary),
            8 => Some(Opcode::Close),
            9 => Some(Opcode::Ping),
            10 => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn is_control(self) -> bool {
        (self as u8) & 0b1000 != 0
    }
}

/// One complete frame, payload already unmasked.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn text(payload: impl Into<Vec<u8>>) -> Frame {
        Frame {
            fin: true,
            opcode: Opcode::Text,
            payload: payload.into(),
        }
    }

    pub fn binary(payload: impl Into<Vec<u8>>) -> Frame {
        Frame {
            fin: true,
            opcode: Opcode::Binary,
            payload: payload.into(),
        }
    }

    pub fn ping(payload: impl Into<Vec<u8>>) -> Frame {
        Frame {
            fin: true,
            opcode: Opcode::Ping,
            payload: payload.into(),
        }
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Frame {
        Frame {
            fin: true,
            opcode: Opcode::Pong,
            payload: payload.into(),
        }
    }

    /// A close frame carrying `status` and a reason capped at the control
    /// frame limit.
    pub fn close(status: u16, reason: &str) -> Frame {
        let reason = &reason.as_bytes()[..reason.len().min(123)];
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&status.to_be_bytes());
        payload.extend_from_slice(reason);
        Frame {
            fin: true,
            opcode: Opcode::Close,
            payload,
        }
    }

    /// The status carried by a close frame, when present.
    pub fn close_status(&self) -> Option<u16> {
        if self.opcode == Opcode::Close && self.payload.len() >= 2 {
            Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
        } else {
            None
        }
    }

    /// Serialize, masking with `mask` when given. Server-to-client frames
    /// pass `None` and go out with the mask bit clear.
    pub fn encode(&self, mask: Option<[u8; 4]>) -> Vec<u8> {
        debug_assert!(!self.opcode.is_control() || self.payload.len() <= 125);

        let first = (if self.fin { 0x80 } else { 0 }) | self.opcode as u8;
        let len = self.payload.len();
        let mask_bit = if mask.is_some() { 0x80 } else { 0 };

        let mut out = Vec::with_capacity(len + 14);
        out.push(first);

        if len < 126 {
            out.push(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match mask {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(&self.payload);
                apply_mask(key, &mut out[start..]);
            }
            None => out.extend_from_slice(&self.payload),
        }

        out
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Frame({:?}, fin: {}, {} bytes)",
            self.opcode,
            self.fin,
            self.payload.len()
        )
    }
}

/// XOR `data` in place with the 4-byte key.
pub fn apply_mask(key: [u8; 4], data: &mut [u8]) {
    if key == [0, 0, 0, 0] {
        return;
    }
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

/// Why an incoming byte stream stopped being a WebSocket conversation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameError {
    BadOpcode,
    ReservedBitsSet,
    UnmaskedClientFrame,
    FragmentedControlFrame,
    OversizedControlFrame,
    UnexpectedContinuation,
    DataFrameMidMessage,
    PayloadTooLarge,
}

impl FrameError {
    /// Close status to send before dropping the peer.
    pub fn close_status(self) -> u16 {
        match self {
            FrameError::PayloadTooLarge => 1009,
            _ => 1002,
        }
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            FrameError::BadOpcode => "unknown opcode",
            FrameError::ReservedBitsSet => "reserved bits set without a negotiated extension",
            FrameError::UnmaskedClientFrame => "client frame without mask",
            FrameError::FragmentedControlFrame => "fragmented control frame",
            FrameError::OversizedControlFrame => "control frame over 125 bytes",
            FrameError::UnexpectedContinuation => "continuation without a message in progress",
            FrameError::DataFrameMidMessage => "new data frame while a message is in progress",
            FrameError::PayloadTooLarge => "payload exceeds the configured limit",
        };
        write!(fmt, "{}", msg)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ReadState {
    WaitHeader2,
    WaitExtLen,
    WaitMask,
    WaitPayload,
}

/// Resumable parser for the incoming frame stream.
///
/// Holds partial progress between reads: each [`step`](FrameReader::step)
/// consumes what the read buffer has and either suspends (`Ok(None)`) or
/// yields one message. Fragmented data frames are assembled internally and
/// surface as a single frame with `fin` set; control frames pass through
/// interleaved, as the RFC allows.
pub struct FrameReader {
    state: ReadState,
    fin: bool,
    opcode: Opcode,
    masked: bool,
    ext_len_bytes: usize,
    payload_len: usize,
    mask: [u8; 4],
    payload: Vec<u8>,
    fragment_opcode: Option<Opcode>,
    fragments: Vec<u8>,
    require_mask: bool,
    allow_reserved_bits: bool,
    max_payload: usize,
}

impl FrameReader {
    /// A reader for the server side: client frames must be masked.
    pub fn new() -> FrameReader {
        FrameReader::with_limits(true, DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_limits(require_mask: bool, max_payload: usize) -> FrameReader {
        FrameReader {
            state: ReadState::WaitHeader2,
            fin: false,
            opcode: Opcode::Continuation,
            masked: false,
            ext_len_bytes: 0,
            payload_len: 0,
            mask: [0; 4],
            payload: Vec::new(),
            fragment_opcode: None,
            fragments: Vec::new(),
            require_mask,
            allow_reserved_bits: false,
            max_payload,
        }
    }

    /// Let a negotiated extension own the reserved bits.
    pub fn allow_reserved_bits(&mut self) {
        self.allow_reserved_bits = true;
    }

    /// Advance on whatever `buf` holds. Returns a complete message, or
    /// `None` when more bytes are needed.
    pub fn step(&mut self, buf: &mut ByteBuffer) -> Result<Option<Frame>, FrameError> {
        loop {
            match self.state {
                ReadState::WaitHeader2 => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    let head = buf.take(2);
                    self.parse_header2(head[0], head[1])?;
                }
                ReadState::WaitExtLen => {
                    if buf.len() < self.ext_len_bytes {
                        return Ok(None);
                    }
                    let raw = buf.take(self.ext_len_bytes);
                    let len = if self.ext_len_bytes == 2 {
                        u16::from_be_bytes([raw[0], raw[1]]) as u64
                    } else {
                        u64::from_be_bytes(raw.try_into().unwrap())
                    };
                    if len > self.max_payload as u64 {
                        return Err(FrameError::PayloadTooLarge);
                    }
                    self.payload_len = len as usize;
                    self.state = ReadState::WaitMask;
                }
                ReadState::WaitMask => {
                    if self.masked {
                        if buf.len() < 4 {
                            return Ok(None);
                        }
                        let raw = buf.take(4);
                        self.mask.copy_from_slice(&raw);
                    }
                    self.payload.clear();
                    self.payload.reserve(self.payload_len);
                    self.state = ReadState::WaitPayload;
                }
                ReadState::WaitPayload => {
                    let missing = self.payload_len - self.payload.len();
                    if missing > 0 {
                        let chunk = buf.take(missing);
                        if chunk.is_empty() {
                            return Ok(None);
                        }
                        self.payload.extend_from_slice(&chunk);
                        if self.payload.len() < self.payload_len {
                            return Ok(None);
                        }
                    }

                    if self.masked {
                        apply_mask(self.mask, &mut self.payload);
                    }

                    self.state = ReadState::WaitHeader2;
                    if let Some(frame) = self.finish_frame()? {
                        return Ok(Some(frame));
                    }
                    // A non-final fragment: keep consuming.
                }
            }
        }
    }

    fn parse_header2(&mut self, b0: u8, b1: u8) -> Result<(), FrameError> {
        if b0 & 0b0111_0000 != 0 && !self.allow_reserved_bits {
            return Err(FrameError::ReservedBitsSet);
        }

        self.fin = b0 & 0x80 != 0;
        self.opcode = Opcode::from_u4(b0 & 0x0f).ok_or(FrameError::BadOpcode)?;
        self.masked = b1 & 0x80 != 0;

        if self.require_mask && !self.masked {
            return Err(FrameError::UnmaskedClientFrame);
        }
        if self.opcode.is_control() {
            if !self.fin {
                return Err(FrameError::FragmentedControlFrame);
            }
            if b1 & 0x7f > 125 {
                return Err(FrameError::OversizedControlFrame);
            }
        }

        match b1 & 0x7f {
            126 => {
                self.ext_len_bytes = 2;
                self.state = ReadState::WaitExtLen;
            }
            127 => {
                self.ext_len_bytes = 8;
                self.state = ReadState::WaitExtLen;
            }
            len => {
                self.payload_len = len as usize;
                self.state = ReadState::WaitMask;
            }
        }

        Ok(())
    }

    /// Fold a completed wire frame into the fragmentation state. Returns a
    /// frame to surface, or `None` when it was a non-final fragment.
    fn finish_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let payload = std::mem::take(&mut self.payload);

        if self.opcode.is_control() {
            return Ok(Some(Frame {
                fin: true,
                opcode: self.opcode,
                payload,
            }));
        }

        match self.opcode {
            Opcode::Continuation => {
                let opcode = self
                    .fragment_opcode
                    .ok_or(FrameError::UnexpectedContinuation)?;
                if self.fragments.len() + payload.len() > self.max_payload {
                    return Err(FrameError::PayloadTooLarge);
                }
                self.fragments.extend_from_slice(&payload);
                if self.fin {
                    self.fragment_opcode = None;
                    Ok(Some(Frame {
                        fin: true,
                        opcode,
                        payload: std::mem::take(&mut self.fragments),
                    }))
                } else {
                    Ok(None)
                }
            }
            opcode => {
                if self.fragment_opcode.is_some() {
                    return Err(FrameError::DataFrameMidMessage);
                }
                if self.fin {
                    Ok(Some(Frame {
                        fin: true,
                        opcode,
                        payload,
                    }))
                } else {
                    self.fragment_opcode = Some(opcode);
                    self.fragments = payload;
                    Ok(None)
                }
            }
        }
    }
}

impl Default for FrameReader {
    fn default() -> FrameReader {
        FrameReader::new()
    }
}
