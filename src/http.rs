//! Incremental HTTP/1.1 request-head parsing, as far as the engine needs it.
//!
//! The engine only cares whether a request head is complete, whether it asks
//! for a WebSocket upgrade, and about a handful of named headers. Bodies and
//! the application response model stay outside the core.

use crate::buffer::ByteBuffer;

/// Hard cap on the request head. Anything larger is a malformed or hostile
/// client.
const MAX_HEAD_BYTES: usize = 16 * 1024;

const MAX_HEADERS: usize = 128;

/// Forward-only request parse state. Reverts to `WaitingRequestLine` only
/// when a keep-alive slot is recycled.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HttpState {
    WaitingRequestLine,
    InHeaders,
    Upgraded,
    Done,
}

/// What one `parse` step concluded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParseOutcome {
    NeedsMoreData,
    HeadersComplete,
    UpgradeRequested,
    Invalid,
}

/// A parsed request head.
#[derive(Debug, Default)]
pub struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    headers: Vec<(String, String)>,
}

impl HttpRequest {
    /// Case-insensitive single-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// True when the named header's comma-separated values include `token`.
    pub fn header_has_token(&self, name: &str, token: &str) -> bool {
        self.header(name)
            .map(|v| {
                v.split(',')
                    .any(|part| part.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    fn clear(&mut self) {
        self.method.clear();
        self.target.clear();
        self.version.clear();
        self.headers.clear();
    }
}

/// Per-connection HTTP parse progress.
#[derive(Debug)]
pub struct HttpConnState {
    state: HttpState,
    request: HttpRequest,
    head_bytes: usize,
}

impl HttpConnState {
    pub fn new() -> HttpConnState {
        HttpConnState {
            state: HttpState::WaitingRequestLine,
            request: HttpRequest::default(),
            head_bytes: 0,
        }
    }

    pub fn state(&self) -> HttpState {
        self.state
    }

    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn into_request(self) -> HttpRequest {
        self.request
    }

    pub fn mark_upgraded(&mut self) {
        self.state = HttpState::Upgraded;
    }

    pub fn mark_done(&mut self) {
        self.state = HttpState::Done;
    }

    /// Back to the initial state for a recycled slot.
    pub fn reset(&mut self) {
        self.state = HttpState::WaitingRequestLine;
        self.request.clear();
        self.head_bytes = 0;
    }

    /// Consume whatever complete lines `buf` holds and advance the state
    /// machine. Bytes following the blank head terminator are left in `buf`
    /// for the next protocol layer.
    pub fn parse(&mut self, buf: &mut ByteBuffer) -> ParseOutcome {
        loop {
            match self.state {
                HttpState::WaitingRequestLine => match take_line(buf) {
                    Line::Complete(line) => {
                        self.head_bytes += line.len() + 2;
                        if !self.parse_request_line(&line) {
                            return ParseOutcome::Invalid;
                        }
                        self.state = HttpState::InHeaders;
                    }
                    Line::Pending(seen) => return self.pending(seen),
                    Line::Oversized => return ParseOutcome::Invalid,
                },
                HttpState::InHeaders => match take_line(buf) {
                    Line::Complete(line) => {
                        self.head_bytes += line.len() + 2;
                        if self.head_bytes > MAX_HEAD_BYTES {
                            return ParseOutcome::Invalid;
                        }
                        if line.is_empty() {
                            return if self.is_upgrade_request() {
                                ParseOutcome::UpgradeRequested
                            } else {
                                ParseOutcome::HeadersComplete
                            };
                        }
                        if !self.parse_header_line(&line) {
                            return ParseOutcome::Invalid;
                        }
                    }
                    Line::Pending(seen) => return self.pending(seen),
                    Line::Oversized => return ParseOutcome::Invalid,
                },
                // Nothing more to parse on this connection.
                HttpState::Upgraded | HttpState::Done => return ParseOutcome::HeadersComplete,
            }
        }
    }

    fn pending(&self, seen: usize) -> ParseOutcome {
        if self.head_bytes + seen > MAX_HEAD_BYTES {
            ParseOutcome::Invalid
        } else {
            ParseOutcome::NeedsMoreData
        }
    }

    fn parse_request_line(&mut self, line: &str) -> bool {
        let mut parts = line.split(' ').filter(|p| !p.is_empty());

        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) => (m, t, v),
            _ => return false,
        };
        if parts.next().is_some() || !version.starts_with("HTTP/1.") {
            return false;
        }

        self.request.method = method.to_string();
        self.request.target = target.to_string();
        self.request.version = version.to_string();
        true
    }

    fn parse_header_line(&mut self, line: &str) -> bool {
        if self.request.headers.len() >= MAX_HEADERS {
            return false;
        }
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => return false,
        };
        if name.is_empty() || name.contains(' ') {
            return false;
        }
        self.request
            .headers
            .push((name.to_string(), value.trim().to_string()));
        true
    }

    fn is_upgrade_request(&self) -> bool {
        self.request
            .header("Upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
            && self.request.header_has_token("Connection", "Upgrade")
    }
}

enum Line {
    Complete(String),
    Pending(usize),
    Oversized,
}

/// Take one CRLF-terminated line off the front of `buf`.
fn take_line(buf: &mut ByteBuffer) -> Line {
    let bytes = buf.as_slice();
    match bytes.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            if pos > MAX_HEAD_BYTES {
                return Line::Oversized;
            }
            let line = match std::str::from_utf8(&bytes[..pos]) {
                Ok(s) => s.to_string(),
                Err(_) => return Line::Oversized,
            };
            buf.consume(pos + 2);
            Line::Complete(line)
        }
        None => Line::Pending(bytes.len()),
    }
}

/// Minimal response head for refusals and plain replies.
pub fn simple_response(status: u16, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
        status,
        status_reason(status),
        body.len(),
        body
    )
}

pub fn status_reason(status: u16) -> &'static str {
    match status {
        101 => "Switching Protocols",
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}
