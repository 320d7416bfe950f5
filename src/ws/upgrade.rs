//! The HTTP → WebSocket upgrade handshake and the subprotocol registry.

use base64::prelude::*;
use sha1::{Digest, Sha1};

use crate::http::HttpRequest;

use super::frame::Frame;
use super::WsContext;

/// Global identifier for WebSockets, see RFC 6455.
const MAGIC_WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// An application-level protocol carried inside WebSocket frames.
///
/// One instance exists per upgraded connection and is owned by it
/// exclusively; implementations need `Send` but never `Sync`.
pub trait WsProtocol: Send {
    /// The upgrade response has been sent; the connection is live.
    fn on_connect(&mut self, _ctx: &WsContext) {}

    /// One complete data message (fragments already assembled).
    fn on_frame(&mut self, ctx: &WsContext, frame: &Frame);

    /// The connection is going away. Sending is no longer possible.
    fn on_disconnect(&mut self, _ctx: &WsContext) {}
}

/// Hands out [`WsProtocol`] instances at upgrade time.
pub trait WsProtocolFactory: Send + Sync {
    /// The subprotocol name matched against `Sec-WebSocket-Protocol`.
    /// An empty name registers the unnamed fallback protocol.
    fn name(&self) -> &str;

    fn create(&self) -> Box<dyn WsProtocol>;

    /// Offered `Sec-WebSocket-Extensions` value. Return the response value
    /// to opt in; the default declines.
    fn accept_extensions(&self, _offered: &str) -> Option<String> {
        None
    }
}

/// The set of subprotocols a server offers. Owns the factories; upgraded
/// connections own the instances.
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: Vec<Box<dyn WsProtocolFactory>>,
}

impl ProtocolRegistry {
    pub fn new() -> ProtocolRegistry {
        ProtocolRegistry {
            factories: Vec::new(),
        }
    }

    pub fn register(&mut self, factory: Box<dyn WsProtocolFactory>) {
        self.factories.push(factory);
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Pick the factory for a requested CSV protocol list.
    ///
    /// The first registered factory whose name appears in the list wins.
    /// Without a match (or without a request), an unnamed factory serves as
    /// the fallback.
    fn select(&self, requested: Option<&str>) -> Option<&dyn WsProtocolFactory> {
        if let Some(list) = requested {
            for factory in &self.factories {
                if factory.name().is_empty() {
                    continue;
                }
                if list
                    .split(',')
                    .any(|name| name.trim().eq_ignore_ascii_case(factory.name()))
                {
                    return Some(factory.as_ref());
                }
            }
        }

        self.factories
            .iter()
            .find(|f| f.name().is_empty())
            .map(|f| f.as_ref())
    }
}

/// `Sec-WebSocket-Accept` for a client key: base64(SHA1(key ++ GUID)).
pub fn accept_key(client_key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key.as_bytes());
    sha1.update(MAGIC_WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

/// Result of validating one upgrade request.
pub enum UpgradeOutcome {
    Accepted {
        /// The complete 101 response head.
        response: String,
        protocol_name: String,
        protocol: Box<dyn WsProtocol>,
        extensions: Option<String>,
    },
    Refused {
        status: u16,
        reason: &'static str,
    },
}

fn refuse(status: u16, reason: &'static str) -> UpgradeOutcome {
    UpgradeOutcome::Refused { status, reason }
}

/// Validate an upgrade request and build the switching-protocols response.
pub fn try_upgrade(req: &HttpRequest, registry: &ProtocolRegistry) -> UpgradeOutcome {
    if !req.method.eq_ignore_ascii_case("GET") {
        return refuse(405, "upgrade requires GET");
    }
    if req.header("Host").is_none() {
        return refuse(400, "missing Host header");
    }
    if !req
        .header("Upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
    {
        return refuse(400, "Upgrade header is not websocket");
    }
    if !req.header_has_token("Connection", "Upgrade") {
        return refuse(400, "Connection header lacks Upgrade");
    }
    if req.header("Sec-WebSocket-Version") != Some("13") {
        return refuse(400, "unsupported websocket version");
    }

    let key = match req.header("Sec-WebSocket-Key") {
        Some(key) if key.len() == 24 => key,
        _ => return refuse(400, "malformed Sec-WebSocket-Key"),
    };
    match BASE64_STANDARD.decode(key) {
        Ok(raw) if raw.len() == 16 => (),
        _ => return refuse(400, "malformed Sec-WebSocket-Key"),
    }

    let factory = match registry.select(req.header("Sec-WebSocket-Protocol")) {
        Some(factory) => factory,
        None => return refuse(400, "no matching subprotocol"),
    };

    let extensions = req
        .header("Sec-WebSocket-Extensions")
        .and_then(|offered| factory.accept_extensions(offered));

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        accept_key(key)
    );
    if !factory.name().is_empty() {
        response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", factory.name()));
    }
    if let Some(ext) = &extensions {
        response.push_str(&format!("Sec-WebSocket-Extensions: {}\r\n", ext));
    }
    response.push_str("\r\n");

    UpgradeOutcome::Accepted {
        response,
        protocol_name: factory.name().to_string(),
        protocol: factory.create(),
        extensions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteBuffer;
    use crate::http::HttpConnState;

    struct Echo(&'static str);

    impl WsProtocolFactory for Echo {
        fn name(&self) -> &str {
            self.0
        }

        fn create(&self) -> Box<dyn WsProtocol> {
            Box::new(EchoInstance)
        }
    }

    struct EchoInstance;

    impl WsProtocol for EchoInstance {
        fn on_frame(&mut self, ctx: &WsContext, frame: &Frame) {
            ctx.send(frame.clone());
        }
    }

    fn request(head: &str) -> crate::http::HttpRequest {
        let mut state = HttpConnState::new();
        let mut buf = ByteBuffer::new();
        buf.append(head.as_bytes());
        state.parse(&mut buf);
        state.into_request()
    }

    fn sample_request(extra: &str) -> crate::http::HttpRequest {
        request(&format!(
            "GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n{}\r\n",
            extra
        ))
    }

    #[test]
    fn accept_key_matches_rfc_sample() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn happy_path_response() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Box::new(Echo("")));

        match try_upgrade(&sample_request(""), &registry) {
            UpgradeOutcome::Accepted { response, .. } => {
                assert!(response.starts_with("HTTP/1.1 101"));
                assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
                assert!(response.ends_with("\r\n\r\n"));
                assert!(!response.contains("Sec-WebSocket-Protocol"));
            }
            UpgradeOutcome::Refused { status, reason } => {
                panic!("refused {}: {}", status, reason)
            }
        }
    }

    #[test]
    fn first_matching_subprotocol_wins() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Box::new(Echo("chat.v1")));
        registry.register(Box::new(Echo("chat.v2")));

        let req = sample_request("Sec-WebSocket-Protocol: chat.v2, chat.v1\r\n");
        match try_upgrade(&req, &registry) {
            UpgradeOutcome::Accepted {
                response,
                protocol_name,
                ..
            } => {
                assert_eq!(protocol_name, "chat.v1");
                assert!(response.contains("Sec-WebSocket-Protocol: chat.v1\r\n"));
            }
            UpgradeOutcome::Refused { .. } => panic!("refused"),
        }
    }

    #[test]
    fn unnamed_protocol_is_the_fallback() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Box::new(Echo("chat.v1")));
        registry.register(Box::new(Echo("")));

        let req = sample_request("Sec-WebSocket-Protocol: other\r\n");
        match try_upgrade(&req, &registry) {
            UpgradeOutcome::Accepted { protocol_name, .. } => {
                assert_eq!(protocol_name, "");
            }
            UpgradeOutcome::Refused { .. } => panic!("refused"),
        }
    }

    #[test]
    fn no_match_and_no_fallback_is_400() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Box::new(Echo("chat.v1")));

        let req = sample_request("Sec-WebSocket-Protocol: other\r\n");
        match try_upgrade(&req, &registry) {
            UpgradeOutcome::Refused { status, .. } => assert_eq!(status, 400),
            UpgradeOutcome::Accepted { .. } => panic!("accepted"),
        }
    }

    #[test]
    fn validation_failures() {
        let mut registry = ProtocolRegistry::new();
        registry.register(Box::new(Echo("")));

        let bad_version = request(
            "GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 8\r\n\r\n",
        );
        assert!(matches!(
            try_upgrade(&bad_version, &registry),
            UpgradeOutcome::Refused { status: 400, .. }
        ));

        let bad_key = request(
            "GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: short\r\nSec-WebSocket-Version: 13\r\n\r\n",
        );
        assert!(matches!(
            try_upgrade(&bad_key, &registry),
            UpgradeOutcome::Refused { status: 400, .. }
        ));

        let post = request(
            "POST /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        );
        assert!(matches!(
            try_upgrade(&post, &registry),
            UpgradeOutcome::Refused { status: 405, .. }
        ));
    }
}
