//! Handshake behavior over real TCP connections.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use swarm_ws::ws::{Frame, WsContext, WsProtocol, WsProtocolFactory};
use swarm_ws::{ProtocolRegistry, ServerOptions, WsServer};

struct EchoFactory(&'static str);

impl WsProtocolFactory for EchoFactory {
    fn name(&self) -> &str {
        self.0
    }

    fn create(&self) -> Box<dyn WsProtocol> {
        Box::new(Echo)
    }
}

struct Echo;

impl WsProtocol for Echo {
    fn on_frame(&mut self, ctx: &WsContext, frame: &Frame) {
        ctx.send(frame.clone());
    }
}

fn start(names: &[&'static str]) -> WsServer {
    let mut protocols = ProtocolRegistry::new();
    for name in names {
        protocols.register(Box::new(EchoFactory(name)));
    }
    WsServer::listen("127.0.0.1:0", protocols, ServerOptions::default()).unwrap()
}

fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn request(addr: std::net::SocketAddr, head: &str) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(head.as_bytes()).unwrap();
    let response = read_head(&mut stream);
    (stream, response)
}

#[test]
fn upgrade_happy_path() {
    let server = start(&[""]);
    let addr = server.local_addr().unwrap();

    let (_stream, response) = request(
        addr,
        "GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 101"), "{}", response);
    assert!(
        response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="),
        "{}",
        response
    );
    assert!(response.contains("Upgrade: websocket"));
    assert!(response.contains("Connection: Upgrade"));

    server.shutdown();
}

#[test]
fn subprotocol_negotiated_on_the_wire() {
    let server = start(&["chat.v1", "chat.v2"]);
    let addr = server.local_addr().unwrap();

    let (_stream, response) = request(
        addr,
        "GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: chat.v2\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 101"), "{}", response);
    assert!(response.contains("Sec-WebSocket-Protocol: chat.v2"), "{}", response);

    server.shutdown();
}

#[test]
fn unsupported_version_is_refused() {
    let server = start(&[""]);
    let addr = server.local_addr().unwrap();

    let (_stream, response) = request(
        addr,
        "GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 8\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 400"), "{}", response);

    server.shutdown();
}

#[test]
fn unmatched_subprotocol_is_refused() {
    let server = start(&["chat.v1"]);
    let addr = server.local_addr().unwrap();

    let (_stream, response) = request(
        addr,
        "GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: other\r\n\r\n",
    );

    assert!(response.starts_with("HTTP/1.1 400"), "{}", response);

    server.shutdown();
}

#[test]
fn plain_request_gets_an_http_answer() {
    let server = start(&[""]);
    let addr = server.local_addr().unwrap();

    let (mut stream, response) =
        request(addr, "GET /health HTTP/1.1\r\nHost: h\r\n\r\n");

    assert!(response.starts_with("HTTP/1.1 404"), "{}", response);

    // The server closes after the answer.
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);

    server.shutdown();
}

#[test]
fn malformed_request_line_is_refused() {
    let server = start(&[""]);
    let addr = server.local_addr().unwrap();

    let (_stream, response) = request(addr, "NONSENSE\r\n\r\n");
    assert!(response.starts_with("HTTP/1.1 400"), "{}", response);

    server.shutdown();
}
