//! Server-level behavior: broadcast, queued sends, heartbeats, lifecycle.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use swarm_ws::ws::{Frame, WsContext, WsProtocol, WsProtocolFactory};
use swarm_ws::{Handle, ProtocolRegistry, RequestHandler, ServerOptions, WsServer};

struct SilentFactory;

impl WsProtocolFactory for SilentFactory {
    fn name(&self) -> &str {
        ""
    }

    fn create(&self) -> Box<dyn WsProtocol> {
        Box::new(Silent)
    }
}

struct Silent;

impl WsProtocol for Silent {
    fn on_frame(&mut self, _ctx: &WsContext, _frame: &Frame) {}
}

#[derive(Default)]
struct HandleRecorder {
    handles: Mutex<Vec<Handle>>,
}

impl RequestHandler for HandleRecorder {
    fn on_upgraded(&self, handle: Handle, _protocol: &str) {
        self.handles.lock().unwrap().push(handle);
    }
}

fn start(options: ServerOptions) -> (WsServer, Arc<HandleRecorder>) {
    let mut protocols = ProtocolRegistry::new();
    protocols.register(Box::new(SilentFactory));
    let recorder = Arc::new(HandleRecorder::default());
    let server = WsServer::listen_with_handler(
        "127.0.0.1:0",
        protocols,
        recorder.clone(),
        options,
    )
    .unwrap();
    (server, recorder)
}

fn upgrade(addr: std::net::SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    assert!(head.starts_with(b"HTTP/1.1 101"));
    stream
}

fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).unwrap();

    let len = match head[1] & 0x7f {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).unwrap();
            u64::from_be_bytes(ext) as usize
        }
        len => len as usize,
    };

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (head[0] & 0x0f, payload)
}

fn wait_for_connections(server: &WsServer, count: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.connection_count() < count {
        assert!(Instant::now() < deadline, "connections never registered");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn broadcast_reaches_every_connection() {
    let (server, _) = start(ServerOptions::default());
    let addr = server.local_addr().unwrap();

    let mut clients = [upgrade(addr), upgrade(addr), upgrade(addr)];
    wait_for_connections(&server, 3);

    let sent = server.broadcast(&Frame::text("ping"), &[], 1_000);
    assert_eq!(sent, 3);

    for stream in &mut clients {
        let mut raw = [0u8; 6];
        stream.read_exact(&mut raw).unwrap();
        // The exact wire bytes, identical for every receiver.
        assert_eq!(raw, [0x81, 0x04, b'p', b'i', b'n', b'g']);
    }

    server.shutdown();
}

#[test]
fn broadcast_deduplicates_target_handles() {
    let (server, recorder) = start(ServerOptions::default());
    let addr = server.local_addr().unwrap();

    let mut client = upgrade(addr);
    wait_for_connections(&server, 1);

    let handle = recorder.handles.lock().unwrap()[0];
    let sent = server.broadcast(&Frame::text("once"), &[handle, handle, handle], 1_000);
    assert_eq!(sent, 1);

    let (opcode, payload) = read_frame(&mut client);
    assert_eq!(opcode, 1);
    assert_eq!(payload, b"once");

    // No duplicate copy follows; the next read times out.
    client
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut probe = [0u8; 1];
    assert!(client.read_exact(&mut probe).is_err());

    server.shutdown();
}

#[test]
fn queued_frames_are_gathered_and_flushed() {
    let (server, recorder) = start(ServerOptions::default());
    let addr = server.local_addr().unwrap();

    let mut client = upgrade(addr);
    wait_for_connections(&server, 1);
    let handle = recorder.handles.lock().unwrap()[0];

    assert!(server.send_frame(handle, Frame::text("one")));
    assert!(server.send_frame(handle, Frame::text("two")));
    assert!(server.send_frame(handle, Frame::binary(vec![1, 2, 3])));

    let (opcode, payload) = read_frame(&mut client);
    assert_eq!((opcode, payload.as_slice()), (1, b"one".as_slice()));
    let (opcode, payload) = read_frame(&mut client);
    assert_eq!((opcode, payload.as_slice()), (1, b"two".as_slice()));
    let (opcode, payload) = read_frame(&mut client);
    assert_eq!((opcode, payload.as_slice()), (2, [1u8, 2, 3].as_slice()));

    server.shutdown();
}

#[test]
fn send_frame_to_unknown_handle_fails() {
    let (server, _) = start(ServerOptions::default());
    assert!(!server.send_frame(Handle(424_242), Frame::text("nobody")));
    server.shutdown();
}

#[test]
fn idle_connection_receives_a_ping() {
    let options = ServerOptions {
        heartbeat_delay_ms: 100,
        ..ServerOptions::default()
    };
    let (server, _) = start(options);
    let addr = server.local_addr().unwrap();

    let mut client = upgrade(addr);
    wait_for_connections(&server, 1);

    // Send nothing; the idle scan must ping within a few seconds.
    let (opcode, _payload) = read_frame(&mut client);
    assert_eq!(opcode, 9);

    server.shutdown();
}

#[test]
fn server_initiated_close_handshake() {
    let (server, recorder) = start(ServerOptions::default());
    let addr = server.local_addr().unwrap();

    let mut client = upgrade(addr);
    wait_for_connections(&server, 1);
    let handle = recorder.handles.lock().unwrap()[0];

    assert!(server.close_connection(handle, 1000));

    let (opcode, payload) = read_frame(&mut client);
    assert_eq!(opcode, 8);
    assert_eq!(&payload[..2], &1000u16.to_be_bytes());

    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest);
    assert!(rest.is_empty());

    assert!(!server.close_connection(handle, 1000));

    server.shutdown();
}

#[test]
fn handles_are_strictly_increasing() {
    let (server, recorder) = start(ServerOptions::default());
    let addr = server.local_addr().unwrap();

    let _clients: Vec<TcpStream> = (0..5).map(|_| upgrade(addr)).collect();
    wait_for_connections(&server, 5);

    let handles = recorder.handles.lock().unwrap().clone();
    assert_eq!(handles.len(), 5);
    for pair in handles.windows(2) {
        assert!(pair[1] > pair[0], "handles must be monotonic: {:?}", handles);
    }

    server.shutdown();
}

#[test]
fn survives_client_vanishing_mid_session() {
    let (server, _) = start(ServerOptions::default());
    let addr = server.local_addr().unwrap();

    for _ in 0..10 {
        let stream = upgrade(addr);
        drop(stream);
    }

    // The server keeps serving after abrupt disconnects.
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.connection_count() > 0 {
        assert!(Instant::now() < deadline, "connections never drained");
        std::thread::sleep(Duration::from_millis(20));
    }

    let mut client = upgrade(addr);
    wait_for_connections(&server, 1);
    assert_eq!(server.broadcast(&Frame::text("alive"), &[], 1_000), 1);
    let (opcode, payload) = read_frame(&mut client);
    assert_eq!((opcode, payload.as_slice()), (1, b"alive".as_slice()));

    server.shutdown();
}

#[test]
fn broadcast_to_a_subset_of_handles() {
    let (server, recorder) = start(ServerOptions::default());
    let addr = server.local_addr().unwrap();

    let mut first = upgrade(addr);
    let mut second = upgrade(addr);
    wait_for_connections(&server, 2);

    let handles = recorder.handles.lock().unwrap().clone();
    let sent = server.broadcast(&Frame::text("only-you"), &[handles[1]], 1_000);
    assert_eq!(sent, 1);

    let (opcode, payload) = read_frame(&mut second);
    assert_eq!((opcode, payload.as_slice()), (1, b"only-you".as_slice()));

    first
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut probe = [0u8; 1];
    assert!(first.read_exact(&mut probe).is_err());

    server.shutdown();
}

#[test]
fn silent_peer_is_dropped_after_missed_heartbeats() {
    let options = ServerOptions {
        heartbeat_delay_ms: 100,
        disconnect_after_invalid_heartbeat_count: 1,
        ..ServerOptions::default()
    };
    let (server, _) = start(options);
    let addr = server.local_addr().unwrap();

    let mut client = upgrade(addr);
    wait_for_connections(&server, 1);

    // Never answer the pings; the server must give up on us.
    let deadline = Instant::now() + Duration::from_secs(15);
    let mut saw_ping = false;
    let mut dropped = false;
    let mut byte = [0u8; 1];
    loop {
        match client.read(&mut byte) {
            Ok(0) => {
                dropped = true;
                break;
            }
            Ok(_) => {
                if byte[0] & 0x0f == 9 {
                    saw_ping = true;
                }
            }
            Err(_) => break,
        }
        assert!(Instant::now() < deadline, "server never dropped the peer");
    }
    assert!(saw_ping);
    assert!(dropped || server.connection_count() == 0);

    server.shutdown();
}

#[test]
fn unix_domain_listener_upgrades() {
    use std::os::unix::net::UnixStream;

    let path = format!("/tmp/swarm-ws-test-{}.sock", std::process::id());
    let mut protocols = ProtocolRegistry::new();
    protocols.register(Box::new(SilentFactory));
    let server = WsServer::listen(
        &format!("unix:{}", path),
        protocols,
        ServerOptions::default(),
    )
    .unwrap();

    let mut stream = UnixStream::connect(&path).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    stream
        .write_all(
            b"GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    assert!(head.starts_with(b"HTTP/1.1 101"));

    server.shutdown();
    assert!(!std::path::Path::new(&path).exists());
}

#[test]
fn select_facility_serves_traffic() {
    let options = ServerOptions {
        force_select_facility: true,
        ..ServerOptions::default()
    };
    let (server, _) = start(options);
    let addr = server.local_addr().unwrap();

    let mut client = upgrade(addr);
    wait_for_connections(&server, 1);

    assert_eq!(server.broadcast(&Frame::text("via-poll"), &[], 1_000), 1);
    let (opcode, payload) = read_frame(&mut client);
    assert_eq!((opcode, payload.as_slice()), (1, b"via-poll".as_slice()));

    server.shutdown();
}
