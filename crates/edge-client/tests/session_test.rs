//! End-to-end session tests against an in-process mock relay.
//!
//! The relay side of the wire protocol is small enough to drive by hand:
//! accept the TCP connection, answer the auth request, then push frames.

use bytes::Bytes;
use edge_client::{EdgeClient, EdgeConfig, SessionEvent, SessionState};
use edge_connection::ReconnectConfig;
use edge_proto::{ControlMessage, Frame, FrameDecoder, FrameKind, CONTROL_STREAM_ID};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// One accepted relay-side connection with frame codec helpers.
struct RelayConn {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl RelayConn {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("timed out waiting for the client to connect")
            .unwrap();
        Self {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    async fn next_frame(&mut self) -> Frame {
        loop {
            if let Some(frame) = self.decoder.decode().unwrap() {
                return frame;
            }
            let mut buf = [0u8; 4096];
            let n = timeout(Duration::from_secs(5), self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            assert!(n > 0, "relay connection closed while waiting for a frame");
            self.decoder.extend(&buf[..n]);
        }
    }

    async fn send_frame(&mut self, frame: Frame) {
        self.stream
            .write_all(&frame.encode().unwrap())
            .await
            .unwrap();
    }

    /// Read the client's auth request and answer it.
    async fn handle_auth(&mut self, accept: bool) -> String {
        let frame = self.next_frame().await;
        assert_eq!(frame.stream_id, CONTROL_STREAM_ID);
        assert_eq!(frame.kind, FrameKind::Data);

        let msg = ControlMessage::decode(&frame.payload).unwrap();
        let ControlMessage::AuthRequest { token, .. } = msg else {
            panic!("expected an auth request, got {msg:?}");
        };

        let reply = if accept {
            ControlMessage::AuthAccept {
                session_id: "sess-1".to_string(),
            }
        } else {
            ControlMessage::AuthReject {
                reason: "invalid token".to_string(),
            }
        };
        self.send_frame(Frame::data(CONTROL_STREAM_ID, reply.encode().unwrap()))
            .await;

        token
    }
}

fn test_config(server_addr: &str, local_addr: &str) -> EdgeConfig {
    let mut config = EdgeConfig::new(
        server_addr.to_string(),
        "secret-token".to_string(),
        local_addr.to_string(),
    );
    // Long heartbeat so sessions stay quiet unless a test drives it.
    config.heartbeat_interval = Duration::from_secs(60);
    config.heartbeat_timeout = Duration::from_secs(120);
    config.shutdown_grace = Duration::from_secs(1);
    config.reconnect = ReconnectConfig {
        initial_backoff: Duration::from_millis(200),
        max_backoff: Duration::from_millis(400),
        multiplier: 2.0,
        jitter: 0.0,
        max_attempts: None,
    };
    config
}

async fn wait_for_state(client: &EdgeClient, state: SessionState) {
    let mut rx = client.watch_state();
    timeout(Duration::from_secs(5), rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for state {state}"))
        .unwrap();
}

#[tokio::test]
async fn authenticates_and_reaches_active() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();

    let client = EdgeClient::new(test_config(&server_addr, "127.0.0.1:1"));
    client.connect().await;

    let mut relay = RelayConn::accept(&listener).await;
    let token = relay.handle_auth(true).await;
    assert_eq!(token, "secret-token");

    wait_for_state(&client, SessionState::Active).await;
    assert!(client.is_running().await);

    client.disconnect().await;
}

#[tokio::test]
async fn rejected_token_backs_off_and_never_dials_local() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();

    let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local_listener.local_addr().unwrap().to_string();

    let client = EdgeClient::new(test_config(&server_addr, &local_addr));
    let mut events = client.events();
    client.connect().await;

    let mut relay = RelayConn::accept(&listener).await;
    relay.handle_auth(false).await;

    wait_for_state(&client, SessionState::Reconnecting).await;

    let mut saw_reject = false;
    for _ in 0..16 {
        match timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Ok(SessionEvent::AuthRejected { reason })) => {
                assert_eq!(reason, "invalid token");
                saw_reject = true;
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_reject, "expected an AuthRejected event");

    // The client keeps retrying (server-side token rotation is possible)...
    let mut relay = RelayConn::accept(&listener).await;
    relay.handle_auth(false).await;
    assert_ne!(client.state(), SessionState::Active);

    // ...but never opens a connection to the local service.
    let dialed = timeout(Duration::from_millis(300), local_listener.accept()).await;
    assert!(
        dialed.is_err(),
        "local service must not be dialed before authentication succeeds"
    );

    client.disconnect().await;
}

#[tokio::test]
async fn relays_open_data_close_to_local_service() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();

    let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local_listener.local_addr().unwrap().to_string();

    let client = EdgeClient::new(test_config(&server_addr, &local_addr));
    client.connect().await;

    let mut relay = RelayConn::accept(&listener).await;
    relay.handle_auth(true).await;
    wait_for_state(&client, SessionState::Active).await;

    relay.send_frame(Frame::open(7)).await;
    relay
        .send_frame(Frame::data(7, Bytes::from_static(b"PING")))
        .await;
    relay.send_frame(Frame::close(7)).await;

    let (mut local, _) = timeout(Duration::from_secs(5), local_listener.accept())
        .await
        .expect("bridge never dialed the local service")
        .unwrap();

    let mut received = Vec::new();
    timeout(Duration::from_secs(5), local.read_to_end(&mut received))
        .await
        .expect("local connection was not closed")
        .unwrap();
    assert_eq!(received, b"PING");

    client.disconnect().await;
}

#[tokio::test]
async fn local_bytes_are_relayed_in_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();

    let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local_listener.local_addr().unwrap().to_string();

    // Local service that writes a payload in two pieces, then half-closes.
    let local_task = tokio::spawn(async move {
        let (mut socket, _) = local_listener.accept().await.unwrap();
        socket.write_all(b"HELLO ").await.unwrap();
        socket.write_all(b"WORLD").await.unwrap();
        socket.shutdown().await.unwrap();
        socket
    });

    let client = EdgeClient::new(test_config(&server_addr, &local_addr));
    client.connect().await;

    let mut relay = RelayConn::accept(&listener).await;
    relay.handle_auth(true).await;
    wait_for_state(&client, SessionState::Active).await;

    relay.send_frame(Frame::open(5)).await;

    let mut collected = Vec::new();
    loop {
        let frame = relay.next_frame().await;
        if frame.stream_id == CONTROL_STREAM_ID {
            continue;
        }
        assert_eq!(frame.stream_id, 5);
        assert_eq!(frame.kind, FrameKind::Data);
        collected.extend_from_slice(&frame.payload);
        if frame.flags.has_fin() {
            break;
        }
    }
    assert_eq!(collected, b"HELLO WORLD");

    let _ = local_task.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn dropping_the_relay_closes_every_stream_and_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();

    let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local_addr = local_listener.local_addr().unwrap().to_string();

    let client = EdgeClient::new(test_config(&server_addr, &local_addr));
    let mut events = client.events();
    client.connect().await;

    let mut relay = RelayConn::accept(&listener).await;
    relay.handle_auth(true).await;
    wait_for_state(&client, SessionState::Active).await;

    relay.send_frame(Frame::open(1)).await;
    relay.send_frame(Frame::open(2)).await;
    relay.send_frame(Frame::open(3)).await;

    let mut local_sockets = Vec::new();
    for _ in 0..3 {
        let (socket, _) = timeout(Duration::from_secs(5), local_listener.accept())
            .await
            .expect("bridge never dialed the local service")
            .unwrap();
        local_sockets.push(socket);
    }

    // Kill the physical connection with all three streams open.
    drop(relay);

    wait_for_state(&client, SessionState::Reconnecting).await;

    // Exactly one close notification per stream.
    let mut closed = 0;
    while closed < 3 {
        match timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(SessionEvent::StreamClosed { .. })) => closed += 1,
            Ok(Ok(_)) => continue,
            other => panic!("missing stream close notifications: {other:?}"),
        }
    }

    // Every local socket sees EOF; nothing is leaked.
    for mut socket in local_sockets {
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(5), socket.read(&mut buf))
            .await
            .expect("local socket was not released")
            .unwrap();
        assert_eq!(n, 0);
    }

    client.disconnect().await;
}

#[tokio::test]
async fn connect_is_idempotent() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();

    let client = EdgeClient::new(test_config(&server_addr, "127.0.0.1:1"));
    client.connect().await;
    client.connect().await;

    let mut relay = RelayConn::accept(&listener).await;
    relay.handle_auth(true).await;
    wait_for_state(&client, SessionState::Active).await;

    client.connect().await;

    // No second handshake, no second socket.
    let second = timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(second.is_err(), "connect() must not open a second session");

    client.disconnect().await;
}

#[tokio::test]
async fn disconnect_is_terminal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();

    let client = EdgeClient::new(test_config(&server_addr, "127.0.0.1:1"));
    client.connect().await;

    let mut relay = RelayConn::accept(&listener).await;
    relay.handle_auth(true).await;
    wait_for_state(&client, SessionState::Active).await;

    client.disconnect().await;

    assert_eq!(client.state(), SessionState::Disconnected);
    assert!(!client.is_running().await);

    // The relay sees the connection close...
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), relay.stream.read(&mut buf))
        .await
        .expect("relay connection was not closed")
        .unwrap();
    assert_eq!(n, 0);

    // ...and no reconnect attempt follows.
    let reconnect = timeout(Duration::from_millis(400), listener.accept()).await;
    assert!(reconnect.is_err(), "stopped client must not reconnect");
}

#[tokio::test]
async fn heartbeat_detects_a_silent_relay() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();

    let mut config = test_config(&server_addr, "127.0.0.1:1");
    config.heartbeat_interval = Duration::from_millis(100);
    config.heartbeat_timeout = Duration::from_millis(400);

    let client = EdgeClient::new(config);
    let mut events = client.events();
    client.connect().await;

    let mut relay = RelayConn::accept(&listener).await;
    relay.handle_auth(true).await;
    wait_for_state(&client, SessionState::Active).await;

    // Answer pings for a while; the session stays healthy.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(600);
    while tokio::time::Instant::now() < deadline {
        let frame = relay.next_frame().await;
        if frame.kind == FrameKind::Ping {
            relay
                .send_frame(Frame::pong(frame.timestamp().unwrap_or(0)))
                .await;
        }
    }
    assert_eq!(client.state(), SessionState::Active);

    // Go silent: stop answering pings but keep the socket open. The client
    // must treat the missing pongs as connection loss.
    wait_for_state(&client, SessionState::Reconnecting).await;

    let mut saw_timeout = false;
    for _ in 0..16 {
        match timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Ok(SessionEvent::HeartbeatTimeout)) => {
                saw_timeout = true;
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_timeout, "expected a HeartbeatTimeout event");

    client.disconnect().await;
}

#[tokio::test]
async fn relay_error_frame_tears_the_session_down() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();

    let client = EdgeClient::new(test_config(&server_addr, "127.0.0.1:1"));
    client.connect().await;

    let mut relay = RelayConn::accept(&listener).await;
    relay.handle_auth(true).await;
    wait_for_state(&client, SessionState::Active).await;

    relay.send_frame(Frame::error("session revoked")).await;

    wait_for_state(&client, SessionState::Reconnecting).await;

    client.disconnect().await;
}

#[tokio::test]
async fn fatal_auth_rejection_stops_the_client() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();

    let base = test_config(&server_addr, "127.0.0.1:1");
    let config = EdgeConfig::builder()
        .server_addr(base.server_addr.clone())
        .auth_token("stale-token".to_string())
        .local_addr(base.local_addr.clone())
        .auth_failure_fatal(true)
        .reconnect(base.reconnect.clone())
        .build()
        .unwrap();

    let client = EdgeClient::new(config);
    client.connect().await;

    let mut relay = RelayConn::accept(&listener).await;
    let token = relay.handle_auth(false).await;
    assert_eq!(token, "stale-token");

    // The run loop ends on its own.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while client.is_running().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "client did not stop after a fatal auth rejection"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.state(), SessionState::Disconnected);

    // No retry follows.
    let retry = timeout(Duration::from_millis(400), listener.accept()).await;
    assert!(retry.is_err(), "fatal auth rejection must not be retried");
    assert!(!client.is_running().await);
}

#[tokio::test]
async fn unreachable_local_service_closes_only_that_stream() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap().to_string();

    // Port 1 on localhost refuses connections.
    let client = EdgeClient::new(test_config(&server_addr, "127.0.0.1:1"));
    let mut events = client.events();
    client.connect().await;

    let mut relay = RelayConn::accept(&listener).await;
    relay.handle_auth(true).await;
    wait_for_state(&client, SessionState::Active).await;

    relay.send_frame(Frame::open(4)).await;

    // The bridge answers with a Close frame carrying the failure reason.
    let frame = relay.next_frame().await;
    assert_eq!(frame.stream_id, 4);
    assert_eq!(frame.kind, FrameKind::Close);
    assert!(frame.reason().unwrap().contains("local service"));

    // The session itself survives.
    assert_eq!(client.state(), SessionState::Active);

    let mut saw_close = false;
    for _ in 0..16 {
        match timeout(Duration::from_millis(500), events.recv()).await {
            Ok(Ok(SessionEvent::StreamClosed { stream_id, reason })) => {
                assert_eq!(stream_id, 4);
                assert!(reason.is_some());
                saw_close = true;
                break;
            }
            Ok(Ok(_)) => continue,
            _ => break,
        }
    }
    assert!(saw_close, "expected a StreamClosed event for the failed bridge");

    client.disconnect().await;
}
