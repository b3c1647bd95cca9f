//! End-to-end integration tests for labterm sessions.
//!
//! These tests run a session against a local fake Phoenix server and verify:
//! - Join handshake and connection parameters
//! - Keystroke encoding and output decoding
//! - Join refusal
//! - Channel replacement on reset
//! - Server-initiated close
//! - Local connect failures and recovery by reset

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use client::{
    EventKind, PhoenixSocket, Preferences, Session, SessionConfig, SessionEvent, SessionStatus,
    SocketConfig,
};
use futures_util::{SinkExt, StreamExt};
use protocol::messages::events;
use protocol::{PhoenixMessage, PHOENIX_TOPIC};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message as WsMessage;

const TIMEOUT: Duration = Duration::from_secs(5);
const TOPIC: &str = "session:ada:lab1";

#[derive(Debug, Clone, Copy)]
enum JoinPolicy {
    Accept,
    Reject,
}

/// A one-connection Phoenix server that answers joins and heartbeats.
struct FakeServer {
    addr: SocketAddr,
    /// Every message the client sent, in order.
    received: mpsc::UnboundedReceiver<PhoenixMessage>,
    /// Messages to push to the client.
    outbound: mpsc::UnboundedSender<PhoenixMessage>,
    /// Request URI of the WebSocket upgrade.
    uri: Arc<Mutex<Option<String>>>,
}

impl FakeServer {
    async fn start(policy: JoinPolicy) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<PhoenixMessage>();
        let uri = Arc::new(Mutex::new(None));
        let uri_slot = Arc::clone(&uri);

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                *uri_slot.lock().unwrap() = Some(request.uri().to_string());
                Ok(response)
            };
            let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            let (mut sink, mut stream) = ws.split();

            loop {
                tokio::select! {
                    Some(message) = outbound_rx.recv() => {
                        let text = message.to_json().unwrap();
                        if sink.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    frame = stream.next() => {
                        let Some(Ok(frame)) = frame else { break };
                        let WsMessage::Text(text) = frame else { continue };
                        let message = PhoenixMessage::from_json(&text).unwrap();
                        if let Some(reply) = auto_reply(&message, policy) {
                            if sink.send(WsMessage::Text(reply.to_json().unwrap())).await.is_err() {
                                break;
                            }
                        }
                        let _ = received_tx.send(message);
                    }
                }
            }
        });

        Self {
            addr,
            received,
            outbound,
            uri,
        }
    }

    /// Waits for the next client message with `event`, skipping heartbeats.
    async fn expect(&mut self, event: &str) -> PhoenixMessage {
        loop {
            let message = tokio::time::timeout(TIMEOUT, self.received.recv())
                .await
                .expect("timed out waiting for client message")
                .expect("server stopped");
            if message.topic != PHOENIX_TOPIC {
                assert_eq!(message.event, event, "unexpected client message: {:?}", message);
                return message;
            }
        }
    }

    fn push_output(&self, join_ref: Option<String>, b64: &str) {
        self.outbound
            .send(PhoenixMessage::new(
                TOPIC,
                events::TERMINAL_OUTPUT,
                json!({ "terminal_output": b64 }),
                None,
                join_ref,
            ))
            .unwrap();
    }
}

fn auto_reply(message: &PhoenixMessage, policy: JoinPolicy) -> Option<PhoenixMessage> {
    let payload = match message.event.as_str() {
        events::HEARTBEAT => json!({ "status": "ok", "response": {} }),
        events::JOIN => match policy {
            JoinPolicy::Accept => json!({ "status": "ok", "response": {} }),
            JoinPolicy::Reject => json!({ "status": "error", "response": { "reason": "unauthorized" } }),
        },
        _ => return None,
    };
    Some(PhoenixMessage::new(
        message.topic.clone(),
        events::REPLY,
        payload,
        message.msg_ref.clone(),
        message.join_ref.clone(),
    ))
}

/// Opens a session against `server` and records every event it raises.
fn open_session(
    server: &FakeServer,
) -> (Arc<Session<PhoenixSocket>>, mpsc::UnboundedReceiver<SessionEvent>) {
    connect_session(SessionConfig::new(
        "127.0.0.1",
        server.addr.port(),
        "socket",
        "secret",
        "ada",
    ))
}

/// Registers recorders for every event kind, then starts and connects.
fn connect_session(
    config: SessionConfig,
) -> (Arc<Session<PhoenixSocket>>, mpsc::UnboundedReceiver<SessionEvent>) {
    let config = config.with_lab_slug("lab1");
    let socket = Arc::new(PhoenixSocket::new(
        SocketConfig::default().with_auto_reconnect(false),
    ));
    let session = Arc::new(Session::with_preferences(
        config,
        socket,
        Arc::new(Preferences::default()),
    ));

    let (tx, rx) = mpsc::unbounded_channel();
    for kind in [
        EventKind::Open,
        EventKind::Message,
        EventKind::Close,
        EventKind::Error,
        EventKind::JoinError,
    ] {
        let tx = tx.clone();
        session.on(kind, move |event| {
            let _ = tx.send(event.clone());
        });
    }
    session.start();
    session.connect();
    (session, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("event stream closed")
}

// =============================================================================
// Handshake and Data Flow
// =============================================================================

#[tokio::test]
async fn test_open_send_and_receive() {
    let mut server = FakeServer::start(JoinPolicy::Accept).await;
    let (session, mut events) = open_session(&server);

    let join = server.expect(events::JOIN).await;
    assert_eq!(join.topic, TOPIC);
    assert_eq!(join.payload, json!({ "token": "secret", "client": "atom" }));
    assert_eq!(join.msg_ref, join.join_ref);

    assert!(matches!(next_event(&mut events).await, SessionEvent::Open(_)));
    assert_eq!(session.status(), SessionStatus::Joined);

    let uri = server.uri.lock().unwrap().clone().unwrap();
    assert!(uri.starts_with("/socket/websocket?"), "uri: {}", uri);
    assert!(uri.contains("token=secret"));
    assert!(uri.contains("client=atom"));
    assert!(uri.contains("vsn=1.0.0"));

    session.send("ls\r");
    let input = server.expect(events::TERMINAL_INPUT).await;
    assert_eq!(input.payload, json!({ "data": "bHMN" }));
    assert_eq!(input.join_ref, join.join_ref);

    server.push_output(join.join_ref.clone(), "aGVsbG8=");
    match next_event(&mut events).await {
        SessionEvent::Message(bytes) => assert_eq!(&bytes[..], b"hello"),
        other => panic!("Expected message, got {:?}", other),
    }

    session.shutdown();
}

#[tokio::test]
async fn test_join_rejected() {
    let mut server = FakeServer::start(JoinPolicy::Reject).await;
    let (session, mut events) = open_session(&server);

    server.expect(events::JOIN).await;

    assert_eq!(
        next_event(&mut events).await,
        SessionEvent::JoinError(json!({ "reason": "unauthorized" }))
    );
    assert!(session.has_failed());

    // Input is dropped while no channel is joined.
    session.send("ls\r");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.received.try_recv().map_or(true, |m| m.topic == PHOENIX_TOPIC));

    session.shutdown();
}

// =============================================================================
// Channel Lifecycle
// =============================================================================

#[tokio::test]
async fn test_reset_replaces_channel() {
    let mut server = FakeServer::start(JoinPolicy::Accept).await;
    let (session, mut events) = open_session(&server);

    let first = server.expect(events::JOIN).await;
    assert!(matches!(next_event(&mut events).await, SessionEvent::Open(_)));

    session.reset();

    let leave = server.expect(events::LEAVE).await;
    assert_eq!(leave.join_ref, first.join_ref);
    let second = server.expect(events::JOIN).await;
    assert_eq!(second.topic, TOPIC);
    assert_ne!(second.join_ref, first.join_ref);
    assert!(matches!(next_event(&mut events).await, SessionEvent::Open(_)));

    server.push_output(first.join_ref.clone(), "b2xk");
    server.push_output(second.join_ref.clone(), "bmV3");

    match next_event(&mut events).await {
        SessionEvent::Message(bytes) => assert_eq!(&bytes[..], b"new"),
        other => panic!("Expected message, got {:?}", other),
    }

    session.shutdown();
}

#[tokio::test]
async fn test_server_close() {
    let mut server = FakeServer::start(JoinPolicy::Accept).await;
    let (session, mut events) = open_session(&server);

    let join = server.expect(events::JOIN).await;
    assert!(matches!(next_event(&mut events).await, SessionEvent::Open(_)));

    server
        .outbound
        .send(PhoenixMessage::new(TOPIC, events::CLOSE, json!({}), join.join_ref.clone(), None))
        .unwrap();

    assert_eq!(next_event(&mut events).await, SessionEvent::Close(json!({})));
    assert_eq!(session.status(), SessionStatus::Closed);

    session.shutdown();
}

// =============================================================================
// Connect Failures
// =============================================================================

#[tokio::test]
async fn test_invalid_url_surfaces_error() {
    let config = SessionConfig::new("bad host", 4000, "socket", "secret", "ada");
    let (session, mut events) = connect_session(config);

    assert!(matches!(next_event(&mut events).await, SessionEvent::Error(_)));
    assert_eq!(session.status(), SessionStatus::Errored);

    session.reset();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Error(_)));
    assert_eq!(session.status(), SessionStatus::Errored);

    session.shutdown();
}

#[tokio::test]
async fn test_reset_after_refused_connection_retries() {
    // Nothing listens on port 1.
    let config = SessionConfig::new("127.0.0.1", 1, "socket", "secret", "ada");
    let (session, mut events) = connect_session(config);

    assert!(matches!(next_event(&mut events).await, SessionEvent::Error(_)));
    assert!(session.has_failed());

    session.reset();
    assert!(matches!(next_event(&mut events).await, SessionEvent::Error(_)));
    assert_eq!(session.status(), SessionStatus::Errored);

    session.shutdown();
}
