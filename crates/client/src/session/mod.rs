//! Terminal session over a channel transport.
//!
//! A [`Session`] owns at most one live channel on a shared [`Transport`].
//! It joins `session:<username>:<slug>`, turns keystrokes into
//! `terminal_input` pushes, decodes `terminal_output` into
//! [`SessionEvent::Message`], and reports channel lifecycle to the owner:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──ack ok──▶ Joined
//!                               ▲  │                 │
//!                               │  └──ack error──┐   ├──close──▶ Closed
//!                             reset              ▼   └──error──▶ Errored
//!                               └──────────── (any state)
//! ```
//!
//! Nothing here retries on its own; recovery is an explicit [`Session::reset`].

mod config;
pub mod events;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use protocol::messages::events as wire;
use protocol::{TerminalInput, TerminalOutput};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::transport::{ChannelId, ConnectParams, Transport, TransportEvent, TransportEventKind};

pub use config::{Preferences, SessionConfig, DEFAULT_CLIENT_ID, HOME_SLUG, TEMPORARY_SLUG, TLS_PORT};
pub use events::{EventEmitter, EventKind, ListenerId, SessionEvent};

/// Where the current channel stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No connection requested yet, or shut down.
    Disconnected,
    /// A join is in flight.
    Connecting,
    /// The join was acknowledged; input is forwarded.
    Joined,
    /// The join was refused or the channel failed.
    Errored,
    /// The server closed the channel.
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Joined => "joined",
            SessionStatus::Errored => "errored",
            SessionStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
struct ChannelHandle {
    id: ChannelId,
    topic: String,
}

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    channel: Option<ChannelHandle>,
    has_failed: bool,
}

/// One remote terminal session.
pub struct Session<T: Transport> {
    config: SessionConfig,
    prefs: Arc<Preferences>,
    transport: Arc<T>,
    state: Mutex<SessionState>,
    emitter: EventEmitter,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport + 'static> Session<T> {
    /// Creates an idle session with default preferences.
    pub fn new(config: SessionConfig, transport: Arc<T>) -> Self {
        Self::with_preferences(config, transport, Arc::new(Preferences::default()))
    }

    /// Creates an idle session that reads `prefs` on every join.
    pub fn with_preferences(
        config: SessionConfig,
        transport: Arc<T>,
        prefs: Arc<Preferences>,
    ) -> Self {
        Self {
            config,
            prefs,
            transport,
            state: Mutex::new(SessionState {
                status: SessionStatus::Disconnected,
                channel: None,
                has_failed: false,
            }),
            emitter: EventEmitter::new(),
            pump: Mutex::new(None),
        }
    }

    /// Creates a session, starts its event pump and connects.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(config: SessionConfig, transport: Arc<T>, prefs: Arc<Preferences>) -> Arc<Self> {
        let session = Arc::new(Self::with_preferences(config, transport, prefs));
        session.start();
        session.connect();
        session
    }

    /// Spawns the task that feeds transport events into this session.
    ///
    /// The task holds only a weak reference and ends when the session is
    /// dropped or the transport's event stream closes. A second call is a
    /// no-op, as is a call when the receiver was already taken.
    pub fn start(self: &Arc<Self>) {
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.is_some() {
            return;
        }
        let Some(mut rx) = self.transport.events() else {
            warn!("Transport event stream already taken, session will not receive events");
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        *pump = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(session) = weak.upgrade() else {
                    break;
                };
                session.handle_transport_event(event);
            }
            debug!("Session event pump stopped");
        }));
    }

    /// Opens the socket and joins the session channel.
    pub fn connect(&self) {
        info!(url = %self.config.socket_url(), username = %self.config.username(), "Connecting session");
        self.transport.connect(self.connect_params());
        self.join_channel();
    }

    /// Joins a fresh channel, replacing the current one.
    ///
    /// The socket is reused while it is up and reopened if it was given up.
    /// The channel name is recomputed, so a preference change made since the
    /// last join takes effect. Listeners are kept.
    pub fn reset(&self) {
        info!("Resetting session channel");
        self.transport.connect(self.connect_params());
        self.join_channel();
    }

    fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            url: self.config.socket_url(),
            params: self.config.join_params(),
        }
    }

    fn join_channel(&self) {
        let topic = self.config.channel_name(self.prefs.open_on_home());

        let (id, previous) = {
            let mut state = self.state();
            let id = self.transport.channel(&topic);
            let previous = state.channel.replace(ChannelHandle {
                id,
                topic: topic.clone(),
            });
            state.status = SessionStatus::Connecting;
            (id, previous)
        };

        if let Some(old) = previous {
            debug!(channel = %old.id, topic = %old.topic, "Leaving superseded channel");
            self.transport.leave(old.id);
        }

        debug!(channel = %id, topic = %topic, "Joining channel");
        self.transport
            .join(id, self.config.join_params().to_payload());
    }

    /// Sends raw keystrokes. Dropped unless the channel is joined.
    pub fn send(&self, data: impl AsRef<[u8]>) {
        let data = data.as_ref();
        let channel = {
            let state = self.state();
            match (&state.channel, state.status) {
                (Some(channel), SessionStatus::Joined) => channel.id,
                _ => {
                    trace!(status = %state.status, len = data.len(), "Dropping input, channel not joined");
                    return;
                }
            }
        };

        let payload = TerminalInput::from_bytes(data).to_payload();
        if let Err(e) = self.transport.push(channel, wire::TERMINAL_INPUT, payload) {
            warn!(channel = %channel, error = %e, "Failed to push terminal input");
        }
    }

    /// Subscribes to one kind of session event.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.emitter.on(kind, handler)
    }

    /// Removes one listener. Returns false if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        self.emitter.off(id)
    }

    /// Removes every listener of every kind.
    pub fn remove_all_listeners(&self) {
        self.emitter.remove_all_listeners();
    }

    /// Leaves the channel, closes the socket, drops listeners and stops the pump.
    pub fn shutdown(&self) {
        let previous = {
            let mut state = self.state();
            state.status = SessionStatus::Disconnected;
            state.channel.take()
        };
        if let Some(channel) = previous {
            self.transport.leave(channel.id);
        }
        self.transport.disconnect();
        self.emitter.remove_all_listeners();

        if let Some(pump) = self
            .pump
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            pump.abort();
        }
        info!("Session shut down");
    }

    /// Current channel status.
    pub fn status(&self) -> SessionStatus {
        self.state().status
    }

    /// True after a join refusal or channel error, until the next successful join.
    pub fn has_failed(&self) -> bool {
        self.state().has_failed
    }

    /// Channel name the next join would use.
    pub fn channel_name(&self) -> String {
        self.config.channel_name(self.prefs.open_on_home())
    }

    /// Id of the current channel, if any.
    pub fn current_channel(&self) -> Option<ChannelId> {
        self.state().channel.as_ref().map(|c| c.id)
    }

    /// Connection settings this session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Shared preferences read on every join.
    pub fn preferences(&self) -> &Arc<Preferences> {
        &self.prefs
    }

    /// Applies one transport event. Events for superseded channels are ignored.
    pub fn handle_transport_event(&self, event: TransportEvent) {
        let TransportEvent { channel, kind } = event;

        let outgoing = {
            let mut state = self.state();
            if state.channel.as_ref().map(|c| c.id) != Some(channel) {
                trace!(channel = %channel, "Ignoring event for stale channel");
                return;
            }

            match kind {
                TransportEventKind::JoinOk(response) => {
                    state.status = SessionStatus::Joined;
                    state.has_failed = false;
                    info!(channel = %channel, "Channel joined");
                    SessionEvent::Open(response)
                }
                TransportEventKind::JoinError(response) => {
                    state.status = SessionStatus::Errored;
                    state.has_failed = true;
                    state.channel = None;
                    warn!(channel = %channel, response = %response, "Channel join refused");
                    SessionEvent::JoinError(response)
                }
                TransportEventKind::Message { event, payload } => {
                    if event != wire::TERMINAL_OUTPUT {
                        trace!(channel = %channel, event = %event, "Ignoring channel event");
                        return;
                    }
                    SessionEvent::Message(decode_output(&payload))
                }
                TransportEventKind::Close(payload) => {
                    state.status = SessionStatus::Closed;
                    state.channel = None;
                    info!(channel = %channel, "Channel closed by server");
                    SessionEvent::Close(payload)
                }
                TransportEventKind::Error(payload) => {
                    state.status = SessionStatus::Errored;
                    state.has_failed = true;
                    state.channel = None;
                    warn!(channel = %channel, payload = %payload, "Channel error");
                    drop(state);
                    self.transport.leave(channel);
                    SessionEvent::Error(payload)
                }
            }
        };

        self.emitter.emit(&outgoing);
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Transport> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("status", &state.status)
            .field("channel", &state.channel)
            .field("has_failed", &state.has_failed)
            .finish()
    }
}

/// Decodes a `terminal_output` payload, falling back to best-effort decoding.
fn decode_output(payload: &Value) -> bytes::Bytes {
    let output = TerminalOutput::from_payload(payload);
    match output.decode() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, len = output.terminal_output.len(), "Malformed terminal output, decoding best-effort");
            output.decode_lossy()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{Call, MockTransport};
    use serde_json::json;
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig::new("ile.learn.co", 443, "v2/terminal", "tok", "ada").with_lab_slug("lab1")
    }

    fn recorder<T: Transport + 'static>(
        session: &Session<T>,
        kind: EventKind,
    ) -> Arc<Mutex<Vec<SessionEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        session.on(kind, move |e| sink.lock().unwrap().push(e.clone()));
        seen
    }

    fn output(text: &str) -> TransportEventKind {
        TransportEventKind::Message {
            event: wire::TERMINAL_OUTPUT.to_string(),
            payload: json!({ "terminal_output": text }),
        }
    }

    fn joined_session() -> (Session<MockTransport>, Arc<MockTransport>, ChannelId) {
        let transport = Arc::new(MockTransport::new());
        let session = Session::new(config(), Arc::clone(&transport));
        session.connect();
        let id = session.current_channel().unwrap();
        session.handle_transport_event(TransportEvent::new(id, TransportEventKind::JoinOk(json!({}))));
        transport.ack(id, json!({}));
        (session, transport, id)
    }

    #[test]
    fn test_connect_opens_socket_then_joins() {
        let transport = Arc::new(MockTransport::new());
        let session = Session::new(config(), Arc::clone(&transport));
        assert_eq!(session.status(), SessionStatus::Disconnected);

        session.connect();

        let calls = transport.calls();
        assert_eq!(
            calls[0],
            Call::Connect(ConnectParams {
                url: "wss://ile.learn.co:443/v2/terminal".to_string(),
                params: config().join_params(),
            })
        );
        assert_eq!(calls[1], Call::Channel(ChannelId(1), "session:ada:lab1".to_string()));
        assert_eq!(
            calls[2],
            Call::Join(ChannelId(1), json!({ "token": "tok", "client": "atom" }))
        );
        assert_eq!(session.status(), SessionStatus::Connecting);
    }

    #[test]
    fn test_join_ok_emits_open() {
        let transport = Arc::new(MockTransport::new());
        let session = Session::new(config(), Arc::clone(&transport));
        let opened = recorder(&session, EventKind::Open);
        let join_errors = recorder(&session, EventKind::JoinError);

        session.connect();
        let id = session.current_channel().unwrap();
        session.handle_transport_event(TransportEvent::new(
            id,
            TransportEventKind::JoinOk(json!({ "motd": "hi" })),
        ));

        assert_eq!(session.status(), SessionStatus::Joined);
        assert_eq!(*opened.lock().unwrap(), vec![SessionEvent::Open(json!({ "motd": "hi" }))]);
        assert!(join_errors.lock().unwrap().is_empty());
    }

    #[test]
    fn test_join_error_emits_join_error_only() {
        let transport = Arc::new(MockTransport::new());
        let session = Session::new(config(), Arc::clone(&transport));
        let opened = recorder(&session, EventKind::Open);
        let errors = recorder(&session, EventKind::Error);
        let join_errors = recorder(&session, EventKind::JoinError);

        session.connect();
        let id = session.current_channel().unwrap();
        session.handle_transport_event(TransportEvent::new(
            id,
            TransportEventKind::JoinError(json!({ "reason": "unauthorized" })),
        ));

        assert_eq!(
            *join_errors.lock().unwrap(),
            vec![SessionEvent::JoinError(json!({ "reason": "unauthorized" }))]
        );
        assert!(opened.lock().unwrap().is_empty());
        assert!(errors.lock().unwrap().is_empty());
        assert!(session.has_failed());
        assert_eq!(session.status(), SessionStatus::Errored);
    }

    #[test]
    fn test_send_encodes_input() {
        let (session, transport, id) = joined_session();
        let messages = recorder(&session, EventKind::Message);

        session.send("ls\r");

        assert_eq!(
            transport.pushes(),
            vec![(id, "terminal_input".to_string(), json!({ "data": "bHMN" }))]
        );
        assert!(messages.lock().unwrap().is_empty());
    }

    #[test]
    fn test_send_empty_input() {
        let (session, transport, _) = joined_session();
        session.send("");
        assert_eq!(transport.pushes()[0].2, json!({ "data": "" }));
    }

    #[test]
    fn test_send_before_join_is_dropped() {
        let transport = Arc::new(MockTransport::new());
        let session = Session::new(config(), Arc::clone(&transport));

        session.send("never connected");
        session.connect();
        session.send("join in flight");

        assert!(transport.pushes().is_empty());
    }

    #[test]
    fn test_output_is_decoded() {
        let (session, _, id) = joined_session();
        let messages = recorder(&session, EventKind::Message);

        session.handle_transport_event(TransportEvent::new(id, output("aGVsbG8=")));
        session.handle_transport_event(TransportEvent::new(id, output("G1tB")));

        let messages = messages.lock().unwrap();
        assert_eq!(messages[0], SessionEvent::Message(bytes::Bytes::from_static(b"hello")));
        assert_eq!(messages[1], SessionEvent::Message(bytes::Bytes::from_static(b"\x1b[A")));
    }

    #[test]
    fn test_malformed_output_is_decoded_best_effort() {
        let (session, _, id) = joined_session();
        let messages = recorder(&session, EventKind::Message);

        session.handle_transport_event(TransportEvent::new(id, output("aGVs\nbG8")));

        assert_eq!(messages.lock().unwrap().len(), 1);
        assert_eq!(session.status(), SessionStatus::Joined);
    }

    #[test]
    fn test_other_events_are_ignored() {
        let (session, _, id) = joined_session();
        let messages = recorder(&session, EventKind::Message);

        session.handle_transport_event(TransportEvent::new(
            id,
            TransportEventKind::Message {
                event: "presence_diff".to_string(),
                payload: json!({}),
            },
        ));

        assert!(messages.lock().unwrap().is_empty());
    }

    #[test]
    fn test_close_emits_close_without_rejoin() {
        let (session, transport, id) = joined_session();
        let closed = recorder(&session, EventKind::Close);
        transport.clear_calls();

        session.handle_transport_event(TransportEvent::new(id, TransportEventKind::Close(json!({}))));

        assert_eq!(*closed.lock().unwrap(), vec![SessionEvent::Close(json!({}))]);
        assert_eq!(session.status(), SessionStatus::Closed);
        assert!(transport.calls().is_empty());

        session.send("x");
        assert!(transport.pushes().is_empty());
    }

    #[test]
    fn test_error_leaves_channel_then_emits() {
        let (session, transport, id) = joined_session();
        let errors = recorder(&session, EventKind::Error);
        transport.clear_calls();

        session.handle_transport_event(TransportEvent::new(
            id,
            TransportEventKind::Error(json!({ "reason": "crash" })),
        ));

        assert_eq!(transport.calls(), vec![Call::Leave(id)]);
        assert_eq!(*errors.lock().unwrap(), vec![SessionEvent::Error(json!({ "reason": "crash" }))]);
        assert!(session.has_failed());
        assert!(session.current_channel().is_none());
    }

    #[test]
    fn test_reset_leaves_old_and_joins_new() {
        let (session, transport, old) = joined_session();
        transport.clear_calls();

        session.reset();

        let new = session.current_channel().unwrap();
        assert_ne!(new, old);
        let calls = transport.calls();
        assert!(matches!(calls[0], Call::Connect(_)));
        assert_eq!(calls[1], Call::Channel(new, "session:ada:lab1".to_string()));
        assert_eq!(calls[2], Call::Leave(old));
        assert!(matches!(calls[3], Call::Join(id, _) if id == new));
        assert_eq!(session.status(), SessionStatus::Connecting);
    }

    #[test]
    fn test_reset_drops_events_for_old_channel() {
        let (session, _, old) = joined_session();
        let messages = recorder(&session, EventKind::Message);
        let closed = recorder(&session, EventKind::Close);

        session.reset();
        let new = session.current_channel().unwrap();
        session.handle_transport_event(TransportEvent::new(old, output("b2xk")));
        session.handle_transport_event(TransportEvent::new(old, TransportEventKind::Close(json!({}))));
        session.handle_transport_event(TransportEvent::new(new, TransportEventKind::JoinOk(json!({}))));
        session.handle_transport_event(TransportEvent::new(new, output("bmV3")));

        assert_eq!(
            *messages.lock().unwrap(),
            vec![SessionEvent::Message(bytes::Bytes::from_static(b"new"))]
        );
        assert!(closed.lock().unwrap().is_empty());
        assert_eq!(session.status(), SessionStatus::Joined);
    }

    #[test]
    fn test_reset_after_error_recovers() {
        let transport = Arc::new(MockTransport::new());
        let session = Session::new(config(), Arc::clone(&transport));
        session.connect();
        let first = session.current_channel().unwrap();
        session.handle_transport_event(TransportEvent::new(first, TransportEventKind::JoinError(json!({}))));
        assert!(session.has_failed());

        session.reset();
        let second = session.current_channel().unwrap();
        session.handle_transport_event(TransportEvent::new(second, TransportEventKind::JoinOk(json!({}))));

        assert!(!session.has_failed());
        assert_eq!(session.status(), SessionStatus::Joined);
        assert!(!transport.calls().contains(&Call::Leave(first)));
    }

    #[test]
    fn test_reset_reopens_socket_with_same_params() {
        let transport = Arc::new(MockTransport::new());
        let session = Session::new(config(), Arc::clone(&transport));
        session.connect();
        let first_connect = transport.calls()[0].clone();
        transport.clear_calls();

        session.reset();

        assert_eq!(transport.calls()[0], first_connect);
    }

    #[test]
    fn test_preference_change_applies_on_reset() {
        let transport = Arc::new(MockTransport::new());
        let prefs = Arc::new(Preferences::new(true));
        let config = SessionConfig::new("localhost", 4000, "socket", "tok", "ada");
        let session = Session::with_preferences(config, Arc::clone(&transport), Arc::clone(&prefs));

        session.connect();
        assert_eq!(session.channel_name(), "session:ada:home");

        prefs.set_open_on_home(false);
        session.reset();

        assert_eq!(
            transport.calls().last().cloned(),
            Some(Call::Join(ChannelId(2), json!({ "token": "tok", "client": "atom" })))
        );
        assert!(transport
            .calls()
            .contains(&Call::Channel(ChannelId(2), "session:ada:temporary".to_string())));
    }

    #[test]
    fn test_listeners_survive_reset() {
        let (session, _, _) = joined_session();
        let opened = recorder(&session, EventKind::Open);

        session.reset();
        let id = session.current_channel().unwrap();
        session.handle_transport_event(TransportEvent::new(id, TransportEventKind::JoinOk(json!({}))));

        assert_eq!(opened.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let (session, transport, id) = joined_session();
        session.on(EventKind::Message, |_| {});
        transport.clear_calls();

        session.shutdown();

        assert_eq!(transport.calls(), vec![Call::Leave(id), Call::Disconnect]);
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(session.emitter.listener_count(EventKind::Message), 0);
    }

    #[tokio::test]
    async fn test_pump_delivers_transport_events() {
        let transport = Arc::new(MockTransport::new());
        let session = Session::open(config(), Arc::clone(&transport), Arc::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        session.on(EventKind::Message, move |e| {
            let _ = tx.send(e.clone());
        });

        let id = transport.last_channel().unwrap();
        transport.ack(id, json!({}));
        transport.inject(id, output("aGVsbG8="));

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.text().unwrap(), "hello");
        assert_eq!(session.status(), SessionStatus::Joined);
    }
}
