//! Phoenix channels client over WebSocket.
//!
//! Speaks the V1 JSON serializer: every frame is a text object
//! `{topic, event, payload, ref, join_ref}`. One socket carries any number of
//! channels; each `phx_join` allocates a `join_ref` that tags every later
//! message for that channel instance, which is how replies and pushes for a
//! left channel are told apart from its replacement on the same topic.
//!
//! The socket reconnects with exponential backoff but never rejoins
//! channels on its own. On every drop each live channel gets an
//! [`TransportEventKind::Error`] and its owner decides what to do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::messages::events;
use protocol::{PhoenixMessage, ProtocolError, Result, PHOENIX_TOPIC, PHOENIX_VSN};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{ChannelId, ConnectParams, Transport, TransportEvent, TransportEventKind};

/// Default reconnection settings.
const INITIAL_BACKOFF_MS: u64 = 1_000;
const MAX_BACKOFF_MS: u64 = 10_000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

const HEARTBEAT_INTERVAL_SECS: u64 = 30;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for the Phoenix socket.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketConfig {
    /// Initial backoff duration for reconnection.
    pub initial_backoff: Duration,
    /// Maximum backoff duration for reconnection.
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to reconnect after the socket drops.
    pub auto_reconnect: bool,
    /// Interval between heartbeats. A heartbeat still unanswered at the
    /// next tick drops the connection.
    pub heartbeat_interval: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            backoff_multiplier: BACKOFF_MULTIPLIER,
            auto_reconnect: true,
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
        }
    }
}

impl SocketConfig {
    /// Sets whether to reconnect automatically.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Sets the initial backoff duration.
    pub fn with_initial_backoff(mut self, duration: Duration) -> Self {
        self.initial_backoff = duration;
        self
    }

    /// Sets the maximum backoff duration.
    pub fn with_max_backoff(mut self, duration: Duration) -> Self {
        self.max_backoff = duration;
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Socket connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting out a backoff before the next attempt.
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    /// Allocated, join not yet requested.
    Closed,
    Joining,
    Joined,
    Errored,
}

#[derive(Debug)]
struct ChannelEntry {
    topic: String,
    state: ChannelState,
    join_ref: Option<String>,
}

impl ChannelEntry {
    fn is_live(&self) -> bool {
        matches!(self.state, ChannelState::Joining | ChannelState::Joined)
    }
}

struct Running {
    generation: u64,
    shutdown: CancellationToken,
}

struct SocketState {
    connection_state: ConnectionState,
    channels: HashMap<ChannelId, ChannelEntry>,
    /// Join push ref to the channel that sent it.
    pending_joins: HashMap<String, ChannelId>,
    pending_heartbeat: Option<String>,
    /// Writer for the live connection, if any.
    outbound_tx: Option<mpsc::UnboundedSender<PhoenixMessage>>,
    /// Messages queued while no connection is open.
    send_buffer: Vec<PhoenixMessage>,
    next_ref: u64,
    next_channel: u64,
    generation: u64,
    running: Option<Running>,
    /// Why no connection loop is running after one was requested. Joins
    /// fail immediately with this reason until the next `connect`.
    stopped: Option<String>,
    current_backoff: Duration,
}

impl SocketState {
    fn new(config: &SocketConfig) -> Self {
        Self {
            connection_state: ConnectionState::Disconnected,
            channels: HashMap::new(),
            pending_joins: HashMap::new(),
            pending_heartbeat: None,
            outbound_tx: None,
            send_buffer: Vec::new(),
            next_ref: 0,
            next_channel: 0,
            generation: 0,
            running: None,
            stopped: None,
            current_backoff: config.initial_backoff,
        }
    }

    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    /// Hands a message to the live connection, or buffers it until one opens.
    fn enqueue(&mut self, message: PhoenixMessage) {
        let message = match &self.outbound_tx {
            Some(tx) => match tx.send(message) {
                Ok(()) => return,
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };
        self.send_buffer.push(message);
    }

    fn channel_by_join_ref(&self, join_ref: &str) -> Option<ChannelId> {
        self.channels
            .iter()
            .find(|(_, entry)| entry.join_ref.as_deref() == Some(join_ref))
            .map(|(id, _)| *id)
    }

    /// Newest channel on `topic` whose state passes `accept`.
    fn newest_on_topic(&self, topic: &str, accept: impl Fn(&ChannelEntry) -> bool) -> Option<ChannelId> {
        self.channels
            .iter()
            .filter(|(_, entry)| entry.topic == topic && accept(*entry))
            .map(|(id, _)| *id)
            .max()
    }

    fn forget_pending_joins(&mut self, channel: ChannelId) {
        self.pending_joins.retain(|_, id| *id != channel);
    }
}

struct SocketInner {
    config: SocketConfig,
    state: Mutex<SocketState>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

/// Phoenix socket implementing [`Transport`]. Cheap to clone.
#[derive(Clone)]
pub struct PhoenixSocket {
    inner: Arc<SocketInner>,
}

impl PhoenixSocket {
    pub fn new(config: SocketConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let state = SocketState::new(&config);

        Self {
            inner: Arc::new(SocketInner {
                config,
                state: Mutex::new(state),
                event_tx,
                event_rx: Mutex::new(Some(event_rx)),
            }),
        }
    }

    /// Current socket connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state().connection_state
    }

    pub fn config(&self) -> &SocketConfig {
        &self.inner.config
    }
}

impl Default for PhoenixSocket {
    fn default() -> Self {
        Self::new(SocketConfig::default())
    }
}

/// Builds the socket endpoint: `<url>/websocket?token=..&client=..&vsn=1.0.0`.
pub fn endpoint_url(params: &ConnectParams) -> Result<Url> {
    let base = params.url.trim_end_matches('/');
    let mut url = Url::parse(&format!("{}/websocket", base))
        .map_err(|e| ProtocolError::InvalidUrl(format!("{}: {}", params.url, e)))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(ProtocolError::InvalidUrl(format!(
                "unsupported scheme {:?} in {}",
                other, params.url
            )))
        }
    }

    url.query_pairs_mut()
        .append_pair("token", &params.params.token)
        .append_pair("client", &params.params.client)
        .append_pair("vsn", PHOENIX_VSN);
    Ok(url)
}

impl SocketInner {
    fn state(&self) -> MutexGuard<'_, SocketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, channel: ChannelId, kind: TransportEventKind) {
        if self.event_tx.send(TransportEvent::new(channel, kind)).is_err() {
            tracing::trace!(channel = %channel, "Transport event receiver dropped");
        }
    }

    fn set_connection_state(&self, new_state: ConnectionState) {
        let mut state = self.state();
        if state.connection_state != new_state {
            tracing::debug!(from = ?state.connection_state, to = ?new_state, "Socket state changed");
            state.connection_state = new_state;
        }
    }

    /// Routes one inbound message to its channel.
    fn handle_incoming(&self, message: PhoenixMessage) {
        if message.topic == PHOENIX_TOPIC {
            if message.event == events::REPLY {
                let mut state = self.state();
                if message.msg_ref.is_some() && message.msg_ref == state.pending_heartbeat {
                    state.pending_heartbeat = None;
                }
            }
            return;
        }

        match message.event.as_str() {
            events::REPLY => self.handle_reply(message),
            events::CLOSE => self.handle_close_or_error(message, false),
            events::ERROR => self.handle_close_or_error(message, true),
            _ => self.handle_push(message),
        }
    }

    fn handle_reply(&self, message: PhoenixMessage) {
        let Some(msg_ref) = message.msg_ref.as_deref() else {
            return;
        };

        let event = {
            let mut state = self.state();
            let Some(channel) = state.pending_joins.remove(msg_ref) else {
                // Replies to pushes and leaves carry nothing we act on.
                tracing::trace!(topic = %message.topic, msg_ref, "Ignoring reply");
                return;
            };
            let Some(entry) = state.channels.get_mut(&channel) else {
                return;
            };

            match message.reply() {
                Some(reply) if reply.is_ok() => {
                    entry.state = ChannelState::Joined;
                    tracing::debug!(channel = %channel, topic = %entry.topic, "Join acknowledged");
                    (channel, TransportEventKind::JoinOk(reply.response))
                }
                reply => {
                    let response = reply.map_or_else(|| message.payload.clone(), |r| r.response);
                    tracing::warn!(channel = %channel, topic = %entry.topic, response = %response, "Join refused");
                    state.channels.remove(&channel);
                    (channel, TransportEventKind::JoinError(response))
                }
            }
        };

        self.emit(event.0, event.1);
    }

    fn handle_close_or_error(&self, message: PhoenixMessage, is_error: bool) {
        let event = {
            let mut state = self.state();
            let key = message.join_ref.as_deref().or(message.msg_ref.as_deref());
            let channel = match key {
                Some(key) => state.channel_by_join_ref(key),
                None => state.newest_on_topic(&message.topic, ChannelEntry::is_live),
            };
            let Some(channel) = channel else {
                tracing::trace!(topic = %message.topic, event = %message.event, "No channel for message");
                return;
            };
            state.forget_pending_joins(channel);

            if is_error {
                if let Some(entry) = state.channels.get_mut(&channel) {
                    entry.state = ChannelState::Errored;
                }
                (channel, TransportEventKind::Error(message.payload))
            } else {
                state.channels.remove(&channel);
                (channel, TransportEventKind::Close(message.payload))
            }
        };

        self.emit(event.0, event.1);
    }

    fn handle_push(&self, message: PhoenixMessage) {
        let channel = {
            let state = self.state();
            let channel = match message.join_ref.as_deref() {
                Some(join_ref) => state.channel_by_join_ref(join_ref),
                None => state.newest_on_topic(&message.topic, |entry| entry.state == ChannelState::Joined),
            };
            match channel {
                Some(id) if state.channels.get(&id).map(|e| e.state) == Some(ChannelState::Joined) => id,
                _ => {
                    tracing::trace!(topic = %message.topic, event = %message.event, "Dropping message for unknown channel");
                    return;
                }
            }
        };

        self.emit(
            channel,
            TransportEventKind::Message {
                event: message.event,
                payload: message.payload,
            },
        );
    }

    /// Fails every live channel after the socket dropped or never opened.
    fn handle_connection_lost(&self, reason: &str) {
        let failed: Vec<ChannelId> = {
            let mut state = self.state();
            state.outbound_tx = None;
            state.pending_joins.clear();
            state.pending_heartbeat = None;
            state.send_buffer.clear();

            let mut failed: Vec<ChannelId> = state
                .channels
                .iter_mut()
                .filter(|(_, entry)| entry.is_live())
                .map(|(id, entry)| {
                    entry.state = ChannelState::Errored;
                    *id
                })
                .collect();
            failed.sort();
            failed
        };

        for channel in failed {
            self.emit(channel, TransportEventKind::Error(json!({ "reason": reason })));
        }
    }

    /// Returns the next heartbeat, or `None` if the previous one is unanswered.
    fn next_heartbeat(&self) -> Option<PhoenixMessage> {
        let mut state = self.state();
        if state.pending_heartbeat.is_some() {
            return None;
        }
        let msg_ref = state.make_ref();
        state.pending_heartbeat = Some(msg_ref.clone());
        Some(PhoenixMessage::heartbeat(msg_ref))
    }

    /// Installs the writer for a fresh connection and flushes the buffer.
    fn attach(&self, outbound_tx: mpsc::UnboundedSender<PhoenixMessage>) {
        let mut state = self.state();
        state.current_backoff = self.config.initial_backoff;
        state.pending_heartbeat = None;
        for message in state.send_buffer.drain(..) {
            let _ = outbound_tx.send(message);
        }
        state.outbound_tx = Some(outbound_tx);
        state.connection_state = ConnectionState::Connected;
    }

    /// Marks the loop of `generation` as finished for good. Joins from now
    /// on fail with `reason` instead of waiting in the buffer.
    fn mark_stopped(&self, generation: u64, reason: &str) {
        let mut state = self.state();
        if state.running.as_ref().map(|r| r.generation) == Some(generation) {
            state.running = None;
            state.outbound_tx = None;
            state.connection_state = ConnectionState::Disconnected;
            state.stopped = Some(reason.to_string());
        }
    }

    /// Records a local connect failure and fails every live channel.
    fn fail_connect(&self, reason: &str) {
        self.state().stopped = Some(reason.to_string());
        self.handle_connection_lost(reason);
    }

    fn next_backoff(&self) -> Duration {
        let mut state = self.state();
        let backoff = state.current_backoff;
        state.current_backoff = std::cmp::min(
            Duration::from_secs_f64(backoff.as_secs_f64() * self.config.backoff_multiplier),
            self.config.max_backoff,
        );
        backoff
    }

    /// Runs the connection loop with reconnection support.
    async fn run_connection_loop(self: Arc<Self>, endpoint: Url, generation: u64, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.set_connection_state(ConnectionState::Connecting);
            tracing::info!(host = ?endpoint.host_str(), path = %endpoint.path(), "Connecting to socket");

            let attempt = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(endpoint.as_str())) => result,
            };

            let reason = match attempt {
                Ok(Ok((ws, _))) => {
                    tracing::info!("Socket connected");
                    let reason = self.run_connection(ws, &shutdown).await;
                    if shutdown.is_cancelled() {
                        break;
                    }
                    reason
                }
                Ok(Err(e)) => format!("connection failed: {}", e),
                Err(_) => format!("connection timed out after {:?}", CONNECT_TIMEOUT),
            };

            tracing::warn!(reason = %reason, "Socket connection lost");

            if !self.config.auto_reconnect {
                // Stop before failing channels so a join racing this sees it.
                self.mark_stopped(generation, &reason);
                self.handle_connection_lost(&reason);
                break;
            }
            self.handle_connection_lost(&reason);

            let backoff = self.next_backoff();
            self.set_connection_state(ConnectionState::Reconnecting);
            tracing::info!("reconnecting in {:?}", backoff);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
        }

        let mut state = self.state();
        if state.running.as_ref().map(|r| r.generation) == Some(generation) {
            state.running = None;
            state.outbound_tx = None;
            state.connection_state = ConnectionState::Disconnected;
        }
        tracing::debug!(generation, "Socket loop stopped");
    }

    /// Pumps one open connection until it drops. Returns why it ended.
    async fn run_connection(&self, ws: WsStream, shutdown: &CancellationToken) -> String {
        let (mut ws_sink, mut ws_stream) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<PhoenixMessage>();
        self.attach(outbound_tx);

        let mut heartbeat_interval = tokio::time::interval(self.config.heartbeat_interval);
        // Skip the first immediate tick
        heartbeat_interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = ws_sink.send(WsMessage::Close(None)).await;
                    return "shutdown".to_string();
                }
                _ = heartbeat_interval.tick() => {
                    let Some(heartbeat) = self.next_heartbeat() else {
                        return "heartbeat timeout".to_string();
                    };
                    match heartbeat.to_json() {
                        Ok(json) => {
                            if let Err(e) = ws_sink.send(WsMessage::Text(json)).await {
                                return format!("failed to send heartbeat: {}", e);
                            }
                            tracing::trace!("Sent heartbeat");
                        }
                        Err(e) => tracing::error!("failed to serialize heartbeat: {}", e),
                    }
                }
                Some(message) = outbound_rx.recv() => {
                    match message.to_json() {
                        Ok(json) => {
                            if let Err(e) = ws_sink.send(WsMessage::Text(json)).await {
                                return format!("failed to send message: {}", e);
                            }
                        }
                        Err(e) => tracing::error!(event = %message.event, "failed to serialize message: {}", e),
                    }
                }
                frame = ws_stream.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => match PhoenixMessage::from_json(&text) {
                        Ok(message) => self.handle_incoming(message),
                        Err(e) => tracing::warn!(error = %e, len = text.len(), "Failed to parse socket message"),
                    },
                    Some(Ok(WsMessage::Close(_))) => return "server closed connection".to_string(),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return format!("websocket error: {}", e),
                    None => return "stream ended".to_string(),
                },
            }
        }
    }
}

impl Transport for PhoenixSocket {
    fn connect(&self, params: ConnectParams) {
        let endpoint = match endpoint_url(&params) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::error!(error = %e, "Invalid socket URL");
                self.inner.fail_connect(&e.to_string());
                return;
            }
        };

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "Cannot connect socket outside a tokio runtime");
                self.inner.fail_connect("no async runtime");
                return;
            }
        };

        let (generation, shutdown) = {
            let mut state = self.inner.state();
            if state.running.is_some() {
                tracing::debug!("Socket already running");
                return;
            }
            state.stopped = None;
            state.generation += 1;
            let generation = state.generation;
            let shutdown = CancellationToken::new();
            state.running = Some(Running {
                generation,
                shutdown: shutdown.clone(),
            });
            (generation, shutdown)
        };

        let inner = Arc::clone(&self.inner);
        handle.spawn(inner.run_connection_loop(endpoint, generation, shutdown));
    }

    fn disconnect(&self) {
        let mut state = self.inner.state();
        if let Some(running) = state.running.take() {
            running.shutdown.cancel();
        }
        state.outbound_tx = None;
        state.channels.clear();
        state.pending_joins.clear();
        state.pending_heartbeat = None;
        state.send_buffer.clear();
        state.current_backoff = self.inner.config.initial_backoff;
        state.connection_state = ConnectionState::Disconnected;
        state.stopped = Some("socket disconnected".to_string());
        tracing::info!("Socket disconnected");
    }

    fn channel(&self, topic: &str) -> ChannelId {
        let mut state = self.inner.state();
        state.next_channel += 1;
        let id = ChannelId(state.next_channel);
        state.channels.insert(
            id,
            ChannelEntry {
                topic: topic.to_string(),
                state: ChannelState::Closed,
                join_ref: None,
            },
        );
        id
    }

    fn join(&self, channel: ChannelId, payload: Value) {
        let mut state = self.inner.state();
        let join_ref = state.make_ref();
        let stopped = state.stopped.clone();
        let Some(entry) = state.channels.get_mut(&channel) else {
            tracing::warn!(channel = %channel, "Join requested for unknown channel");
            return;
        };

        if let Some(reason) = stopped {
            entry.state = ChannelState::Errored;
            drop(state);
            tracing::warn!(channel = %channel, reason = %reason, "Join failed, socket is not running");
            self.inner.emit(channel, TransportEventKind::Error(json!({ "reason": reason })));
            return;
        }

        entry.state = ChannelState::Joining;
        entry.join_ref = Some(join_ref.clone());
        let message = PhoenixMessage::join(entry.topic.clone(), payload, join_ref.clone());

        state.pending_joins.insert(join_ref, channel);
        state.enqueue(message);
    }

    fn push(&self, channel: ChannelId, event: &str, payload: Value) -> Result<()> {
        let mut state = self.inner.state();
        let (topic, join_ref) = match state.channels.get(&channel) {
            Some(entry) if entry.state == ChannelState::Joined => {
                (entry.topic.clone(), entry.join_ref.clone())
            }
            Some(entry) => {
                return Err(ProtocolError::NotJoined {
                    topic: entry.topic.clone(),
                })
            }
            None => return Err(ProtocolError::UnknownChannel(channel.0)),
        };

        let msg_ref = state.make_ref();
        state.enqueue(PhoenixMessage::new(topic, event, payload, Some(msg_ref), join_ref));
        Ok(())
    }

    fn leave(&self, channel: ChannelId) {
        let mut state = self.inner.state();
        let Some(entry) = state.channels.remove(&channel) else {
            return;
        };
        state.forget_pending_joins(channel);

        // Errored channels are already gone on the server side.
        if entry.is_live() {
            let msg_ref = state.make_ref();
            state.enqueue(PhoenixMessage::leave(entry.topic, msg_ref, entry.join_ref));
        }
        tracing::debug!(channel = %channel, "Channel left");
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.inner
            .event_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}
