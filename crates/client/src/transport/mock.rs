//! In-memory transport that records every call.

use std::sync::Mutex;

use protocol::{ProtocolError, Result};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{ChannelId, ConnectParams, Transport, TransportEvent, TransportEventKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect(ConnectParams),
    Disconnect,
    Channel(ChannelId, String),
    Join(ChannelId, Value),
    Push(ChannelId, String, Value),
    Leave(ChannelId),
}

pub struct MockTransport {
    calls: Mutex<Vec<Call>>,
    next_id: Mutex<u64>,
    joined: Mutex<Vec<ChannelId>>,
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            calls: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
            joined: Mutex::new(Vec::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Pushes recorded on any channel, as `(channel, event, payload)`.
    pub fn pushes(&self) -> Vec<(ChannelId, String, Value)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Push(id, event, payload) => Some((id, event, payload)),
                _ => None,
            })
            .collect()
    }

    /// The most recently allocated channel.
    pub fn last_channel(&self) -> Option<ChannelId> {
        self.calls().into_iter().rev().find_map(|call| match call {
            Call::Channel(id, _) => Some(id),
            _ => None,
        })
    }

    /// Marks a channel joined and queues the matching event.
    pub fn ack(&self, channel: ChannelId, response: Value) {
        self.joined.lock().unwrap().push(channel);
        self.inject(channel, TransportEventKind::JoinOk(response));
    }

    pub fn inject(&self, channel: ChannelId, kind: TransportEventKind) {
        let _ = self.tx.send(TransportEvent::new(channel, kind));
    }
}

impl Transport for MockTransport {
    fn connect(&self, params: ConnectParams) {
        self.calls.lock().unwrap().push(Call::Connect(params));
    }

    fn disconnect(&self) {
        self.calls.lock().unwrap().push(Call::Disconnect);
    }

    fn channel(&self, topic: &str) -> ChannelId {
        let mut next = self.next_id.lock().unwrap();
        *next += 1;
        let id = ChannelId(*next);
        self.calls
            .lock()
            .unwrap()
            .push(Call::Channel(id, topic.to_string()));
        id
    }

    fn join(&self, channel: ChannelId, payload: Value) {
        self.calls.lock().unwrap().push(Call::Join(channel, payload));
    }

    fn push(&self, channel: ChannelId, event: &str, payload: Value) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Push(channel, event.to_string(), payload));
        if self.joined.lock().unwrap().contains(&channel) {
            Ok(())
        } else {
            Err(ProtocolError::NotJoined {
                topic: channel.to_string(),
            })
        }
    }

    fn leave(&self, channel: ChannelId) {
        self.joined.lock().unwrap().retain(|id| *id != channel);
        self.calls.lock().unwrap().push(Call::Leave(channel));
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.rx.lock().unwrap().take()
    }
}
