//! Channel transport abstraction.
//!
//! A [`Transport`] multiplexes named channels over one connection. All calls
//! return immediately; outcomes (join acknowledgements, inbound messages,
//! close and error notifications) arrive later as [`TransportEvent`]s on the
//! receiver handed out by [`Transport::events`].

pub mod phoenix;

#[cfg(test)]
pub(crate) mod mock;

use std::fmt;

use protocol::{JoinParams, Result};
use serde_json::Value;
use tokio::sync::mpsc;

pub use phoenix::{PhoenixSocket, SocketConfig};

/// Locally unique tag of one channel instance.
///
/// Rejoining the same topic yields a new id, so late events for a replaced
/// channel can be told apart from events for its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// Where and how to open the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Base socket URL, e.g. `wss://host:443/v2/terminal`.
    pub url: String,
    /// Sent as query parameters when the socket opens.
    pub params: JoinParams,
}

/// Something that happened on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub channel: ChannelId,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    pub fn new(channel: ChannelId, kind: TransportEventKind) -> Self {
        Self { channel, kind }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// Join acknowledged with status ok; carries the response.
    JoinOk(Value),
    /// Join refused; carries the response.
    JoinError(Value),
    /// Any other server push on the channel.
    Message { event: String, payload: Value },
    /// Server closed the channel.
    Close(Value),
    /// Channel crashed or the connection under it dropped.
    Error(Value),
}

/// Publish/subscribe connection carrying named channels.
pub trait Transport: Send + Sync {
    /// Opens the connection. Idempotent while a connection is live.
    ///
    /// Failures arrive as `Error` events for live channels. Once the
    /// connection is given up, later joins fail the same way until the
    /// next `connect`.
    fn connect(&self, params: ConnectParams);

    /// Closes the connection and stops reconnecting.
    fn disconnect(&self);

    /// Allocates a channel handle for `topic` without joining it.
    fn channel(&self, topic: &str) -> ChannelId;

    /// Requests to join. The reply arrives as `JoinOk` or `JoinError`.
    fn join(&self, channel: ChannelId, payload: Value);

    /// Pushes an event on a joined channel.
    fn push(&self, channel: ChannelId, event: &str, payload: Value) -> Result<()>;

    /// Leaves the channel. No further events are delivered for it.
    fn leave(&self, channel: ChannelId);

    /// Takes the event receiver. Returns `None` after the first call.
    fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}
