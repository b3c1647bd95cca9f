//! Phoenix channel wire messages.
//!
//! The terminal server speaks the Phoenix channels protocol (V1 JSON
//! serializer). Every WebSocket text frame is one [`PhoenixMessage`]:
//!
//! ```json
//! {"topic":"session:ada:home","event":"terminal_input","payload":{"data":"bHMN"},"ref":"4","join_ref":"2"}
//! ```
//!
//! Control events (`phx_join`, `phx_reply`, ...) share the same envelope.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::framing;

/// Serializer version advertised to the server in the `vsn` query parameter.
pub const PHOENIX_VSN: &str = "1.0.0";

/// Topic used for socket-level messages such as heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Event names used on the wire.
pub mod events {
    /// Join request for a channel.
    pub const JOIN: &str = "phx_join";
    /// Reply to a push carrying a ref.
    pub const REPLY: &str = "phx_reply";
    /// Leave request for a channel.
    pub const LEAVE: &str = "phx_leave";
    /// Server closed the channel.
    pub const CLOSE: &str = "phx_close";
    /// Server-side channel process crashed.
    pub const ERROR: &str = "phx_error";
    /// Socket keepalive.
    pub const HEARTBEAT: &str = "heartbeat";
    /// Keystrokes sent to the remote shell.
    pub const TERMINAL_INPUT: &str = "terminal_input";
    /// Output produced by the remote shell.
    pub const TERMINAL_OUTPUT: &str = "terminal_output";
}

/// A single Phoenix protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    /// Channel topic, e.g. `session:ada:home`.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Value,
    /// Message reference, used to correlate replies.
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    /// Reference of the join that created the channel instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl PhoenixMessage {
    /// Create a message with an explicit event.
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        msg_ref: Option<String>,
        join_ref: Option<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            msg_ref,
            join_ref,
        }
    }

    /// Create a join request. The join's ref doubles as the channel's join_ref.
    pub fn join(topic: impl Into<String>, payload: Value, join_ref: impl Into<String>) -> Self {
        let join_ref = join_ref.into();
        Self::new(
            topic,
            events::JOIN,
            payload,
            Some(join_ref.clone()),
            Some(join_ref),
        )
    }

    /// Create a leave request for the channel instance identified by `join_ref`.
    pub fn leave(
        topic: impl Into<String>,
        msg_ref: impl Into<String>,
        join_ref: Option<String>,
    ) -> Self {
        Self::new(
            topic,
            events::LEAVE,
            Value::Object(Default::default()),
            Some(msg_ref.into()),
            join_ref,
        )
    }

    /// Create a socket heartbeat.
    pub fn heartbeat(msg_ref: impl Into<String>) -> Self {
        Self::new(
            PHOENIX_TOPIC,
            events::HEARTBEAT,
            Value::Object(Default::default()),
            Some(msg_ref.into()),
            None,
        )
    }

    /// Serialize to the JSON text sent over the socket.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame received from the socket.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns the reply carried by a `phx_reply` message.
    pub fn reply(&self) -> Option<Reply> {
        if self.event != events::REPLY {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Payload of a `phx_reply` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// `"ok"` or `"error"`.
    pub status: String,
    /// Server response body.
    #[serde(default)]
    pub response: Value,
}

impl Reply {
    /// Whether the server accepted the request.
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Parameters identifying this client, sent with the socket connection and the join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinParams {
    /// Opaque authentication token.
    pub token: String,
    /// Client tag, `"atom"` by default.
    pub client: String,
}

impl JoinParams {
    /// Convert into the JSON payload of a `phx_join`.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({ "token": self.token, "client": self.client })
    }
}

/// Payload of a `terminal_input` push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInput {
    /// Base64-encoded input bytes.
    pub data: String,
}

impl TerminalInput {
    /// Encode raw input bytes.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self {
            data: framing::encode(bytes),
        }
    }

    /// Convert into a JSON payload.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({ "data": self.data })
    }
}

/// Payload of a `terminal_output` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalOutput {
    /// Base64-encoded output bytes.
    pub terminal_output: String,
}

impl TerminalOutput {
    /// Encode raw output bytes. Used by servers and tests.
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self {
            terminal_output: framing::encode(bytes),
        }
    }

    /// Extract the payload from an event, tolerating a missing or non-string field.
    pub fn from_payload(payload: &Value) -> Self {
        let terminal_output = payload
            .get("terminal_output")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Self { terminal_output }
    }

    /// Convert into a JSON payload.
    pub fn to_payload(&self) -> Value {
        serde_json::json!({ "terminal_output": self.terminal_output })
    }

    /// Strictly decode the output bytes.
    pub fn decode(&self) -> Result<Bytes> {
        framing::decode(&self.terminal_output).map(Bytes::from)
    }

    /// Decode the output bytes, recovering what it can from a damaged frame.
    pub fn decode_lossy(&self) -> Bytes {
        Bytes::from(framing::decode_lossy(&self.terminal_output))
    }
}
