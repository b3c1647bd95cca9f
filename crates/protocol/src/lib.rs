//! # labterm Protocol Library
//!
//! Wire-level definitions for labterm's remote terminal sessions.
//!
//! ## Overview
//!
//! A terminal session is a Phoenix channel named `session:<user>:<slug>`
//! multiplexed over one WebSocket. This crate holds everything about that
//! exchange that does not need a runtime:
//!
//! - **Framing**: base64 encoding of raw terminal bytes into JSON-safe text
//! - **Messages**: the Phoenix message envelope and the terminal payloads
//! - **Errors**: the shared error taxonomy
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Terminal bytes (keystrokes/output)  │
//! ├─────────────────────────────────────────┤
//! │           Framing (base64)              │  terminal_input / terminal_output
//! ├─────────────────────────────────────────┤
//! │     Phoenix message (JSON, V1)          │  topic, event, payload, ref
//! ├─────────────────────────────────────────┤
//! │            WebSocket                    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{framing, PhoenixMessage, TerminalInput};
//! use protocol::messages::events;
//!
//! let input = TerminalInput::from_bytes("ls\r");
//! let push = PhoenixMessage::new(
//!     "session:ada:home",
//!     events::TERMINAL_INPUT,
//!     input.to_payload(),
//!     Some("2".to_string()),
//!     Some("1".to_string()),
//! );
//! let text = push.to_json().unwrap();
//! assert!(text.contains("bHMN"));
//!
//! assert_eq!(framing::decode("bHMN").unwrap(), b"ls\r");
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: base64 encode/decode, strict and best-effort
//! - [`messages`]: Phoenix message definitions
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use messages::{
    JoinParams, PhoenixMessage, Reply, TerminalInput, TerminalOutput, PHOENIX_TOPIC, PHOENIX_VSN,
};
