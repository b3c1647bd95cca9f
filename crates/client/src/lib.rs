//! # labterm Client Library
//!
//! Remote terminal sessions on a hosted lab environment, carried over
//! Phoenix channels.
//!
//! ## Overview
//!
//! The client connects one WebSocket to the terminal service, joins the
//! channel `session:<username>:<slug>` and shuttles raw terminal bytes:
//!
//! - **Session**: channel lifecycle, input forwarding, owner events
//! - **Transport**: the channel abstraction and its Phoenix WebSocket implementation
//! - **Commands**: named operations (open, send, reset, clear, open lab)
//! - **Configuration**: TOML file plus environment overrides
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                 Owner (CLI / editor integration)              │
//! ├───────────────────────────────────────────────────────────────┤
//! │   Commands ──▶ Session ──▶ events: open, message, close,     │
//! │                  │                 error, error-joining-channel│
//! ├──────────────────┼────────────────────────────────────────────┤
//! │                  ▼                                            │
//! │     Transport (trait)  ◀── TransportEvent (mpsc) ── pump     │
//! │        └── PhoenixSocket: join/push/leave, heartbeat,        │
//! │                           reconnect with backoff              │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use client::{EventKind, PhoenixSocket, Preferences, Session, SessionConfig, SocketConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SessionConfig::new("ile.learn.co", 443, "v2/terminal", "token", "ada");
//!     let socket = Arc::new(PhoenixSocket::new(SocketConfig::default()));
//!     let session = Arc::new(Session::with_preferences(
//!         config,
//!         socket,
//!         Arc::new(Preferences::default()),
//!     ));
//!
//!     session.on(EventKind::Message, |event| {
//!         if let Some(text) = event.text() {
//!             print!("{}", text);
//!         }
//!     });
//!     session.on(EventKind::Open, |_| println!("connected"));
//!     session.start();
//!     session.connect();
//!
//!     // Keystrokes are forwarded once the channel is joined.
//!     session.send("ls\r");
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session state machine and events
//! - [`transport`]: Transport trait and Phoenix socket
//! - [`commands`]: Named session commands

pub mod commands;
pub mod config;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use commands::{CommandError, SessionCommand};
pub use config::Config;
pub use session::{
    EventKind, ListenerId, Preferences, Session, SessionConfig, SessionEvent, SessionStatus,
};
pub use transport::{
    ChannelId, ConnectParams, PhoenixSocket, SocketConfig, Transport, TransportEvent,
    TransportEventKind,
};
