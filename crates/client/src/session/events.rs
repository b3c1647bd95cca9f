//! Owner-facing session events and their subscriber registry.
//!
//! Listeners are keyed by [`EventKind`] and run synchronously, in
//! registration order, on the task that raised the event. The registry is
//! session-scoped: it is untouched by channel replacement, so owners never
//! re-subscribe after a reset.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde_json::Value;

/// The kinds of event a session raises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The channel join was acknowledged.
    Open,
    /// Decoded terminal output arrived.
    Message,
    /// The server closed the channel.
    Close,
    /// A joined channel failed and was left.
    Error,
    /// The join request was refused.
    JoinError,
}

impl EventKind {
    /// All kinds, in declaration order.
    pub const ALL: [EventKind; 5] = [
        EventKind::Open,
        EventKind::Message,
        EventKind::Close,
        EventKind::Error,
        EventKind::JoinError,
    ];

    /// Event name as used by owners.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Open => "open",
            EventKind::Message => "message",
            EventKind::Close => "close",
            EventKind::Error => "error",
            EventKind::JoinError => "error-joining-channel",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown event: {}", s))
    }
}

/// An event raised by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Join acknowledged; carries the server's reply.
    Open(Value),
    /// Terminal output, already decoded from base64.
    Message(Bytes),
    /// Channel closed; carries the close payload.
    Close(Value),
    /// Channel failed; carries the error payload.
    Error(Value),
    /// Join refused; carries the server's reply.
    JoinError(Value),
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Open(_) => EventKind::Open,
            SessionEvent::Message(_) => EventKind::Message,
            SessionEvent::Close(_) => EventKind::Close,
            SessionEvent::Error(_) => EventKind::Error,
            SessionEvent::JoinError(_) => EventKind::JoinError,
        }
    }

    /// Output as text, replacing invalid UTF-8. `None` for non-message events.
    pub fn text(&self) -> Option<Cow<'_, str>> {
        match self {
            SessionEvent::Message(bytes) => Some(String::from_utf8_lossy(bytes)),
            _ => None,
        }
    }
}

/// Handle returned by [`EventEmitter::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<EventKind, Vec<(ListenerId, Handler)>>,
}

/// Registry of event listeners.
#[derive(Default)]
pub struct EventEmitter {
    registry: Mutex<Registry>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes `handler` to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry();
        registry.next_id += 1;
        let id = ListenerId(registry.next_id);
        registry
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Removes one listener. Returns whether it was registered.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut registry = self.registry();
        for handlers in registry.listeners.values_mut() {
            if let Some(pos) = handlers.iter().position(|(listener, _)| *listener == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Removes every listener of every kind.
    pub fn remove_all_listeners(&self) {
        self.registry().listeners.clear();
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry().listeners.get(&kind).map_or(0, Vec::len)
    }

    /// Invokes the listeners for the event's kind. Returns how many ran.
    ///
    /// The registry lock is released before any handler runs, so handlers
    /// may subscribe, unsubscribe, or drive the session.
    pub fn emit(&self, event: &SessionEvent) -> usize {
        let handlers: Vec<Handler> = self
            .registry()
            .listeners
            .get(&event.kind())
            .map(|handlers| handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry();
        let counts: HashMap<EventKind, usize> = registry
            .listeners
            .iter()
            .map(|(kind, handlers)| (*kind, handlers.len()))
            .collect();
        f.debug_struct("EventEmitter")
            .field("listeners", &counts)
            .finish()
    }
}
