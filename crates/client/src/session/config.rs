//! Session identity and host preferences.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use protocol::JoinParams;

/// Client tag the terminal service expects from editor clients.
pub const DEFAULT_CLIENT_ID: &str = "atom";

/// Slug used when no lab is given and the host prefers the home workspace.
pub const HOME_SLUG: &str = "home";

/// Slug used when no lab is given and the host prefers a throwaway workspace.
pub const TEMPORARY_SLUG: &str = "temporary";

/// Port that selects the secure WebSocket scheme.
pub const TLS_PORT: u16 = 443;

/// Connection parameters for one session. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionConfig {
    host: String,
    port: u16,
    base_path: String,
    auth_token: String,
    username: String,
    lab_slug: Option<String>,
    client_id: String,
}

impl SessionConfig {
    /// Creates a configuration with no lab and the default client tag.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        base_path: impl Into<String>,
        auth_token: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            base_path: base_path.into(),
            auth_token: auth_token.into(),
            username: username.into(),
            lab_slug: None,
            client_id: DEFAULT_CLIENT_ID.to_string(),
        }
    }

    /// Sets the lab to open.
    pub fn with_lab_slug(mut self, lab_slug: impl Into<String>) -> Self {
        self.lab_slug = Some(lab_slug.into());
        self
    }

    /// Sets the client tag sent to the server.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn lab_slug(&self) -> Option<&str> {
        self.lab_slug.as_deref()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// `wss` on the TLS port, `ws` everywhere else.
    pub fn scheme(&self) -> &'static str {
        if self.port == TLS_PORT {
            "wss"
        } else {
            "ws"
        }
    }

    /// Socket URL: `<scheme>://<host>:<port>/<base_path>`.
    pub fn socket_url(&self) -> String {
        format!(
            "{}://{}:{}/{}",
            self.scheme(),
            self.host,
            self.port,
            self.base_path.trim_start_matches('/')
        )
    }

    /// Channel topic: `session:<username>:<slug>`.
    ///
    /// An explicit lab wins; otherwise `open_on_home` picks between the home
    /// and temporary workspaces.
    pub fn channel_name(&self, open_on_home: bool) -> String {
        let slug = match self.lab_slug.as_deref() {
            Some(slug) if !slug.is_empty() => slug,
            _ if open_on_home => HOME_SLUG,
            _ => TEMPORARY_SLUG,
        };
        format!("session:{}:{}", self.username, slug)
    }

    /// Token and client tag, sent with the socket connection and each join.
    pub fn join_params(&self) -> JoinParams {
        JoinParams {
            token: self.auth_token.clone(),
            client: self.client_id.clone(),
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("base_path", &self.base_path)
            .field("auth_token", &"<redacted>")
            .field("username", &self.username)
            .field("lab_slug", &self.lab_slug)
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Host-side preferences, read each time a channel name is computed.
///
/// Shared between the host and the session so a change made before a reset
/// applies to the next join.
#[derive(Debug)]
pub struct Preferences {
    open_on_home: AtomicBool,
}

impl Preferences {
    pub fn new(open_on_home: bool) -> Self {
        Self {
            open_on_home: AtomicBool::new(open_on_home),
        }
    }

    pub fn open_on_home(&self) -> bool {
        self.open_on_home.load(Ordering::Relaxed)
    }

    pub fn set_open_on_home(&self, open_on_home: bool) {
        self.open_on_home.store(open_on_home, Ordering::Relaxed);
    }
}

impl Default for Preferences {
    fn default() -> Self {
        Self::new(true)
    }
}
