//! Session credentials for the device channel
//!
//! The session is replaced wholesale on re-authentication and cleared
//! wholesale on disconnect. Persistence of credentials lives elsewhere;
//! `SessionStore` only holds the current value in memory.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::RwLock;

use crate::types::Envelope;

/// Credentials and target of one authenticated device
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub auth_token: String,
    pub device_id: String,
    pub device_name: Option<String>,
    /// Base HTTP(S) URL of the control server
    pub server_url: String,
}

impl Session {
    pub fn new(
        auth_token: impl Into<String>,
        device_id: impl Into<String>,
        device_name: Option<String>,
        server_url: impl Into<String>,
    ) -> Self {
        Self {
            auth_token: auth_token.into(),
            device_id: device_id.into(),
            device_name,
            server_url: server_url.into(),
        }
    }

    /// Token and device id are both present
    pub fn has_credentials(&self) -> bool {
        !self.auth_token.is_empty() && !self.device_id.is_empty()
    }

    /// Channel topic for this device
    pub fn topic(&self) -> String {
        Envelope::device_topic(&self.device_id)
    }
}

// Keep the token out of logs
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("auth_token", &"<redacted>")
            .field("device_id", &self.device_id)
            .field("device_name", &self.device_name)
            .field("server_url", &self.server_url)
            .finish()
    }
}

/// Source of the current session
pub trait SessionProvider: Send + Sync {
    /// Snapshot of the current session, if any
    fn current(&self) -> Option<Session>;

    /// Whether valid credentials exist right now
    fn has_credentials(&self) -> bool {
        self.current().map(|s| s.has_credentials()).unwrap_or(false)
    }
}

/// In-memory session holder
#[derive(Default)]
pub struct SessionStore {
    session: RwLock<Option<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create store seeded with a session
    pub fn with_session(session: Session) -> Self {
        Self {
            session: RwLock::new(Some(session)),
        }
    }

    /// Replace the session wholesale
    pub fn set(&self, session: Session) {
        if let Ok(mut guard) = self.session.write() {
            *guard = Some(session);
        }
    }

    /// Drop the session wholesale
    pub fn clear(&self) {
        if let Ok(mut guard) = self.session.write() {
            *guard = None;
        }
    }
}

impl SessionProvider for SessionStore {
    fn current(&self) -> Option<Session> {
        self.session.read().ok().and_then(|guard| guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("tok", "17", Some("Front desk".into()), "http://localhost:4001")
    }

    #[test]
    fn test_store_set_and_clear() {
        let store = SessionStore::new();
        assert!(!store.has_credentials());

        store.set(session());
        assert!(store.has_credentials());
        assert_eq!(store.current().unwrap().topic(), "device:17");

        store.clear();
        assert!(store.current().is_none());
        assert!(!store.has_credentials());
    }

    #[test]
    fn test_empty_token_is_not_credentials() {
        let store = SessionStore::with_session(Session::new("", "17", None, "http://x"));
        assert!(store.current().is_some());
        assert!(!store.has_credentials());
    }

    #[test]
    fn test_debug_redacts_token() {
        let rendered = format!("{:?}", session());
        assert!(!rendered.contains("tok\""));
        assert!(rendered.contains("<redacted>"));
    }
}
