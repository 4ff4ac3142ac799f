//! Web session consumers.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use keeper_session::{TokenSink, WebSessionToken};
use tracing::{info, warn};

/// Holds the latest web session cookies for one downstream consumer
#[derive(Debug)]
pub struct CookieJar {
    name: String,
    current: RwLock<Option<(WebSessionToken, DateTime<Utc>)>>,
}

impl CookieJar {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            current: RwLock::new(None),
        }
    }

    /// Session id and refresh time of the token in use, if any
    pub fn current(&self) -> Option<(String, DateTime<Utc>)> {
        self.current
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(|(t, at)| (t.session_id.clone(), *at)))
    }
}

impl TokenSink for CookieJar {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply_token(&self, token: &WebSessionToken) {
        match self.current.write() {
            Ok(mut guard) => {
                *guard = Some((token.clone(), Utc::now()));
                info!(sink = %self.name, cookies = token.cookies.len(), "Web session cookies updated");
            }
            Err(_) => warn!(sink = %self.name, "Cookie jar lock poisoned; token not applied"),
        }
    }
}
