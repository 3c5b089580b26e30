//! Session store
//!
//! Sessions carry everything the front door remembers about a browser:
//! the pending OAuth2 state, the delegated access token and the proxy
//! request memory. They live only in process memory; a restart forces
//! every user through the authorization flow again.

use dashmap::DashMap;
use hyper::header::{HeaderMap, HeaderValue, COOKIE};
use rand::RngCore;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::proxy::ProxyRequestMemory;

/// Per-browser state
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub id: String,
    /// State issued with the last authorization redirect, consumed on callback
    pub oauth2_state: Option<String>,
    /// Access token delegated by the user; never refreshed
    pub access_token: Option<String>,
    pub proxy_memory: ProxyRequestMemory,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

/// Storage backend for sessions
///
/// Loads return a copy; changes become visible to other requests only once
/// saved. Concurrent requests of the same session may overwrite each
/// other's changes, which is acceptable for this best-effort data.
pub trait SessionStore: Send + Sync {
    fn load(&self, id: &str) -> Option<Session>;
    fn save(&self, session: Session);
    fn remove(&self, id: &str);
}

/// Sessions unused for this long are dropped
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound on stored sessions; the least recently used go first
pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

#[derive(Debug)]
struct StoredSession {
    session: Session,
    last_seen: Instant,
}

/// In-process session store for single-process deployments
///
/// Idle sessions expire on load and are swept whenever a save pushes the
/// store past its capacity.
#[derive(Debug)]
pub struct MemorySessionStore {
    sessions: DashMap<String, StoredSession>,
    idle_timeout: Duration,
    max_sessions: usize,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::with_limits(DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_SESSIONS)
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(idle_timeout: Duration, max_sessions: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
            max_sessions: max_sessions.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn sweep(&self) {
        let before = self.sessions.len();
        let idle_timeout = self.idle_timeout;
        self.sessions
            .retain(|_, stored| stored.last_seen.elapsed() < idle_timeout);

        let excess = self.sessions.len().saturating_sub(self.max_sessions);
        if excess > 0 {
            let mut by_age: Vec<(Instant, String)> = self
                .sessions
                .iter()
                .map(|entry| (entry.last_seen, entry.key().clone()))
                .collect();
            by_age.sort_unstable();
            for (_, id) in by_age.into_iter().take(excess) {
                self.sessions.remove(&id);
            }
        }
        debug!(
            before,
            after = self.sessions.len(),
            "Swept session store"
        );
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, id: &str) -> Option<Session> {
        let mut stored = self.sessions.get_mut(id)?;
        if stored.last_seen.elapsed() >= self.idle_timeout {
            drop(stored);
            self.sessions.remove(id);
            return None;
        }
        stored.last_seen = Instant::now();
        Some(stored.session.clone())
    }

    fn save(&self, session: Session) {
        self.sessions.insert(
            session.id.clone(),
            StoredSession {
                session,
                last_seen: Instant::now(),
            },
        );
        if self.sessions.len() > self.max_sessions {
            self.sweep();
        }
    }

    fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }
}

/// Random session id (24 bytes, hex)
pub fn new_session_id() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Read a cookie value from the request headers
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

/// Find the request's session or start a new one
///
/// Returns the session and, for new sessions, the `Set-Cookie` value to send.
/// New sessions are not stored; callers save them once there is something
/// to remember.
pub fn resolve_session(
    store: &dyn SessionStore,
    headers: &HeaderMap,
    cookie_name: &str,
    secure: bool,
) -> (Session, Option<HeaderValue>) {
    if let Some(session) = cookie_value(headers, cookie_name).and_then(|id| store.load(&id)) {
        return (session, None);
    }

    let session = Session::new(new_session_id());

    let mut cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", cookie_name, session.id);
    if secure {
        cookie.push_str("; Secure");
    }
    let header = HeaderValue::from_str(&cookie).ok();
    (session, header)
}
