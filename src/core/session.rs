use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Per-client state carried across requests
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Set once the client has completed the proof-of-work challenge
    pub authorized: bool,
    /// Rate-limit accounting merged in by the rate limiter
    pub rate_limit: Option<RateLimitDelta>,
}

impl Session {
    /// A session that already passed the challenge
    pub fn authorized() -> Self {
        Self {
            authorized: true,
            rate_limit: None,
        }
    }

    /// Apply the rate limiter's result, leaving `authorized` untouched
    pub fn with_rate_limit(self, delta: RateLimitDelta) -> Self {
        Self {
            rate_limit: Some(delta),
            ..self
        }
    }

    /// Whether the last rate-limit check reported the quota as exceeded
    pub fn is_rate_limited(&self) -> bool {
        self.rate_limit.as_ref().map(|r| r.limited).unwrap_or(false)
    }
}

/// Rate-limit accounting produced by one unit of consumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitDelta {
    /// Start of the current accounting window
    pub window_start: DateTime<Utc>,
    /// Requests seen in the window, including this one
    pub count: u32,
    /// Quota exceeded for this request
    pub limited: bool,
    /// Seconds until the client may send again, when limited
    pub retry_after_secs: Option<u64>,
}

#[derive(Debug)]
struct SessionEntry {
    session: Session,
    last_seen: Instant,
}

/// Sessions kept when no explicit cap is configured
pub const DEFAULT_MAX_SESSIONS: usize = 100_000;

/// In-memory session registry keyed by the session cookie
pub struct SessionStore {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    idle_timeout: Duration,
    max_sessions: usize,
}

/// A session loaded for one request
#[derive(Debug, Clone)]
pub struct LoadedSession {
    pub id: String,
    pub session: Session,
    /// The id was minted for this request and must be sent to the client
    pub is_new: bool,
}

impl SessionStore {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    /// Cap the number of live sessions
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Look up the session for a cookie value, minting a fresh one when unknown or idle
    pub async fn load(&self, id: Option<&str>) -> LoadedSession {
        if let Some(id) = id {
            let sessions = self.sessions.read().await;
            if let Some(entry) = sessions.get(id) {
                if entry.last_seen.elapsed() <= self.idle_timeout {
                    return LoadedSession {
                        id: id.to_string(),
                        session: entry.session.clone(),
                        is_new: false,
                    };
                }
            }
        }

        LoadedSession {
            id: Uuid::new_v4().to_string(),
            session: Session::default(),
            is_new: true,
        }
    }

    /// Store the session state returned by the pipeline.
    ///
    /// `authorized` is sticky: a concurrent authorization is never overwritten
    /// by a stale copy. A new id is refused once the store is full and no
    /// idle session can make room; returns whether the state was kept.
    pub async fn store(&self, id: &str, session: Session) -> bool {
        let mut sessions = self.sessions.write().await;
        if !sessions.contains_key(id) && sessions.len() >= self.max_sessions {
            sessions.retain(|_, entry| entry.last_seen.elapsed() <= self.idle_timeout);
            if sessions.len() >= self.max_sessions {
                tracing::warn!(max_sessions = self.max_sessions, "session store full");
                return false;
            }
        }

        let entry = sessions.entry(id.to_string()).or_insert_with(|| SessionEntry {
            session: Session::default(),
            last_seen: Instant::now(),
        });
        let authorized = entry.session.authorized || session.authorized;
        entry.session = Session {
            authorized,
            ..session
        };
        entry.last_seen = Instant::now();
        true
    }

    /// Mark a session as having completed the challenge. Returns false for unknown ids.
    pub async fn authorize(&self, id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(entry) => {
                entry.session.authorized = true;
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).map(|e| e.session.clone())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drop sessions idle longer than the timeout; returns how many were removed
    pub async fn cleanup_expired(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.last_seen.elapsed() <= self.idle_timeout);
        before - sessions.len()
    }
}
