//! Session storage: opaque token -> user id, with per-key expiry.
//!
//! Expiry is enforced by the store itself. An expired token is invisible to
//! every operation and is evicted the first time it is touched; a sweeper
//! thread can additionally purge tokens nobody touches again.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use rand::RngCore;
use tracing::{debug, info};

/// Random bytes per token (256 bits).
const TOKEN_BYTES: usize = 32;

/// What the request dispatcher needs from session storage.
pub trait SessionStore: Send + Sync {
    /// Start a session for `user_id` that expires after `ttl` unless refreshed.
    fn create(&self, user_id: i64, ttl: Duration) -> Result<String>;

    /// User id bound to a live token.
    fn get(&self, token: &str) -> Result<Option<i64>>;

    fn exists(&self, token: &str) -> Result<bool>;

    /// Reset the expiry of a live token to `ttl` from now. Errors if the
    /// token is absent or expired.
    fn refresh(&self, token: &str, ttl: Duration) -> Result<()>;

    /// Remove a token. Removing an absent token succeeds.
    fn delete(&self, token: &str) -> Result<()>;
}

/// Source of "now" for expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to. For tests of expiry behaviour.
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct SessionEntry {
    user_id: i64,
    created_at: Instant,
    expires_at: Instant,
}

/// Process-local session store.
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    clock: Arc<dyn Clock>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Drop every expired token. Returns how many were removed.
    pub fn purge_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut sessions = self.lock()?;
        let before = sessions.len();
        sessions.retain(|_, entry| entry.expires_at > now);
        Ok(before - sessions.len())
    }

    /// Number of stored tokens, expired-but-not-yet-evicted ones included.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `purge_expired` every `interval` on a background thread. The
    /// thread exits once the last strong reference to the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> io::Result<JoinHandle<()>> {
        let store: Weak<Self> = Arc::downgrade(self);
        std::thread::Builder::new()
            .name("session-sweeper".into())
            .spawn(move || {
                loop {
                    std::thread::sleep(interval);
                    let Some(store) = store.upgrade() else {
                        break;
                    };
                    match store.purge_expired() {
                        Ok(0) => {}
                        Ok(count) => info!("Session sweep: purged {} expired sessions", count),
                        Err(e) => tracing::warn!("Session sweep error: {}", e),
                    }
                }
            })
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, SessionEntry>>> {
        self.sessions
            .lock()
            .map_err(|e| anyhow!("Session lock poisoned: {}", e))
    }

    /// Live entry for `token`, evicting it if it has expired.
    fn live<'a>(
        sessions: &'a mut HashMap<String, SessionEntry>,
        token: &str,
        now: Instant,
    ) -> Option<&'a mut SessionEntry> {
        let expired = sessions.get(token)?.expires_at <= now;
        if expired {
            sessions.remove(token);
            return None;
        }
        sessions.get_mut(token)
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for InMemorySessionStore {
    fn create(&self, user_id: i64, ttl: Duration) -> Result<String> {
        let now = self.clock.now();
        let expires_at = expiry(now, ttl)?;
        let mut sessions = self.lock()?;
        let token = loop {
            let candidate = generate_token();
            if !sessions.contains_key(&candidate) {
                break candidate;
            }
        };
        sessions.insert(
            token.clone(),
            SessionEntry {
                user_id,
                created_at: now,
                expires_at,
            },
        );
        debug!(user_id, ttl_secs = ttl.as_secs(), "session created");
        Ok(token)
    }

    fn get(&self, token: &str) -> Result<Option<i64>> {
        let now = self.clock.now();
        let mut sessions = self.lock()?;
        Ok(Self::live(&mut sessions, token, now).map(|entry| entry.user_id))
    }

    fn exists(&self, token: &str) -> Result<bool> {
        Ok(self.get(token)?.is_some())
    }

    fn refresh(&self, token: &str, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let expires_at = expiry(now, ttl)?;
        let mut sessions = self.lock()?;
        match Self::live(&mut sessions, token, now) {
            Some(entry) => {
                entry.expires_at = expires_at;
                Ok(())
            }
            None => bail!("Session not found"),
        }
    }

    fn delete(&self, token: &str) -> Result<()> {
        let now = self.clock.now();
        if let Some(entry) = self.lock()?.remove(token) {
            debug!(
                user_id = entry.user_id,
                age_secs = now.saturating_duration_since(entry.created_at).as_secs(),
                "session deleted"
            );
        }
        Ok(())
    }
}

// Call before `lock()`: a panic under the guard would poison the map.
fn expiry(now: Instant, ttl: Duration) -> Result<Instant> {
    now.checked_add(ttl)
        .ok_or_else(|| anyhow!("Session TTL {:?} is out of range", ttl))
}

/// 256 random bits from the OS-seeded thread RNG, URL-safe base64.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    B64.encode(bytes)
}
