//! In-memory custody of unlocked data keys.
//!
//! One table per process. Each session owns a DEK and expires on idle
//! timeout (sliding) or absolute lifetime, whichever comes first. Every
//! accessor sweeps expired sessions first; an evicted session's key is
//! zeroed while the table lock is still held, before its memory is freed.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::debug;
use zeroize::{Zeroize, Zeroizing};

use crate::cipher::KeyBytes;
use crate::clock::{Clock, SystemClock};

pub const TOKEN_BYTES: usize = 32;
pub const DEFAULT_ABSOLUTE_LIFETIME_MS: u64 = 24 * 60 * 60 * 1000;

/// Opaque bearer token handed to the transport layer (usually a cookie).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; TOKEN_BYTES]);
        rand::rngs::OsRng.fill_bytes(&mut bytes[..]);
        Self(general_purpose::URL_SAFE_NO_PAD.encode(&bytes[..]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short non-reversible tag, safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.0.as_bytes())[..4])
    }
}

impl From<String> for SessionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionToken({})", self.fingerprint())
    }
}

/// Snapshot returned by [`SessionManager::get`]. `dek` is a private copy;
/// wiping or mutating it never touches the live session.
pub struct Session {
    pub token: SessionToken,
    pub dek: KeyBytes,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub idle_timeout_ms: u64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("created_at", &self.created_at)
            .field("last_accessed_at", &self.last_accessed_at)
            .field("idle_timeout_ms", &self.idle_timeout_ms)
            .finish_non_exhaustive()
    }
}

struct SessionEntry {
    dek: KeyBytes,
    created_at: DateTime<Utc>,
    last_accessed_at: DateTime<Utc>,
    idle_timeout_ms: u64,
}

impl SessionEntry {
    fn is_live(&self, now: DateTime<Utc>, absolute_lifetime: Duration) -> bool {
        let idle = Duration::milliseconds(i64::try_from(self.idle_timeout_ms).unwrap_or(i64::MAX));
        now - self.last_accessed_at <= idle && now - self.created_at <= absolute_lifetime
    }

    fn retire(&mut self) {
        self.dek.zeroize();
    }
}

pub struct SessionManager {
    table: Mutex<HashMap<SessionToken, SessionEntry>>,
    clock: Arc<dyn Clock>,
    absolute_lifetime_ms: AtomicU64,
}

impl SessionManager {
    pub fn new(clock: Arc<dyn Clock>, absolute_lifetime_ms: u64) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            clock,
            absolute_lifetime_ms: AtomicU64::new(absolute_lifetime_ms),
        }
    }

    /// Change the absolute lifetime. Applies to existing sessions at the
    /// next sweep.
    pub fn set_absolute_lifetime_ms(&self, absolute_lifetime_ms: u64) {
        self.absolute_lifetime_ms
            .store(absolute_lifetime_ms, Ordering::SeqCst);
    }

    fn absolute_lifetime(&self) -> Duration {
        let ms = self.absolute_lifetime_ms.load(Ordering::SeqCst);
        Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
    }

    /// The process-wide session table.
    pub fn global() -> Arc<SessionManager> {
        static GLOBAL: OnceLock<Arc<SessionManager>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| {
                Arc::new(SessionManager::new(
                    Arc::new(SystemClock),
                    DEFAULT_ABSOLUTE_LIFETIME_MS,
                ))
            })
            .clone()
    }

    /// Remove expired sessions, zeroing their keys. Returns the retired
    /// entries so the caller decides when the (already zeroed) memory goes.
    fn sweep(&self, table: &mut HashMap<SessionToken, SessionEntry>) -> Vec<SessionEntry> {
        let now = self.clock.now();
        let absolute_lifetime = self.absolute_lifetime();
        let expired: Vec<SessionToken> = table
            .iter()
            .filter(|(_, entry)| !entry.is_live(now, absolute_lifetime))
            .map(|(token, _)| token.clone())
            .collect();
        let mut retired = Vec::with_capacity(expired.len());
        for token in expired {
            if let Some(mut entry) = table.remove(&token) {
                entry.retire();
                debug!(session = %token.fingerprint(), "session expired");
                retired.push(entry);
            }
        }
        retired
    }

    /// Take custody of `dek` and return a fresh token for it.
    pub fn create(&self, dek: KeyBytes, idle_timeout_ms: u64) -> SessionToken {
        let now = self.clock.now();
        let mut table = self.table.lock();
        self.sweep(&mut table);
        let mut token = SessionToken::generate();
        while table.contains_key(&token) {
            token = SessionToken::generate();
        }
        table.insert(
            token.clone(),
            SessionEntry {
                dek,
                created_at: now,
                last_accessed_at: now,
                idle_timeout_ms,
            },
        );
        debug!(session = %token.fingerprint(), idle_timeout_ms, "session created");
        token
    }

    /// Look up a live session, sliding its idle window forward.
    pub fn get(&self, token: &SessionToken) -> Option<Session> {
        let now = self.clock.now();
        let mut table = self.table.lock();
        self.sweep(&mut table);
        let entry = table.get_mut(token)?;
        entry.last_accessed_at = now;
        Some(Session {
            token: token.clone(),
            dek: Zeroizing::new(*entry.dek),
            created_at: entry.created_at,
            last_accessed_at: entry.last_accessed_at,
            idle_timeout_ms: entry.idle_timeout_ms,
        })
    }

    /// Liveness check that does not refresh the idle window.
    pub fn contains(&self, token: &SessionToken) -> bool {
        let mut table = self.table.lock();
        self.sweep(&mut table);
        table.contains_key(token)
    }

    pub fn destroy(&self, token: &SessionToken) -> bool {
        let mut table = self.table.lock();
        self.sweep(&mut table);
        match table.remove(token) {
            Some(mut entry) => {
                entry.retire();
                debug!(session = %token.fingerprint(), "session destroyed");
                true
            }
            None => false,
        }
    }

    pub fn update_idle_timeout(&self, token: &SessionToken, idle_timeout_ms: u64) -> bool {
        let mut table = self.table.lock();
        self.sweep(&mut table);
        match table.get_mut(token) {
            Some(entry) => {
                entry.idle_timeout_ms = idle_timeout_ms;
                true
            }
            None => false,
        }
    }

    /// Destroy every session (restore, shutdown).
    pub fn destroy_all(&self) -> usize {
        let mut table = self.table.lock();
        let count = table.len();
        for (_, mut entry) in table.drain() {
            entry.retire();
        }
        count
    }

    pub fn len(&self) -> usize {
        let mut table = self.table.lock();
        self.sweep(&mut table);
        table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
