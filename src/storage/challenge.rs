//! Challenge session store.
//!
//! Redis key pattern:
//! - `challenge:{session_id}`: session data (JSON), PX TTL = session TTL
//!
//! Expiry is checked on every read, not only by the sweep: an entry past
//! `expires_at` never comes back as active, swept or not.

use super::{from_json, millis_until, to_json, StorageError};
use crate::auth::session::generate_session_id;
use crate::models::ChallengeSession;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Attempts at allocating a fresh session id before giving up.
const MAX_ID_ATTEMPTS: usize = 3;

/// Result of looking up a session handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLookup {
    Active(ChallengeSession),
    /// Present but past `expires_at`; evicted by the lookup.
    Expired,
    Missing,
}

#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Allocate a unique session id and store a session living `ttl` from `now`.
    async fn create(
        &self,
        subject_id: &str,
        contact_address: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ChallengeSession, StorageError>;

    async fn lookup(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionLookup, StorageError>;

    /// Remove the session. Returns whether it was present; absent is not an error.
    async fn consume(&self, session_id: &str) -> Result<bool, StorageError>;

    /// Remove every session with `expires_at <= now`, returning the count.
    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;
}

fn new_session(
    session_id: String,
    subject_id: &str,
    contact_address: &str,
    now: DateTime<Utc>,
    ttl: Duration,
) -> ChallengeSession {
    ChallengeSession {
        session_id,
        subject_id: subject_id.to_string(),
        contact_address: contact_address.to_string(),
        created_at: now,
        expires_at: now + ttl,
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryChallengeStore {
    sessions: Mutex<HashMap<String, ChallengeSession>>,
}

impl MemoryChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, ChallengeSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ChallengeStore for MemoryChallengeStore {
    async fn create(
        &self,
        subject_id: &str,
        contact_address: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ChallengeSession, StorageError> {
        let mut sessions = self.sessions();
        for _ in 0..MAX_ID_ATTEMPTS {
            if let Entry::Vacant(slot) = sessions.entry(generate_session_id(now)) {
                let session =
                    new_session(slot.key().clone(), subject_id, contact_address, now, ttl);
                slot.insert(session.clone());
                return Ok(session);
            }
        }
        Err(StorageError::Conflict("session id collision".to_string()))
    }

    async fn lookup(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionLookup, StorageError> {
        let mut sessions = self.sessions();
        let expired = match sessions.get(session_id) {
            None => return Ok(SessionLookup::Missing),
            Some(session) => session.is_expired(now),
        };
        if expired {
            sessions.remove(session_id);
            return Ok(SessionLookup::Expired);
        }
        Ok(sessions
            .get(session_id)
            .cloned()
            .map_or(SessionLookup::Missing, SessionLookup::Active))
    }

    async fn consume(&self, session_id: &str) -> Result<bool, StorageError> {
        Ok(self.sessions().remove(session_id).is_some())
    }

    async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut sessions = self.sessions();
        let before = sessions.len();
        sessions.retain(|_, session| !session.is_expired(now));
        Ok(before - sessions.len())
    }
}

// ============================================================================
// Redis
// ============================================================================

#[derive(Clone)]
pub struct RedisChallengeStore {
    con: MultiplexedConnection,
}

impl RedisChallengeStore {
    pub fn new(con: MultiplexedConnection) -> Self {
        Self { con }
    }

    fn key(session_id: &str) -> String {
        format!("challenge:{}", session_id)
    }
}

#[async_trait]
impl ChallengeStore for RedisChallengeStore {
    async fn create(
        &self,
        subject_id: &str,
        contact_address: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ChallengeSession, StorageError> {
        let mut con = self.con.clone();
        for _ in 0..MAX_ID_ATTEMPTS {
            let session = new_session(
                generate_session_id(now),
                subject_id,
                contact_address,
                now,
                ttl,
            );
            let json = to_json(&session)?;

            // NX: never overwrite an existing session under the same id
            let stored: Option<String> = redis::cmd("SET")
                .arg(Self::key(&session.session_id))
                .arg(json)
                .arg("NX")
                .arg("PX")
                .arg(millis_until(session.expires_at, now))
                .query_async(&mut con)
                .await?;

            if stored.is_some() {
                return Ok(session);
            }
        }
        Err(StorageError::Conflict("session id collision".to_string()))
    }

    async fn lookup(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionLookup, StorageError> {
        let mut con = self.con.clone();
        let key = Self::key(session_id);
        let json: Option<String> = con.get(&key).await?;

        let Some(data) = json else {
            return Ok(SessionLookup::Missing);
        };
        let session: ChallengeSession = from_json(data)?;

        // Redis expiry and our clock can disagree by a few ms
        if session.is_expired(now) {
            con.del::<_, ()>(&key).await?;
            return Ok(SessionLookup::Expired);
        }
        Ok(SessionLookup::Active(session))
    }

    async fn consume(&self, session_id: &str) -> Result<bool, StorageError> {
        let mut con = self.con.clone();
        let deleted: i32 = con.del(Self::key(session_id)).await?;
        Ok(deleted > 0)
    }

    async fn sweep(&self, _now: DateTime<Utc>) -> Result<usize, StorageError> {
        // PX TTLs already evict expired sessions
        Ok(0)
    }
}
