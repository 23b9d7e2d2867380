//! Storage layer for challenge sessions, OTP codes, revoked tokens, identities
//! and rate-limit counters.
//!
//! Each store is a trait with two implementations: a process-local map
//! (default) and Redis. Callers hold `Arc<dyn Store>` and never know which.
//! Redis values are JSON.

pub mod challenge;
pub mod identity;
pub mod otp;
pub mod rate_limit;
pub mod revocation;

pub use challenge::{ChallengeStore, MemoryChallengeStore, RedisChallengeStore, SessionLookup};
pub use identity::{IdentityStore, MemoryIdentityStore, RedisIdentityStore};
pub use otp::{MemoryOtpStore, OtpMatch, OtpStore, RedisOtpStore};
pub use rate_limit::{MemoryRateLimitStore, RateLimitStore, RedisRateLimitStore};
pub use revocation::{MemoryRevocationStore, RedisRevocationStore, RevocationStore};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use zeroize::Zeroizing;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One handle per store, shared by the orchestrator and the sweeper.
#[derive(Clone)]
pub struct Stores {
    pub challenges: Arc<dyn ChallengeStore>,
    pub otps: Arc<dyn OtpStore>,
    pub revocations: Arc<dyn RevocationStore>,
    pub identities: Arc<dyn IdentityStore>,
    pub rate_limits: Arc<dyn RateLimitStore>,
}

impl Stores {
    /// Process-local stores. State is lost on restart.
    pub fn in_memory() -> Self {
        Self {
            challenges: Arc::new(MemoryChallengeStore::new()),
            otps: Arc::new(MemoryOtpStore::new()),
            revocations: Arc::new(MemoryRevocationStore::new()),
            identities: Arc::new(MemoryIdentityStore::new()),
            rate_limits: Arc::new(MemoryRateLimitStore::new()),
        }
    }

    /// Redis-backed stores sharing one multiplexed connection.
    pub async fn redis(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url)?;
        let con = client.get_multiplexed_async_connection().await?;

        Ok(Self {
            challenges: Arc::new(RedisChallengeStore::new(con.clone())),
            otps: Arc::new(RedisOtpStore::new(con.clone())),
            revocations: Arc::new(RedisRevocationStore::new(con.clone())),
            identities: Arc::new(RedisIdentityStore::new(con.clone())),
            rate_limits: Arc::new(RedisRateLimitStore::new(con)),
        })
    }
}

/// Milliseconds from `now` until `expires_at`, at least 1 (Redis rejects PX 0).
pub(crate) fn millis_until(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (expires_at - now).num_milliseconds().max(1) as u64
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, StorageError> {
    Ok(serde_json::to_string(value)?)
}

/// Deserialize a stored value, zeroizing the raw JSON afterwards.
pub(crate) fn from_json<T: DeserializeOwned>(raw: String) -> Result<T, StorageError> {
    let raw = Zeroizing::new(raw);
    Ok(serde_json::from_str(&raw)?)
}
