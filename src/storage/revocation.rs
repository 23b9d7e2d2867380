//! Revoked token registry.
//!
//! Redis key pattern:
//! - `revoked:{token}`: marker, PX TTL = remaining lifetime of the token
//!
//! An entry is only kept until the token's own expiry. Past that point the
//! credential issuer rejects the token on expiry alone, so dropping the entry
//! never makes a revoked token valid again.

use super::{millis_until, StorageError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Record `token` as revoked until `expires_at`. Already-expired tokens
    /// are not recorded.
    async fn revoke(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    async fn is_revoked(&self, token: &str) -> Result<bool, StorageError>;

    /// Drop entries whose token has expired, returning the count.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryRevocationStore {
    revoked: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.revoked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn revoked(&self) -> MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        self.revoked.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn revoke(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if expires_at <= now {
            return Ok(());
        }
        self.revoked().insert(token.to_string(), expires_at);
        Ok(())
    }

    async fn is_revoked(&self, token: &str) -> Result<bool, StorageError> {
        Ok(self.revoked().contains_key(token))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut revoked = self.revoked();
        let before = revoked.len();
        revoked.retain(|_, expires_at| *expires_at > now);
        Ok(before - revoked.len())
    }
}

// ============================================================================
// Redis
// ============================================================================

#[derive(Clone)]
pub struct RedisRevocationStore {
    con: MultiplexedConnection,
}

impl RedisRevocationStore {
    pub fn new(con: MultiplexedConnection) -> Self {
        Self { con }
    }

    fn key(token: &str) -> String {
        format!("revoked:{}", token)
    }
}

#[async_trait]
impl RevocationStore for RedisRevocationStore {
    async fn revoke(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        if expires_at <= now {
            return Ok(());
        }
        let mut con = self.con.clone();
        let _: () = redis::cmd("SET")
            .arg(Self::key(token))
            .arg(1)
            .arg("PX")
            .arg(millis_until(expires_at, now))
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn is_revoked(&self, token: &str) -> Result<bool, StorageError> {
        let mut con = self.con.clone();
        let exists: bool = con.exists(Self::key(token)).await?;
        Ok(exists)
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, StorageError> {
        Ok(0)
    }
}
