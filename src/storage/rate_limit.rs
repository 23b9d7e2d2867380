//! Fixed-window request counters.
//!
//! Redis key pattern:
//! - `ratelimit:{key}`: request count (INTEGER), PX TTL = window length
//!
//! The first request for a key opens a window; requests past `max` inside
//! it are refused. With Redis the budget is shared by every instance.

use super::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Count one request for `key`. Returns `false` when over `max`.
    async fn hit(
        &self,
        key: &str,
        max: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError>;

    /// Drop windows that have closed, returning the count.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Window {
    resets_at: DateTime<Utc>,
    count: u32,
}

#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.windows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn windows(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        max: u32,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut windows = self.windows();
        let entry = windows.entry(key.to_string()).or_insert(Window {
            resets_at: now + window,
            count: 0,
        });

        if now >= entry.resets_at {
            *entry = Window {
                resets_at: now + window,
                count: 0,
            };
        }

        entry.count = entry.count.saturating_add(1);
        Ok(entry.count <= max)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut windows = self.windows();
        let before = windows.len();
        windows.retain(|_, w| now < w.resets_at);
        Ok(before - windows.len())
    }
}

// ============================================================================
// Redis
// ============================================================================

#[derive(Clone)]
pub struct RedisRateLimitStore {
    con: MultiplexedConnection,
}

impl RedisRateLimitStore {
    pub fn new(con: MultiplexedConnection) -> Self {
        Self { con }
    }

    fn key(key: &str) -> String {
        format!("ratelimit:{}", key)
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn hit(
        &self,
        key: &str,
        max: u32,
        window: Duration,
        _now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let mut con = self.con.clone();
        let key = Self::key(key);

        let count: u32 = con.incr(&key, 1).await?;

        // Window starts with the first request
        if count == 1 {
            con.pexpire::<_, ()>(&key, window.num_milliseconds().max(1))
                .await?;
        }

        Ok(count <= max)
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, StorageError> {
        Ok(0)
    }
}
