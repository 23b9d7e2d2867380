//! OTP code store.
//!
//! Redis key patterns:
//! - `otp:{subject_id}`: list of OTP records (JSON), newest first, capped history
//! - `otp_used:{record_id}`: one-shot consumed flag (`SET NX`)
//!
//! A subject may hold several codes (one per resend). Old codes are never
//! deleted early; they lose eligibility because only the newest unconsumed,
//! unexpired code is ever compared with a submission.

use super::{from_json, millis_until, to_json, StorageError};
use crate::error::InvalidReason;
use crate::models::OtpRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use subtle::ConstantTimeEq;

/// Codes kept per subject in Redis.
const MAX_HISTORY: isize = 16;

/// Outcome of matching a submitted code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtpMatch {
    /// The record that matched, now marked consumed.
    Matched(OtpRecord),
    Rejected(InvalidReason),
}

#[async_trait]
pub trait OtpStore: Send + Sync {
    async fn insert(&self, record: OtpRecord) -> Result<(), StorageError>;

    /// Match `code` against the subject's newest eligible record and mark it
    /// consumed in the same step. Of two racing matches on one record, only
    /// one wins.
    async fn consume_match(
        &self,
        subject_id: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<OtpMatch, StorageError>;

    /// Drop records past their own expiry, returning the count.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError>;
}

/// Pick the record a submission is compared with.
///
/// `newest_first` must be ordered by creation, newest at index 0.
fn select_eligible(
    newest_first: &[OtpRecord],
    code: &str,
    now: DateTime<Utc>,
) -> Result<usize, InvalidReason> {
    match newest_first.iter().position(|r| r.is_eligible(now)) {
        Some(idx) if codes_equal(&newest_first[idx].code, code) => Ok(idx),
        Some(_) => Err(InvalidReason::WrongCode),
        None => match newest_first.first() {
            None => Err(InvalidReason::NoCode),
            Some(newest) if newest.consumed => Err(InvalidReason::CodeConsumed),
            Some(_) => Err(InvalidReason::CodeExpired),
        },
    }
}

/// Compare without short-circuiting on the first differing byte.
fn codes_equal(a: &str, b: &str) -> bool {
    bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryOtpStore {
    // subject_id -> records, newest first
    records: Mutex<HashMap<String, Vec<OtpRecord>>>,
}

impl MemoryOtpStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records held for a subject, newest first.
    pub fn records_for(&self, subject_id: &str) -> Vec<OtpRecord> {
        self.records().get(subject_id).cloned().unwrap_or_default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, Vec<OtpRecord>>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl OtpStore for MemoryOtpStore {
    async fn insert(&self, record: OtpRecord) -> Result<(), StorageError> {
        self.records()
            .entry(record.subject_id.clone())
            .or_default()
            .insert(0, record);
        Ok(())
    }

    async fn consume_match(
        &self,
        subject_id: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<OtpMatch, StorageError> {
        let mut records = self.records();
        let Some(history) = records.get_mut(subject_id) else {
            return Ok(OtpMatch::Rejected(InvalidReason::NoCode));
        };

        match select_eligible(history, code, now) {
            Ok(idx) => {
                history[idx].consumed = true;
                Ok(OtpMatch::Matched(history[idx].clone()))
            }
            Err(reason) => Ok(OtpMatch::Rejected(reason)),
        }
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut records = self.records();
        let mut removed = 0;
        records.retain(|_, history| {
            let before = history.len();
            history.retain(|r| !r.is_expired(now));
            removed += before - history.len();
            !history.is_empty()
        });
        Ok(removed)
    }
}

// ============================================================================
// Redis
// ============================================================================

#[derive(Clone)]
pub struct RedisOtpStore {
    con: MultiplexedConnection,
}

impl RedisOtpStore {
    pub fn new(con: MultiplexedConnection) -> Self {
        Self { con }
    }

    fn list_key(subject_id: &str) -> String {
        format!("otp:{}", subject_id)
    }

    fn used_key(record_id: &str) -> String {
        format!("otp_used:{}", record_id)
    }
}

#[async_trait]
impl OtpStore for RedisOtpStore {
    async fn insert(&self, record: OtpRecord) -> Result<(), StorageError> {
        let mut con = self.con.clone();
        let key = Self::list_key(&record.subject_id);
        let json = to_json(&record)?;

        // The list lives as long as its newest code
        let ttl_ms = millis_until(record.expires_at, record.created_at);

        let _: () = redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(&key)
            .arg(json)
            .ignore()
            .cmd("LTRIM")
            .arg(&key)
            .arg(0)
            .arg(MAX_HISTORY - 1)
            .ignore()
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(ttl_ms)
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(())
    }

    async fn consume_match(
        &self,
        subject_id: &str,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<OtpMatch, StorageError> {
        let mut con = self.con.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(Self::list_key(subject_id))
            .arg(0)
            .arg(-1)
            .query_async(&mut con)
            .await?;

        if raw.is_empty() {
            return Ok(OtpMatch::Rejected(InvalidReason::NoCode));
        }

        let mut history = raw
            .into_iter()
            .map(from_json::<OtpRecord>)
            .collect::<Result<Vec<_>, _>>()?;

        let used_keys: Vec<String> = history.iter().map(|r| Self::used_key(&r.id)).collect();
        let used: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&used_keys)
            .query_async(&mut con)
            .await?;
        for (record, flag) in history.iter_mut().zip(used) {
            record.consumed = flag.is_some();
        }

        let idx = match select_eligible(&history, code, now) {
            Ok(idx) => idx,
            Err(reason) => return Ok(OtpMatch::Rejected(reason)),
        };

        // The consumed flag is the single point of arbitration between racers
        let mut record = history.swap_remove(idx);
        let claimed: Option<String> = redis::cmd("SET")
            .arg(Self::used_key(&record.id))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(millis_until(record.expires_at, now))
            .query_async(&mut con)
            .await?;

        if claimed.is_none() {
            return Ok(OtpMatch::Rejected(InvalidReason::CodeConsumed));
        }
        record.consumed = true;
        Ok(OtpMatch::Matched(record))
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize, StorageError> {
        // List and flag keys carry their own TTLs
        Ok(0)
    }
}
