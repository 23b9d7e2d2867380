//! Identity store: contact address to subject.
//!
//! Redis key patterns:
//! - `identity:{subject_id}`: identity data (JSON)
//! - `contact:{address}`: contact lookup to subject_id (STRING, `SET NX`)
//!
//! Contact addresses are unique. A second `create` for the same address
//! fails with [`StorageError::Conflict`]; callers re-resolve.

use super::{from_json, to_json, StorageError};
use crate::models::Identity;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_by_contact(&self, contact_address: &str)
        -> Result<Option<Identity>, StorageError>;

    async fn create(
        &self,
        contact_address: &str,
        now: DateTime<Utc>,
    ) -> Result<Identity, StorageError>;

    async fn mark_verified(&self, subject_id: &str) -> Result<(), StorageError>;
}

fn new_identity(contact_address: &str, now: DateTime<Utc>) -> Identity {
    Identity {
        id: nanoid::nanoid!(12),
        contact_address: contact_address.to_string(),
        verified: false,
        created_at: now,
    }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Default)]
struct IdentityMaps {
    by_id: HashMap<String, Identity>,
    by_contact: HashMap<String, String>,
}

#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    maps: Mutex<IdentityMaps>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, subject_id: &str) -> Option<Identity> {
        self.maps().by_id.get(subject_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.maps().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn maps(&self) -> MutexGuard<'_, IdentityMaps> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_by_contact(
        &self,
        contact_address: &str,
    ) -> Result<Option<Identity>, StorageError> {
        let maps = self.maps();
        Ok(maps
            .by_contact
            .get(contact_address)
            .and_then(|id| maps.by_id.get(id))
            .cloned())
    }

    async fn create(
        &self,
        contact_address: &str,
        now: DateTime<Utc>,
    ) -> Result<Identity, StorageError> {
        let mut maps = self.maps();
        if maps.by_contact.contains_key(contact_address) {
            return Err(StorageError::Conflict(format!(
                "contact {} already registered",
                contact_address
            )));
        }
        let identity = new_identity(contact_address, now);
        maps.by_contact
            .insert(contact_address.to_string(), identity.id.clone());
        maps.by_id.insert(identity.id.clone(), identity.clone());
        Ok(identity)
    }

    async fn mark_verified(&self, subject_id: &str) -> Result<(), StorageError> {
        if let Some(identity) = self.maps().by_id.get_mut(subject_id) {
            identity.verified = true;
        }
        Ok(())
    }
}

// ============================================================================
// Redis
// ============================================================================

#[derive(Clone)]
pub struct RedisIdentityStore {
    con: MultiplexedConnection,
}

impl RedisIdentityStore {
    pub fn new(con: MultiplexedConnection) -> Self {
        Self { con }
    }

    fn identity_key(subject_id: &str) -> String {
        format!("identity:{}", subject_id)
    }

    fn contact_key(contact_address: &str) -> String {
        format!("contact:{}", contact_address)
    }

    async fn get_identity(
        con: &mut MultiplexedConnection,
        subject_id: &str,
    ) -> Result<Option<Identity>, StorageError> {
        let json: Option<String> = con.get(Self::identity_key(subject_id)).await?;
        json.map(from_json).transpose()
    }
}

#[async_trait]
impl IdentityStore for RedisIdentityStore {
    async fn find_by_contact(
        &self,
        contact_address: &str,
    ) -> Result<Option<Identity>, StorageError> {
        let mut con = self.con.clone();
        let subject_id: Option<String> = con.get(Self::contact_key(contact_address)).await?;
        match subject_id {
            Some(id) => Self::get_identity(&mut con, &id).await,
            None => Ok(None),
        }
    }

    async fn create(
        &self,
        contact_address: &str,
        now: DateTime<Utc>,
    ) -> Result<Identity, StorageError> {
        let mut con = self.con.clone();
        let identity = new_identity(contact_address, now);
        let identity_key = Self::identity_key(&identity.id);

        // Identity first, so a winning contact key never points at nothing
        con.set::<_, _, ()>(&identity_key, to_json(&identity)?)
            .await?;

        let claimed: bool = con
            .set_nx(Self::contact_key(contact_address), &identity.id)
            .await?;
        if !claimed {
            con.del::<_, ()>(&identity_key).await?;
            return Err(StorageError::Conflict(format!(
                "contact {} already registered",
                contact_address
            )));
        }
        Ok(identity)
    }

    async fn mark_verified(&self, subject_id: &str) -> Result<(), StorageError> {
        let mut con = self.con.clone();
        if let Some(mut identity) = Self::get_identity(&mut con, subject_id).await? {
            if !identity.verified {
                identity.verified = true;
                con.set::<_, _, ()>(Self::identity_key(subject_id), to_json(&identity)?)
                    .await?;
            }
        }
        Ok(())
    }
}
