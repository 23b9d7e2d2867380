//! Data model and API request/response bodies.
//!
//! Storage models are what the stores hold (in memory or as JSON in Redis).
//! Request and response models are the JSON bodies of the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identity key of an authenticated subject (a 12-char nanoid).
pub type SubjectId = String;

// ============================================================================
// Storage Models
// ============================================================================

/// One outstanding OTP attempt, addressed externally by `session_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeSession {
    pub session_id: String,
    pub subject_id: SubjectId,
    pub contact_address: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ChallengeSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A generated one-time passcode bound to a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpRecord {
    pub id: String,
    pub subject_id: SubjectId,
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub consumed: bool,
}

impl OtpRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Unconsumed and still within its own TTL.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && !self.is_expired(now)
    }
}

/// Identity record as held by the identity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: SubjectId,
    pub contact_address: String,
    pub verified: bool,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Delivery Outcome
// ============================================================================

/// Whether the delivery channel confirmed the send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    DeliveryUncertain,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::DeliveryUncertain => "delivery_uncertain",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Auth Models
// ============================================================================

/// Request to start an OTP challenge.
#[derive(Debug, Deserialize)]
pub struct StartChallengeRequest {
    #[serde(default)]
    pub mobile_number: String,
}

/// Response after a challenge was created (delivered or not).
#[derive(Debug, Serialize)]
pub struct StartChallengeResponse {
    pub session_id: String,
    pub status: DeliveryStatus,
    pub expires_in_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Request to rotate the code of an existing challenge.
#[derive(Debug, Deserialize)]
pub struct ResendRequest {
    #[serde(default)]
    pub session_id: String,
}

/// Response after a resend.
#[derive(Debug, Serialize)]
pub struct ResendResponse {
    pub status: DeliveryStatus,
    pub expires_in_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub otp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Request to answer a challenge.
#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub code: String,
}

/// Response after successful verification.
#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_at: DateTime<Utc>,
    pub subject_id: SubjectId,
    pub mobile_number: String,
}

/// Identity of the current bearer.
#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub subject_id: SubjectId,
    pub mobile_number: String,
    pub expires_at: DateTime<Utc>,
}

/// Liveness response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: u64,
}
