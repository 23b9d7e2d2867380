//! Secret generation: challenge session ids and OTP codes.

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use rand::Rng;

/// Lowest and highest six-digit code.
pub const OTP_MIN: u32 = 100_000;
pub const OTP_MAX: u32 = 999_999;

/// Generate a challenge session id.
///
/// 8 bytes of millisecond timestamp followed by 24 cryptographically random
/// bytes, URL-safe base64 without padding (43 characters).
pub fn generate_session_id(now: DateTime<Utc>) -> String {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&now.timestamp_millis().to_be_bytes());
    rand::rng().fill(&mut bytes[8..]);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a six-digit OTP code, uniform over 100000..=999999.
pub fn generate_otp_code() -> String {
    rand::rng().random_range(OTP_MIN..=OTP_MAX).to_string()
}
