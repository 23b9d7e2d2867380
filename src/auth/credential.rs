//! Bearer credentials: signed JWTs bound to a subject.
//!
//! Verification is stateless apart from one lookup in the revocation store.
//! Signature, issuer and audience are checked by `jsonwebtoken`; expiry is
//! checked here against the injected clock.

use crate::clock::Clock;
use crate::error::{AuthError, InvalidReason};
use crate::models::SubjectId;
use crate::storage::RevocationStore;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// JWT claims carried by every credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: SubjectId,
    pub contact: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
    pub jti: String,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// A freshly minted credential.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub subject_id: SubjectId,
    pub contact_address: String,
    pub expires_at: DateTime<Utc>,
}

/// Mints, verifies and revokes credentials.
///
/// The signing key is fixed at construction and never rotated in-process.
#[derive(Clone)]
pub struct CredentialIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    token_ttl: Duration,
    clock: Arc<dyn Clock>,
    revocations: Arc<dyn RevocationStore>,
}

impl CredentialIssuer {
    pub fn new(
        secret: &[u8],
        issuer: impl Into<String>,
        audience: impl Into<String>,
        token_ttl: Duration,
        clock: Arc<dyn Clock>,
        revocations: Arc<dyn RevocationStore>,
    ) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: issuer.into(),
            audience: audience.into(),
            token_ttl,
            clock,
            revocations,
        }
    }

    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    /// Sign a credential for `subject_id`, valid for the token TTL from now.
    pub fn mint(&self, subject_id: &str, contact: &str) -> Result<Credential, AuthError> {
        let now = self.clock.now();
        let exp = (now + self.token_ttl).timestamp();

        let claims = Claims {
            sub: subject_id.to_string(),
            contact: contact.to_string(),
            iat: now.timestamp(),
            exp,
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            jti: nanoid::nanoid!(21),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Signing(e.to_string()))?;

        Ok(Credential {
            token,
            subject_id: claims.sub.clone(),
            contact_address: claims.contact.clone(),
            expires_at: claims.expires_at(),
        })
    }

    /// Check signature, expiry and revocation. Every failure is
    /// `InvalidCredential`; the reason is for logs only.
    pub async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self.decode(token).map_err(AuthError::InvalidCredential)?;

        if self.clock.now().timestamp() >= claims.exp {
            return Err(AuthError::InvalidCredential(InvalidReason::TokenExpired));
        }

        if self.revocations.is_revoked(token).await? {
            return Err(AuthError::InvalidCredential(InvalidReason::Revoked));
        }

        Ok(claims)
    }

    /// Revoke `token` until its own expiry, read from the token itself.
    ///
    /// Returns `false` when there was nothing to record: the token does not
    /// verify or has already expired, so `verify` rejects it anyway.
    pub async fn revoke(&self, token: &str) -> Result<bool, AuthError> {
        let claims = match self.decode(token) {
            Ok(claims) => claims,
            Err(_) => return Ok(false),
        };

        let now = self.clock.now();
        let expires_at = claims.expires_at();
        if expires_at <= now {
            return Ok(false);
        }

        self.revocations.revoke(token, expires_at, now).await?;
        Ok(true)
    }

    /// Signature, issuer and audience only.
    fn decode(&self, token: &str) -> Result<Claims, InvalidReason> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidIssuer
                | ErrorKind::InvalidAudience => InvalidReason::BadSignature,
                _ => InvalidReason::Malformed,
            })
    }
}
