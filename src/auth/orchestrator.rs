//! Authentication orchestrator.
//!
//! Drives one challenge from creation to a credential:
//!
//! ```text
//! Created -> Delivered -> Verified        (session consumed, credential issued)
//!    |          |  ^
//!    |          v  |
//!    |     Invalid-Attempt                (bounded only by session expiry)
//!    v
//! Expired                                 (no credential)
//! ```
//!
//! Store calls are individually atomic and no store lock is held across the
//! identity store or the delivery channel. A matched code is only half of a
//! successful verify: the session is then claimed with a single atomic
//! delete, and only the caller that wins that claim gets a credential. A
//! failure after the claim leaves the session spent.

use crate::auth::credential::{Claims, Credential, CredentialIssuer};
use crate::auth::session::generate_otp_code;
use crate::clock::Clock;
use crate::delivery::{otp_message, DeliveryChannel};
use crate::error::AuthError;
use crate::models::{ChallengeSession, DeliveryStatus, Identity, OtpRecord};
use crate::storage::{
    ChallengeStore, IdentityStore, OtpMatch, OtpStore, SessionLookup, StorageError, Stores,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Challenge timing and disclosure settings.
#[derive(Debug, Clone)]
pub struct ChallengePolicy {
    pub otp_ttl: Duration,
    /// Extra session lifetime past the OTP TTL, so a late verify gets a
    /// clear answer instead of "session not found".
    pub session_grace: Duration,
    /// Return the code to the caller when delivery failed. Development only.
    pub expose_code_on_delivery_failure: bool,
    /// Product name used in the SMS text.
    pub sender_name: String,
}

impl ChallengePolicy {
    pub fn session_ttl(&self) -> Duration {
        self.otp_ttl + self.session_grace
    }
}

impl Default for ChallengePolicy {
    fn default() -> Self {
        Self {
            otp_ttl: Duration::minutes(5),
            session_grace: Duration::minutes(5),
            expose_code_on_delivery_failure: false,
            sender_name: "otpgate".to_string(),
        }
    }
}

/// Outcome of sending (or re-sending) a code.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    pub status: DeliveryStatus,
    pub code_expires_at: DateTime<Utc>,
    /// Only set when delivery failed and the policy allows disclosure.
    pub exposed_code: Option<String>,
}

/// Result of starting a challenge.
#[derive(Debug, Clone)]
pub struct ChallengeReceipt {
    pub session_id: String,
    pub delivery: DeliveryReceipt,
}

pub struct Authenticator {
    challenges: Arc<dyn ChallengeStore>,
    otps: Arc<dyn OtpStore>,
    identities: Arc<dyn IdentityStore>,
    delivery: Arc<dyn DeliveryChannel>,
    issuer: CredentialIssuer,
    clock: Arc<dyn Clock>,
    policy: ChallengePolicy,
}

impl Authenticator {
    pub fn new(
        stores: &Stores,
        delivery: Arc<dyn DeliveryChannel>,
        issuer: CredentialIssuer,
        clock: Arc<dyn Clock>,
        policy: ChallengePolicy,
    ) -> Self {
        Self {
            challenges: stores.challenges.clone(),
            otps: stores.otps.clone(),
            identities: stores.identities.clone(),
            delivery,
            issuer,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &ChallengePolicy {
        &self.policy
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Start a challenge for `contact_address`, registering it on first use.
    ///
    /// The session survives a failed delivery; the receipt says so.
    pub async fn begin_challenge(
        &self,
        contact_address: &str,
    ) -> Result<ChallengeReceipt, AuthError> {
        let contact_address = contact_address.trim();
        validate_contact_address(contact_address)?;

        let identity = self.resolve_identity(contact_address).await?;
        let now = self.clock.now();

        let record = self.issue_code(&identity.id, now).await?;
        let session = self
            .challenges
            .create(
                &identity.id,
                contact_address,
                now,
                self.policy.session_ttl(),
            )
            .await?;

        tracing::debug!(
            action = "challenge_created",
            session_id = %session.session_id,
            subject_id = %identity.id,
            expires_at = %session.expires_at,
            "OTP session created"
        );

        let delivery = self.deliver(&session, &record, false).await;

        Ok(ChallengeReceipt {
            session_id: session.session_id,
            delivery,
        })
    }

    /// Issue a fresh code for an active session and deliver it.
    ///
    /// Earlier codes are left in place; they stop matching because only the
    /// newest eligible code is compared.
    pub async fn resend(&self, session_id: &str) -> Result<DeliveryReceipt, AuthError> {
        require_field(session_id, "Session ID is required")?;

        let session = self.active_session(session_id).await?;
        let record = self.issue_code(&session.subject_id, self.clock.now()).await?;

        tracing::debug!(
            action = "otp_resent",
            session_id = %session.session_id,
            subject_id = %session.subject_id,
            "New OTP stored for resend"
        );

        Ok(self.deliver(&session, &record, true).await)
    }

    /// Answer a challenge. On success the session is consumed and a
    /// credential is returned; on a bad code the session stays usable until
    /// it expires.
    pub async fn complete_challenge(
        &self,
        session_id: &str,
        submitted_code: &str,
    ) -> Result<Credential, AuthError> {
        require_field(session_id, "Session ID and OTP are required")?;
        require_field(submitted_code, "Session ID and OTP are required")?;

        let session = self.active_session(session_id).await?;

        let matched = self
            .otps
            .consume_match(&session.subject_id, submitted_code.trim(), self.clock.now())
            .await?;

        let record = match matched {
            OtpMatch::Matched(record) => record,
            OtpMatch::Rejected(reason) => {
                tracing::warn!(
                    action = "otp_rejected",
                    session_id = %session.session_id,
                    subject_id = %session.subject_id,
                    reason = %reason,
                    "Invalid OTP provided"
                );
                return Err(AuthError::InvalidCredential(reason));
            }
        };

        tracing::debug!(
            action = "otp_consumed",
            subject_id = %session.subject_id,
            otp_id = %record.id,
            "OTP marked as used"
        );

        // A resend leaves older codes behind that match again once the newest
        // is consumed, so the session itself must be claimed exactly once.
        if !self.challenges.consume(&session.session_id).await? {
            tracing::warn!(
                action = "session_already_consumed",
                session_id = %session.session_id,
                subject_id = %session.subject_id,
                "Session was consumed by a concurrent verify"
            );
            return Err(AuthError::SessionNotFound);
        }

        self.identities.mark_verified(&session.subject_id).await?;
        let credential = self
            .issuer
            .mint(&session.subject_id, &session.contact_address)?;

        tracing::info!(
            action = "otp_verified",
            session_id = %session.session_id,
            subject_id = %session.subject_id,
            "OTP verified successfully"
        );

        Ok(credential)
    }

    /// Log out. Always succeeds from the caller's point of view.
    pub async fn end_session(&self, token: Option<&str>) {
        let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
            return;
        };

        match self.issuer.revoke(token).await {
            Ok(true) => tracing::debug!(action = "token_revoked", "Token invalidated"),
            Ok(false) => tracing::debug!(
                action = "token_not_recorded",
                "Token already invalid, nothing to revoke"
            ),
            Err(e) => tracing::error!(error = %e, "Failed to record token revocation"),
        }
    }

    /// Verify a bearer credential.
    pub async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.issuer.verify(token).await
    }

    async fn active_session(&self, session_id: &str) -> Result<ChallengeSession, AuthError> {
        match self
            .challenges
            .lookup(session_id.trim(), self.clock.now())
            .await?
        {
            SessionLookup::Active(session) => Ok(session),
            SessionLookup::Expired => {
                tracing::warn!(action = "session_expired", session_id = %session_id, "Expired session ID provided");
                Err(AuthError::SessionExpired)
            }
            SessionLookup::Missing => {
                tracing::warn!(action = "session_missing", session_id = %session_id, "Invalid session ID provided");
                Err(AuthError::SessionNotFound)
            }
        }
    }

    /// Find the identity for a contact address, creating it on first use.
    ///
    /// Two first-time challenges for one address can race on `create`; the
    /// loser picks up the winner's identity.
    async fn resolve_identity(&self, contact_address: &str) -> Result<Identity, AuthError> {
        if let Some(identity) = self.identities.find_by_contact(contact_address).await? {
            return Ok(identity);
        }

        match self
            .identities
            .create(contact_address, self.clock.now())
            .await
        {
            Ok(identity) => {
                tracing::info!(action = "identity_created", subject_id = %identity.id, "New identity registered");
                Ok(identity)
            }
            Err(StorageError::Conflict(_)) => self
                .identities
                .find_by_contact(contact_address)
                .await?
                .ok_or_else(|| {
                    AuthError::Storage(StorageError::Conflict(
                        "identity vanished after conflict".to_string(),
                    ))
                }),
            Err(e) => Err(e.into()),
        }
    }

    async fn issue_code(
        &self,
        subject_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OtpRecord, AuthError> {
        let record = OtpRecord {
            id: nanoid::nanoid!(21),
            subject_id: subject_id.to_string(),
            code: generate_otp_code(),
            created_at: now,
            expires_at: now + self.policy.otp_ttl,
            consumed: false,
        };
        self.otps.insert(record.clone()).await?;
        Ok(record)
    }

    async fn deliver(
        &self,
        session: &ChallengeSession,
        record: &OtpRecord,
        resend: bool,
    ) -> DeliveryReceipt {
        let message = otp_message(
            &self.policy.sender_name,
            &record.code,
            self.policy.otp_ttl.num_minutes(),
            resend,
        );

        match self
            .delivery
            .send(&session.contact_address, &message)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    action = "otp_delivered",
                    session_id = %session.session_id,
                    subject_id = %session.subject_id,
                    "OTP sent successfully"
                );
                DeliveryReceipt {
                    status: DeliveryStatus::Delivered,
                    code_expires_at: record.expires_at,
                    exposed_code: None,
                }
            }
            Err(e) => {
                tracing::warn!(
                    action = "otp_delivery_failed",
                    session_id = %session.session_id,
                    subject_id = %session.subject_id,
                    error = %e,
                    "SMS delivery failed"
                );
                DeliveryReceipt {
                    status: DeliveryStatus::DeliveryUncertain,
                    code_expires_at: record.expires_at,
                    exposed_code: self
                        .policy
                        .expose_code_on_delivery_failure
                        .then(|| record.code.clone()),
                }
            }
        }
    }
}

/// Accepts an optional leading `+`, then 1 to 16 digits with no leading zero.
pub fn validate_contact_address(contact_address: &str) -> Result<(), AuthError> {
    if contact_address.is_empty() {
        return Err(AuthError::Validation("Mobile number is required".to_string()));
    }

    let digits = contact_address
        .strip_prefix('+')
        .unwrap_or(contact_address);
    let valid = (1..=16).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
        && !digits.starts_with('0');

    if !valid {
        return Err(AuthError::Validation(
            "Invalid mobile number format".to_string(),
        ));
    }
    Ok(())
}

fn require_field(value: &str, message: &str) -> Result<(), AuthError> {
    if value.trim().is_empty() {
        return Err(AuthError::Validation(message.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::delivery::DeliveryError;
    use crate::error::InvalidReason;
    use crate::storage::{
        MemoryChallengeStore, MemoryIdentityStore, MemoryOtpStore, MemoryRateLimitStore,
        MemoryRevocationStore,
    };
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    const CONTACT: &str = "+15551234567";

    /// Records every message; fails sends while `failing` is set.
    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<(String, String)>>,
        failing: Mutex<bool>,
    }

    impl RecordingChannel {
        fn fail(&self, failing: bool) {
            *self.failing.lock().unwrap() = failing;
        }

        fn last_code(&self) -> String {
            let sent = self.sent.lock().unwrap();
            let (_, message) = sent.last().expect("no message sent");
            message
                .split(|c: char| !c.is_ascii_digit())
                .find(|part| part.len() == 6)
                .expect("no code in message")
                .to_string()
        }

        fn count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl DeliveryChannel for RecordingChannel {
        async fn send(&self, address: &str, message: &str) -> Result<(), DeliveryError> {
            self.sent
                .lock()
                .unwrap()
                .push((address.to_string(), message.to_string()));
            if *self.failing.lock().unwrap() {
                return Err(DeliveryError::NotConfigured);
            }
            Ok(())
        }
    }

    /// Identity store whose `mark_verified` can be held up or made to fail.
    struct GatedIdentityStore {
        inner: Arc<MemoryIdentityStore>,
        verify_delay: std::time::Duration,
        fail_verify: bool,
    }

    #[async_trait]
    impl IdentityStore for GatedIdentityStore {
        async fn find_by_contact(
            &self,
            contact_address: &str,
        ) -> Result<Option<Identity>, StorageError> {
            self.inner.find_by_contact(contact_address).await
        }

        async fn create(
            &self,
            contact_address: &str,
            now: DateTime<Utc>,
        ) -> Result<Identity, StorageError> {
            self.inner.create(contact_address, now).await
        }

        async fn mark_verified(&self, subject_id: &str) -> Result<(), StorageError> {
            tokio::time::sleep(self.verify_delay).await;
            if self.fail_verify {
                return Err(StorageError::Conflict("identity store unavailable".to_string()));
            }
            self.inner.mark_verified(subject_id).await
        }
    }

    struct Harness {
        auth: Arc<Authenticator>,
        clock: Arc<ManualClock>,
        channel: Arc<RecordingChannel>,
        challenges: Arc<MemoryChallengeStore>,
        otps: Arc<MemoryOtpStore>,
        identities: Arc<MemoryIdentityStore>,
    }

    fn harness_with(policy: ChallengePolicy) -> Harness {
        harness_with_identities(policy, |inner| -> Arc<dyn IdentityStore> { inner })
    }

    fn harness_gated(verify_delay: std::time::Duration, fail_verify: bool) -> Harness {
        harness_with_identities(ChallengePolicy::default(), |inner| -> Arc<dyn IdentityStore> {
            Arc::new(GatedIdentityStore {
                inner,
                verify_delay,
                fail_verify,
            })
        })
    }

    fn harness_with_identities(
        policy: ChallengePolicy,
        wrap: impl FnOnce(Arc<MemoryIdentityStore>) -> Arc<dyn IdentityStore>,
    ) -> Harness {
        let clock = Arc::new(ManualClock::starting_now());
        let channel = Arc::new(RecordingChannel::default());
        let challenges = Arc::new(MemoryChallengeStore::new());
        let otps = Arc::new(MemoryOtpStore::new());
        let identities = Arc::new(MemoryIdentityStore::new());
        let revocations = Arc::new(MemoryRevocationStore::new());
        let stores = Stores {
            challenges: challenges.clone(),
            otps: otps.clone(),
            revocations: revocations.clone(),
            identities: wrap(identities.clone()),
            rate_limits: Arc::new(MemoryRateLimitStore::new()),
        };
        let issuer = CredentialIssuer::new(
            b"orchestrator-test-secret-32-bytes-long!!",
            "otpgate",
            "otpgate-users",
            Duration::hours(1),
            clock.clone(),
            revocations,
        );
        let auth = Arc::new(Authenticator::new(
            &stores,
            channel.clone(),
            issuer,
            clock.clone(),
            policy,
        ));
        Harness {
            auth,
            clock,
            channel,
            challenges,
            otps,
            identities,
        }
    }

    fn harness() -> Harness {
        harness_with(ChallengePolicy::default())
    }

    #[test]
    fn test_validate_contact_address() {
        assert!(validate_contact_address("+15551234567").is_ok());
        assert!(validate_contact_address("15551234567").is_ok());
        assert!(validate_contact_address("+1").is_ok());

        for bad in ["", "+", "+0555", "555-1234", "+1555123456789012", "abc", "+ 1555"] {
            assert!(
                matches!(validate_contact_address(bad), Err(AuthError::Validation(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_invalid_contact_has_no_side_effects() {
        let h = harness();
        let err = h.auth.begin_challenge("not-a-number").await.unwrap_err();
        assert!(matches!(err, AuthError::Validation(_)));
        assert!(h.identities.is_empty());
        assert!(h.challenges.is_empty());
        assert_eq!(h.channel.count(), 0);
    }

    #[tokio::test]
    async fn test_full_scenario() {
        let h = harness();

        let receipt = h.auth.begin_challenge(CONTACT).await.unwrap();
        assert_eq!(receipt.delivery.status, DeliveryStatus::Delivered);
        assert_eq!(
            receipt.delivery.code_expires_at,
            h.clock.now() + Duration::minutes(5)
        );
        assert!(receipt.delivery.exposed_code.is_none());
        let code = h.channel.last_code();

        // Wrong code leaves the session in place
        let wrong = if code == "000000" { "111111" } else { "000000" };
        let err = h
            .auth
            .complete_challenge(&receipt.session_id, wrong)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidCredential(InvalidReason::WrongCode)
        ));
        assert_eq!(h.challenges.len(), 1);

        let credential = h
            .auth
            .complete_challenge(&receipt.session_id, &code)
            .await
            .unwrap();
        assert_eq!(credential.contact_address, CONTACT);
        assert!(h.challenges.is_empty());
        assert!(h.identities.get(&credential.subject_id).unwrap().verified);

        let claims = h.auth.verify(&credential.token).await.unwrap();
        assert_eq!(claims.sub, credential.subject_id);

        // Replay hits a consumed session
        let err = h
            .auth
            .complete_challenge(&receipt.session_id, &code)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SessionNotFound));
    }

    #[tokio::test]
    async fn test_same_contact_resolves_same_subject() {
        let h = harness();
        h.auth.begin_challenge(CONTACT).await.unwrap();
        let receipt = h.auth.begin_challenge(CONTACT).await.unwrap();
        let second_code = h.channel.last_code();

        assert_eq!(h.identities.len(), 1);
        let credential = h
            .auth
            .complete_challenge(&receipt.session_id, &second_code)
            .await
            .unwrap();
        let subject = h.identities.find_by_contact(CONTACT).await.unwrap().unwrap();
        assert_eq!(credential.subject_id, subject.id);
        // Both codes were stored for the one subject
        assert_eq!(h.otps.records_for(&subject.id).len(), 2);
    }

    #[tokio::test]
    async fn test_resend_shadows_original_code() {
        let h = harness();
        let receipt = h.auth.begin_challenge(CONTACT).await.unwrap();
        let original = h.channel.last_code();

        h.clock.advance(Duration::seconds(30));
        let resent = h.auth.resend(&receipt.session_id).await.unwrap();
        assert_eq!(resent.status, DeliveryStatus::Delivered);
        let fresh = h.channel.last_code();
        assert!(h.channel.sent.lock().unwrap().last().unwrap().1.contains("new"));

        if original != fresh {
            let err = h
                .auth
                .complete_challenge(&receipt.session_id, &original)
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredential(_)));
        }
        h.auth
            .complete_challenge(&receipt.session_id, &fresh)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resend_does_not_extend_session() {
        let h = harness();
        let receipt = h.auth.begin_challenge(CONTACT).await.unwrap();

        h.clock.advance(Duration::minutes(9));
        h.auth.resend(&receipt.session_id).await.unwrap();

        h.clock.advance(Duration::minutes(1));
        let err = h.auth.resend(&receipt.session_id).await.unwrap_err();
        assert!(matches!(err, AuthError::SessionExpired));
    }

    #[tokio::test]
    async fn test_late_verify_reports_expired_code_inside_grace() {
        let h = harness();
        let receipt = h.auth.begin_challenge(CONTACT).await.unwrap();
        let code = h.channel.last_code();

        // Code TTL passed, session still alive
        h.clock.advance(Duration::minutes(6));
        let err = h
            .auth
            .complete_challenge(&receipt.session_id, &code)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidCredential(InvalidReason::CodeExpired)
        ));

        // Session TTL passed as well
        h.clock.advance(Duration::minutes(4));
        let err = h
            .auth
            .complete_challenge(&receipt.session_id, &code)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SessionExpired));
        let err = h
            .auth
            .complete_challenge(&receipt.session_id, &code)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SessionNotFound));
    }

    #[tokio::test]
    async fn test_delivery_failure_keeps_session() {
        let h = harness();
        h.channel.fail(true);

        let receipt = h.auth.begin_challenge(CONTACT).await.unwrap();
        assert_eq!(receipt.delivery.status, DeliveryStatus::DeliveryUncertain);
        assert!(receipt.delivery.exposed_code.is_none());
        assert_eq!(h.challenges.len(), 1);

        // The code exists even though the SMS did not go out
        let code = h.channel.last_code();
        h.auth
            .complete_challenge(&receipt.session_id, &code)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_code_exposed_only_when_enabled() {
        let h = harness_with(ChallengePolicy {
            expose_code_on_delivery_failure: true,
            ..ChallengePolicy::default()
        });

        let receipt = h.auth.begin_challenge(CONTACT).await.unwrap();
        assert!(receipt.delivery.exposed_code.is_none());

        h.channel.fail(true);
        let resent = h.auth.resend(&receipt.session_id).await.unwrap();
        assert_eq!(resent.status, DeliveryStatus::DeliveryUncertain);
        assert_eq!(resent.exposed_code, Some(h.channel.last_code()));
    }

    #[tokio::test]
    async fn test_missing_fields() {
        let h = harness();
        assert!(matches!(
            h.auth.resend("  ").await.unwrap_err(),
            AuthError::Validation(_)
        ));
        assert!(matches!(
            h.auth.complete_challenge("abc", "").await.unwrap_err(),
            AuthError::Validation(_)
        ));
        assert!(matches!(
            h.auth.complete_challenge("", "123456").await.unwrap_err(),
            AuthError::Validation(_)
        ));
        assert!(matches!(
            h.auth.resend("unknown").await.unwrap_err(),
            AuthError::SessionNotFound
        ));
    }

    #[tokio::test]
    async fn test_concurrent_complete_single_winner() {
        let h = harness();
        let receipt = h.auth.begin_challenge(CONTACT).await.unwrap();
        let code = h.channel.last_code();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let auth = h.auth.clone();
            let session_id = receipt.session_id.clone();
            let code = code.clone();
            handles.push(tokio::spawn(async move {
                auth.complete_challenge(&session_id, &code).await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => successes += 1,
                Err(AuthError::InvalidCredential(_)) | Err(AuthError::SessionNotFound) => {}
                Err(e) => panic!("Unexpected error: {}", e),
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_resend_race_issues_one_credential() {
        // Old code becomes newest eligible once the new one is consumed
        let h = harness_gated(std::time::Duration::from_millis(200), false);
        let receipt = h.auth.begin_challenge(CONTACT).await.unwrap();
        let old_code = h.channel.last_code();
        h.auth.resend(&receipt.session_id).await.unwrap();
        let new_code = h.channel.last_code();

        let first = {
            let auth = h.auth.clone();
            let session_id = receipt.session_id.clone();
            tokio::spawn(async move { auth.complete_challenge(&session_id, &new_code).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let second = h
            .auth
            .complete_challenge(&receipt.session_id, &old_code)
            .await;

        let first = first.await.unwrap();
        assert!(first.is_ok(), "new code should win: {:?}", first.err());
        assert!(
            matches!(
                second,
                Err(AuthError::SessionNotFound) | Err(AuthError::InvalidCredential(_))
            ),
            "second verify on one session returned {:?}",
            second.map(|c| c.subject_id)
        );
        assert!(h.challenges.is_empty());
    }

    #[tokio::test]
    async fn test_failure_after_match_spends_session() {
        let h = harness_gated(std::time::Duration::ZERO, true);
        let receipt = h.auth.begin_challenge(CONTACT).await.unwrap();
        let old_code = h.channel.last_code();
        h.auth.resend(&receipt.session_id).await.unwrap();
        let new_code = h.channel.last_code();

        let err = h
            .auth
            .complete_challenge(&receipt.session_id, &new_code)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Storage(_)));
        assert!(h.challenges.is_empty());

        // Neither the remaining code nor a retry can finish this session
        for code in [&old_code, &new_code] {
            let err = h
                .auth
                .complete_challenge(&receipt.session_id, code)
                .await
                .unwrap_err();
            assert!(matches!(err, AuthError::SessionNotFound));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_begin_yields_distinct_sessions() {
        let h = harness();

        let mut handles = Vec::new();
        for i in 0..10_000u32 {
            let auth = h.auth.clone();
            handles.push(tokio::spawn(async move {
                let contact = format!("+1555{:07}", i % 500);
                auth.begin_challenge(&contact).await.unwrap().session_id
            }));
        }

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 10_000);
        assert_eq!(h.challenges.len(), 10_000);
        assert_eq!(h.identities.len(), 500);
    }

    #[tokio::test]
    async fn test_end_session_revokes_and_never_fails() {
        let h = harness();
        let receipt = h.auth.begin_challenge(CONTACT).await.unwrap();
        let credential = h
            .auth
            .complete_challenge(&receipt.session_id, &h.channel.last_code())
            .await
            .unwrap();

        h.auth.end_session(Some(&credential.token)).await;
        let err = h.auth.verify(&credential.token).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidCredential(InvalidReason::Revoked)
        ));

        // Garbage, repeats and absence are all fine
        h.auth.end_session(Some(&credential.token)).await;
        h.auth.end_session(Some("garbage")).await;
        h.auth.end_session(Some("")).await;
        h.auth.end_session(None).await;
    }

    #[tokio::test]
    async fn test_token_expires_without_revocation() {
        let h = harness();
        let receipt = h.auth.begin_challenge(CONTACT).await.unwrap();
        let credential = h
            .auth
            .complete_challenge(&receipt.session_id, &h.channel.last_code())
            .await
            .unwrap();

        h.clock.advance(Duration::hours(1));
        let err = h.auth.verify(&credential.token).await.unwrap_err();
        assert!(matches!(
            err,
            AuthError::InvalidCredential(InvalidReason::TokenExpired)
        ));
    }

    #[tokio::test]
    async fn test_identity_conflict_recovers() {
        // Racing first-time challenges for one address all land on one subject
        let h = harness();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let auth = h.auth.clone();
            handles.push(tokio::spawn(async move {
                auth.begin_challenge(CONTACT).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(h.identities.len(), 1);
    }
}
