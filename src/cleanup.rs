//! Background sweep of expired state.
//!
//! Expiry is always enforced on read, so the sweep only reclaims memory:
//! expired challenge sessions, expired OTP records, revocation entries whose
//! token has expired, and closed rate-limit windows. Redis stores rely on
//! native key expiry and report 0.

use crate::clock::Clock;
use crate::storage::{
    ChallengeStore, OtpStore, RateLimitStore, RevocationStore, StorageError, Stores,
};
use std::sync::Arc;
use std::time::Duration;

/// Counts removed by one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: usize,
    pub otps: usize,
    pub revocations: usize,
    pub rate_limit_windows: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.sessions + self.otps + self.revocations + self.rate_limit_windows
    }
}

pub struct Sweeper {
    challenges: Arc<dyn ChallengeStore>,
    otps: Arc<dyn OtpStore>,
    revocations: Arc<dyn RevocationStore>,
    rate_limits: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl Sweeper {
    pub fn new(stores: &Stores, clock: Arc<dyn Clock>) -> Self {
        Self {
            challenges: stores.challenges.clone(),
            otps: stores.otps.clone(),
            revocations: stores.revocations.clone(),
            rate_limits: stores.rate_limits.clone(),
            clock,
        }
    }

    /// Run one pass against the current time.
    pub async fn sweep_once(&self) -> Result<SweepReport, StorageError> {
        let now = self.clock.now();

        let report = SweepReport {
            sessions: self.challenges.sweep(now).await?,
            otps: self.otps.purge_expired(now).await?,
            revocations: self.revocations.purge_expired(now).await?,
            rate_limit_windows: self.rate_limits.purge_expired(now).await?,
        };

        if report.total() > 0 {
            tracing::info!(
                sessions = report.sessions,
                otps = report.otps,
                revocations = report.revocations,
                rate_limit_windows = report.rate_limit_windows,
                "Sweep completed"
            );
        } else {
            tracing::debug!("Sweep completed, nothing expired");
        }

        Ok(report)
    }
}

/// Run the sweep loop.
///
/// Sweeps every `interval`; a failed pass is logged and the loop carries on.
pub async fn run_sweep_loop(sweeper: Sweeper, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        if let Err(e) = sweeper.sweep_once().await {
            tracing::error!(error = %e, "Sweep failed");
        }
    }
}
