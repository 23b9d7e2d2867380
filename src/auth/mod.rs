//! Authentication layer: OTP challenges, credentials and HTTP extractors.

pub mod credential;
pub mod middleware;
pub mod orchestrator;
pub mod session;

pub use credential::{Claims, Credential, CredentialIssuer};
pub use middleware::{bearer_token, ApiJson, AppState, Authenticated, RateLimiter};
pub use orchestrator::{Authenticator, ChallengePolicy, ChallengeReceipt, DeliveryReceipt};
pub use session::{generate_otp_code, generate_session_id};
