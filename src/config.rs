use crate::delivery::TwilioOptions;
use std::env;
use std::net::SocketAddr;

/// Minimum length of `JWT_SECRET` in bytes.
pub const MIN_SECRET_BYTES: usize = 32;

#[derive(Clone)]
pub struct Config {
    // Credentials
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,

    // Server
    pub bind_addr: SocketAddr,
    pub allowed_origin: Option<String>,

    // Storage (in-memory when unset)
    pub redis_url: Option<String>,

    // TTLs (in seconds)
    pub token_ttl_secs: u64,
    pub otp_ttl_secs: u64,
    pub session_grace_secs: u64,
    pub sweep_interval_secs: u64,

    // Delivery
    pub twilio: Option<TwilioOptions>,
    pub sms_sender_name: String,
    pub expose_code_on_delivery_failure: bool,

    // Rate limiting
    pub rate_limit_otp_requests: u32,
    pub rate_limit_window_secs: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("jwt_secret", &"[REDACTED]")
            .field("jwt_issuer", &self.jwt_issuer)
            .field("jwt_audience", &self.jwt_audience)
            .field("bind_addr", &self.bind_addr)
            .field("allowed_origin", &self.allowed_origin)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "[REDACTED]"))
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("otp_ttl_secs", &self.otp_ttl_secs)
            .field("session_grace_secs", &self.session_grace_secs)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("twilio", &self.twilio)
            .field("sms_sender_name", &self.sms_sender_name)
            .field(
                "expose_code_on_delivery_failure",
                &self.expose_code_on_delivery_failure,
            )
            .field("rate_limit_otp_requests", &self.rate_limit_otp_requests)
            .field("rate_limit_window_secs", &self.rate_limit_window_secs)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to parse {0}: {1}")]
    ParseError(String, String),
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // .env is optional; production sets variables directly
        let _ = dotenvy::dotenv();

        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| ConfigError::MissingVar("JWT_SECRET".to_string()))?;
        if jwt_secret.len() < MIN_SECRET_BYTES {
            return Err(ConfigError::InvalidValue(
                "JWT_SECRET".to_string(),
                format!(
                    "must be at least {} bytes, got {}",
                    MIN_SECRET_BYTES,
                    jwt_secret.len()
                ),
            ));
        }

        let jwt_issuer = non_empty_or_default("JWT_ISSUER", "otpgate")?;
        let jwt_audience = non_empty_or_default("JWT_AUDIENCE", "otpgate-users")?;

        // Server
        let bind_addr_str = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_addr = bind_addr_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::ParseError("BIND_ADDR".to_string(), e.to_string()))?;
        let allowed_origin = optional_var("ALLOWED_ORIGIN");

        let redis_url = optional_var("REDIS_URL");

        // TTLs
        let token_ttl_secs = positive_or_default("TOKEN_TTL_SECS", 3_600)?;
        let otp_ttl_secs = positive_or_default("OTP_TTL_SECS", 300)?;
        let session_grace_secs = positive_or_default("SESSION_GRACE_SECS", 300)?;
        let sweep_interval_secs = positive_or_default("SWEEP_INTERVAL_SECS", 3_600)?;

        // Delivery
        let twilio = twilio_from_env()?;
        let sms_sender_name = non_empty_or_default("SMS_SENDER_NAME", "otpgate")?;
        let expose_code_on_delivery_failure =
            parse_env_or_default("EXPOSE_CODE_ON_DELIVERY_FAILURE", false)?;

        // Rate limiting
        let rate_limit_otp_requests = parse_env_or_default("RATE_LIMIT_OTP_REQUESTS", 3)?;
        let rate_limit_window_secs = positive_or_default("RATE_LIMIT_WINDOW_SECS", 900)?;

        Ok(Config {
            jwt_secret,
            jwt_issuer,
            jwt_audience,
            bind_addr,
            allowed_origin,
            redis_url,
            token_ttl_secs,
            otp_ttl_secs,
            session_grace_secs,
            sweep_interval_secs,
            twilio,
            sms_sender_name,
            expose_code_on_delivery_failure,
            rate_limit_otp_requests,
            rate_limit_window_secs,
        })
    }
}

/// All three Twilio variables, or none of them.
fn twilio_from_env() -> Result<Option<TwilioOptions>, ConfigError> {
    const VARS: [&str; 3] = [
        "TWILIO_ACCOUNT_SID",
        "TWILIO_AUTH_TOKEN",
        "TWILIO_FROM_NUMBER",
    ];

    match VARS.map(optional_var) {
        [Some(account_sid), Some(auth_token), Some(from_number)] => Ok(Some(TwilioOptions {
            account_sid,
            auth_token,
            from_number,
        })),
        [None, None, None] => Ok(None),
        values => {
            let missing = VARS
                .iter()
                .zip(values.iter())
                .find(|(_, v)| v.is_none())
                .map(|(name, _)| name.to_string())
                .unwrap_or_default();
            Err(ConfigError::MissingVar(missing))
        }
    }
}

/// Unset and empty are both "not configured".
fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn non_empty_or_default(key: &str, default: &str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(val) if val.trim().is_empty() => Err(ConfigError::InvalidValue(
            key.to_string(),
            "cannot be empty".to_string(),
        )),
        Ok(val) => Ok(val),
        Err(_) => Ok(default.to_string()),
    }
}

fn positive_or_default(key: &str, default: u64) -> Result<u64, ConfigError> {
    let value = parse_env_or_default(key, default)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue(
            key.to_string(),
            "must be greater than 0".to_string(),
        ));
    }
    Ok(value)
}

/// Helper function to parse environment variable with a default value
fn parse_env_or_default<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| ConfigError::ParseError(key.to_string(), format!("{}: {}", e, val))),
        Err(_) => Ok(default),
    }
}
