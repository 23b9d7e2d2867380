//! Delivery channels for OTP messages.
//!
//! A failed send never fails the challenge; the orchestrator reports it as
//! delivery-uncertain instead.

use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery channel not configured")]
    NotConfigured,

    #[error("Provider rejected message ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(&self, address: &str, message: &str) -> Result<(), DeliveryError>;
}

/// Credentials for the Twilio Messages API.
#[derive(Clone)]
pub struct TwilioOptions {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
}

impl std::fmt::Debug for TwilioOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwilioOptions")
            .field("account_sid", &self.account_sid)
            .field("auth_token", &"[REDACTED]")
            .field("from_number", &self.from_number)
            .finish()
    }
}

/// SMS via Twilio.
#[derive(Debug, Clone)]
pub struct TwilioSms {
    options: TwilioOptions,
    client: Client,
    base_url: String,
}

impl TwilioSms {
    pub fn new(options: TwilioOptions) -> Self {
        Self::with_base_url(options, "https://api.twilio.com")
    }

    /// Point at a different API host (used against local fakes).
    pub fn with_base_url(options: TwilioOptions, base_url: impl Into<String>) -> Self {
        Self {
            options,
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.base_url.trim_end_matches('/'),
            self.options.account_sid
        )
    }
}

#[async_trait]
impl DeliveryChannel for TwilioSms {
    async fn send(&self, address: &str, message: &str) -> Result<(), DeliveryError> {
        let mut form_body: HashMap<&str, &str> = HashMap::new();
        form_body.insert("To", address);
        form_body.insert("From", &self.options.from_number);
        form_body.insert("Body", message);

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.options.account_sid, Some(&self.options.auth_token))
            .form(&form_body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Used when no provider is configured: every send reports failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

#[async_trait]
impl DeliveryChannel for Unconfigured {
    async fn send(&self, _address: &str, _message: &str) -> Result<(), DeliveryError> {
        Err(DeliveryError::NotConfigured)
    }
}

/// Text of the SMS carrying a code.
pub fn otp_message(sender: &str, code: &str, ttl_minutes: i64, resend: bool) -> String {
    let new = if resend { "new " } else { "" };
    format!(
        "Your {}{} verification code is: {}. This code will expire in {} minutes.",
        new, sender, code, ttl_minutes
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::Form, http::StatusCode, routing::post, Router};

    fn options() -> TwilioOptions {
        TwilioOptions {
            account_sid: "AC123".to_string(),
            auth_token: "secret-token".to_string(),
            from_number: "+15550000000".to_string(),
        }
    }

    /// Serve a fake Messages endpoint answering with `status`.
    async fn fake_twilio(status: StatusCode) -> String {
        let app = Router::new().route(
            "/2010-04-01/Accounts/{sid}/Messages.json",
            post(move |Form(form): Form<HashMap<String, String>>| async move {
                assert_eq!(form.get("From").map(String::as_str), Some("+15550000000"));
                assert!(form.contains_key("To"));
                assert!(form.contains_key("Body"));
                (status, "{}")
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[test]
    fn test_otp_message() {
        assert_eq!(
            otp_message("Acme", "123456", 5, false),
            "Your Acme verification code is: 123456. This code will expire in 5 minutes."
        );
        assert!(otp_message("Acme", "123456", 5, true).starts_with("Your new Acme"));
    }

    #[test]
    fn test_debug_redacts_auth_token() {
        let debug = format!("{:?}", options());
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn test_unconfigured_always_fails() {
        let err = Unconfigured.send("+15551234567", "hi").await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotConfigured));
    }

    #[tokio::test]
    async fn test_twilio_send_success() {
        let base = fake_twilio(StatusCode::CREATED).await;
        let sms = TwilioSms::with_base_url(options(), base);
        sms.send("+15551234567", "Your code is 123456").await.unwrap();
    }

    #[tokio::test]
    async fn test_twilio_send_rejected() {
        let base = fake_twilio(StatusCode::BAD_REQUEST).await;
        let sms = TwilioSms::with_base_url(options(), base);
        let err = sms.send("+15551234567", "hi").await.unwrap_err();
        assert!(matches!(err, DeliveryError::Rejected { status: 400, .. }));
    }
}
