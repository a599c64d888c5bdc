//! Outbound email: SMTP via lettre, or a logging stand-in.

use std::time::Duration;

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::channels::EmailSender;
use crate::error::ChannelError;
use crate::pipeline::types::FinalEmail;

// ── Configuration ───────────────────────────────────────────────────

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    /// Connect and socket read/write timeout for the relay.
    pub timeout: Duration,
}

impl SmtpConfig {
    /// Returns `None` if `SMTP_HOST` is not set (delivery is then simulated).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok().filter(|h| !h.trim().is_empty())?;

        let port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("SMTP_USER").unwrap_or_default();
        let password = SecretString::from(std::env::var("SMTP_PASS").unwrap_or_default());
        let from_address = std::env::var("SMTP_FROM").unwrap_or_else(|_| username.clone());
        let timeout = std::env::var("SMTP_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SMTP_TIMEOUT);

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
            timeout,
        })
    }

    /// Cap the relay timeout at `limit`.
    pub fn with_timeout_within(mut self, limit: Duration) -> Self {
        self.timeout = self.timeout.min(limit);
        self
    }
}

const DEFAULT_SMTP_TIMEOUT: Duration = Duration::from_secs(20);

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: "email".into(),
        reason,
    }
}

/// Build the lettre message for `email`.
fn build_message(from: &str, email: &FinalEmail) -> Result<Message, ChannelError> {
    Message::builder()
        .from(
            from.parse()
                .map_err(|e| ChannelError::InvalidAddress(format!("from '{from}': {e}")))?,
        )
        .to(email
            .recipient
            .parse()
            .map_err(|e| ChannelError::InvalidAddress(format!("to '{}': {e}", email.recipient)))?)
        .subject(email.subject.clone())
        .body(email.body.clone())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))
}

// ── SMTP sender ─────────────────────────────────────────────────────

/// Sends through an SMTP relay (STARTTLS, credentials).
pub struct SmtpSender {
    config: SmtpConfig,
}

impl SmtpSender {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn send_blocking(config: &SmtpConfig, email: &FinalEmail) -> Result<(), ChannelError> {
        let message = build_message(&config.from_address, email)?;

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
            .port(config.port)
            .credentials(creds)
            .timeout(Some(config.timeout))
            .build();

        transport
            .send(&message)
            .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl EmailSender for SmtpSender {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, email: &FinalEmail) -> Result<(), ChannelError> {
        let config = self.config.clone();
        let email_owned = email.clone();
        tokio::task::spawn_blocking(move || Self::send_blocking(&config, &email_owned))
            .await
            .map_err(|e| send_failed(format!("SMTP task panicked: {e}")))??;

        tracing::info!(recipient = %email.recipient, "Email sent");
        Ok(())
    }
}

// ── Log sender ──────────────────────────────────────────────────────

/// Logs the email instead of delivering it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSender;

#[async_trait]
impl EmailSender for LogSender {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, email: &FinalEmail) -> Result<(), ChannelError> {
        tracing::info!(
            recipient = %email.recipient,
            subject = %email.subject,
            body_chars = email.body.chars().count(),
            "Simulated email send"
        );
        Ok(())
    }
}
