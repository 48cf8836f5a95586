//! Email transport — delivers a single rendered message.
//!
//! The `Transport` trait is the seam the pipeline depends on; `SmtpTransport` is the
//! production implementation on top of lettre's async SMTP client.

use std::time::Duration;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use mailroom_common::config::{SmtpConfig, SmtpTls};

use crate::error::TransportError;

/// SMTP command timeout.
const SMTP_TIMEOUT: Duration = Duration::from_secs(15);

/// A fully rendered email addressed to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one message. Every failure is reported, never panics.
    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError>;

    /// Check that the transport can reach its server.
    async fn test_connection(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

pub struct SmtpTransport {
    inner: AsyncSmtpTransport<Tokio1Executor>,
    /// A bad or missing sender is reported on every attempt rather than at start-up.
    sender: Result<Mailbox, TransportError>,
}

impl SmtpTransport {
    pub fn from_config(
        config: &SmtpConfig,
        email_from: Option<&str>,
    ) -> Result<Self, TransportError> {
        let inner = Self::build_transport(config)?;

        let sender = match email_from {
            Some(addr) => addr.parse::<Mailbox>().map_err(|e| {
                TransportError::Configuration(format!("invalid sender address '{}': {}", addr, e))
            }),
            None => Err(TransportError::Configuration(
                "sender address (EMAIL_FROM) is not configured".to_string(),
            )),
        };

        if let Err(e) = &sender {
            tracing::warn!(error = %e, "SMTP transport has no usable sender, every send will fail");
        }

        tracing::info!(
            host = %config.host,
            port = config.port,
            tls = ?config.tls,
            "SMTP transport configured"
        );

        Ok(Self { inner, sender })
    }

    fn build_transport(
        config: &SmtpConfig,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, TransportError> {
        let tls_err = |e: lettre::transport::smtp::Error| {
            TransportError::Configuration(format!("TLS setup failed: {}", e))
        };

        let builder = match config.tls {
            SmtpTls::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host),
            SmtpTls::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host).map_err(tls_err)?
            }
            SmtpTls::Tls => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host).map_err(tls_err)?
            }
        }
        .port(config.port)
        .timeout(Some(SMTP_TIMEOUT));

        let builder = match (&config.username, &config.password) {
            (Some(u), Some(p)) => builder.credentials(Credentials::new(u.clone(), p.clone())),
            (None, None) => builder,
            _ => {
                return Err(TransportError::Configuration(
                    "SMTP_USERNAME and SMTP_PASSWORD must be set together".to_string(),
                ));
            }
        };

        Ok(builder.build())
    }

    fn build_message(&self, email: &OutgoingEmail) -> Result<Message, TransportError> {
        let from = self.sender.clone()?;
        let to: Mailbox = email.to.parse().map_err(|e| {
            TransportError::Transport(format!("invalid recipient '{}': {}", email.to, e))
        })?;

        Message::builder()
            .from(from)
            .to(to)
            .subject(email.subject.as_str())
            .multipart(MultiPart::alternative_plain_html(
                email.text.clone(),
                email.html.clone(),
            ))
            .map_err(|e| TransportError::Transport(format!("failed to build email: {}", e)))
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    async fn send(&self, email: &OutgoingEmail) -> Result<(), TransportError> {
        let message = self.build_message(email)?;
        self.inner
            .send(message)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Transport(e.to_string()))
    }

    async fn test_connection(&self) -> Result<(), TransportError> {
        self.sender.clone()?;
        match self.inner.test_connection().await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportError::Transport(
                "SMTP server did not accept the connection".to_string(),
            )),
            Err(e) => Err(TransportError::Transport(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp_config() -> SmtpConfig {
        SmtpConfig {
            host: "localhost".to_string(),
            port: 2525,
            username: None,
            password: None,
            tls: SmtpTls::None,
        }
    }

    fn email() -> OutgoingEmail {
        OutgoingEmail {
            to: "a@b.com".to_string(),
            subject: "Hello".to_string(),
            html: "<p>Hello</p>".to_string(),
            text: "Hello".to_string(),
        }
    }

    #[tokio::test]
    async fn test_missing_sender_is_configuration_error() {
        let transport = SmtpTransport::from_config(&smtp_config(), None).unwrap();
        let err = transport.send(&email()).await.unwrap_err();
        assert!(matches!(err, TransportError::Configuration(_)));
        assert!(err.to_string().starts_with("Configuration error"));
    }

    #[tokio::test]
    async fn test_invalid_sender_is_configuration_error() {
        let transport = SmtpTransport::from_config(&smtp_config(), Some("not an address")).unwrap();
        assert!(matches!(
            transport.build_message(&email()),
            Err(TransportError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_message_builds_with_valid_sender() {
        let sender = Some("Mailroom <no-reply@example.com>");
        let transport = SmtpTransport::from_config(&smtp_config(), sender).unwrap();
        let message = transport.build_message(&email()).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains("Subject: Hello"));
        assert!(raw.contains("multipart/alternative"));
    }

    #[test]
    fn test_half_configured_credentials_rejected() {
        let mut config = smtp_config();
        config.username = Some("user".to_string());
        assert!(matches!(
            SmtpTransport::from_config(&config, Some("no-reply@example.com")),
            Err(TransportError::Configuration(_))
        ));
    }
}
