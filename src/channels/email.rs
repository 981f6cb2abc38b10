//! Email transport — outbound SMTP via lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport as _};
use secrecy::{ExposeSecret, SecretString};

use crate::channels::{ChannelKind, SendReceipt, Transport};
use crate::content::MessagePayload;
use crate::error::TransportError;
use crate::targets::model::Target;

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Build config from environment variables.
    /// Returns `None` if `OUTREACH_SMTP_HOST` is not set (channel disabled).
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("OUTREACH_SMTP_HOST").ok()?;

        let port: u16 = std::env::var("OUTREACH_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("OUTREACH_SMTP_USERNAME").unwrap_or_default();
        let password =
            SecretString::from(std::env::var("OUTREACH_SMTP_PASSWORD").unwrap_or_default());
        let from_address =
            std::env::var("OUTREACH_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            host,
            port,
            username,
            password,
            from_address,
        })
    }
}

/// Outbound email over SMTP. Requires the target to carry a contact
/// address.
pub struct EmailTransport {
    config: SmtpConfig,
}

impl EmailTransport {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    /// Build and send one message. Blocking; callers wrap in
    /// `spawn_blocking`.
    fn send_blocking(
        config: &SmtpConfig,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = SmtpTransport::relay(&config.host)
            .map_err(|e| TransportError::SendFailed {
                channel: "email".into(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.port)
            .credentials(creds)
            .build();

        let email = Message::builder()
            .from(config.from_address.parse().map_err(|e| {
                TransportError::InvalidMessage(format!("Invalid from address: {e}"))
            })?)
            .to(to
                .parse()
                .map_err(|e| TransportError::InvalidMessage(format!("Invalid to address: {e}")))?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| TransportError::InvalidMessage(format!("Failed to build email: {e}")))?;

        transport
            .send(&email)
            .map_err(|e| TransportError::SendFailed {
                channel: "email".into(),
                reason: format!("SMTP send failed: {e}"),
            })?;

        tracing::info!(to, "Email sent");
        Ok(())
    }
}

#[async_trait]
impl Transport for EmailTransport {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn accepts(&self, target: &Target) -> bool {
        target.contact_email.is_some()
    }

    async fn send(
        &self,
        target: &Target,
        payload: &MessagePayload,
    ) -> Result<SendReceipt, TransportError> {
        let to = target
            .contact_email
            .clone()
            .ok_or_else(|| TransportError::NoAddress {
                channel: "email".into(),
            })?;

        let config = self.config.clone();
        let subject = payload.subject.clone();
        let body = payload.body.clone();
        let recipient = to.clone();

        tokio::task::spawn_blocking(move || Self::send_blocking(&config, &to, &subject, &body))
            .await
            .map_err(|e| TransportError::SendFailed {
                channel: "email".into(),
                reason: format!("send task panicked: {e}"),
            })??;

        Ok(SendReceipt::now(ChannelKind::Email, Some(recipient)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::targets::model::RawTargetRecord;
    use chrono::Utc;

    fn config() -> SmtpConfig {
        SmtpConfig {
            host: "smtp.example".into(),
            port: 587,
            username: "me@self.example".into(),
            password: SecretString::from("secret"),
            from_address: "me@self.example".into(),
        }
    }

    fn target(email: Option<&str>) -> Target {
        Target::from_raw(&RawTargetRecord {
            organization: "Acme".into(),
            role_title: "Engineer".into(),
            source_id: "test".into(),
            discovered_at: Utc::now(),
            priority_score: 0.5,
            contact_email: email.map(String::from),
        })
    }

    #[test]
    fn accepts_only_with_contact_email() {
        let transport = EmailTransport::new(config());
        assert!(transport.accepts(&target(Some("jobs@acme.example"))));
        assert!(!transport.accepts(&target(None)));
    }

    #[tokio::test]
    async fn send_without_address_is_typed_error() {
        let transport = EmailTransport::new(config());
        let payload = MessagePayload {
            reference: "r".into(),
            subject: "s".into(),
            body: "b".into(),
        };
        let err = transport.send(&target(None), &payload).await.unwrap_err();
        assert!(matches!(err, TransportError::NoAddress { .. }));
    }
}
