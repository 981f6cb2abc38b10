//! Portal transport — multipart form submission to an application portal
//! relay.
//!
//! Real career portals vary wildly; deployments front them with a single
//! relay endpoint that takes a multipart form and does the site-specific
//! automation. This adapter only speaks to that relay.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::channels::{ChannelKind, SendReceipt, Transport};
use crate::content::MessagePayload;
use crate::error::TransportError;
use crate::targets::model::Target;

/// Portal relay configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub endpoint: String,
    pub token: SecretString,
    pub timeout_secs: u64,
}

impl PortalConfig {
    /// Build config from environment variables.
    /// Returns `None` if `OUTREACH_PORTAL_URL` is not set (channel disabled).
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("OUTREACH_PORTAL_URL").ok()?;
        let token = SecretString::from(std::env::var("OUTREACH_PORTAL_TOKEN").unwrap_or_default());
        let timeout_secs: u64 = std::env::var("OUTREACH_PORTAL_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        Some(Self {
            endpoint,
            token,
            timeout_secs,
        })
    }
}

/// Form submission through the portal relay.
pub struct PortalTransport {
    config: PortalConfig,
    client: reqwest::Client,
}

impl PortalTransport {
    pub fn new(config: PortalConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

#[async_trait]
impl Transport for PortalTransport {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Portal
    }

    fn accepts(&self, _target: &Target) -> bool {
        // The relay resolves the portal from the organization name.
        true
    }

    async fn send(
        &self,
        target: &Target,
        payload: &MessagePayload,
    ) -> Result<SendReceipt, TransportError> {
        let form = reqwest::multipart::Form::new()
            .text("organization", target.display_organization.clone())
            .text("role", target.display_role.clone())
            .text("subject", payload.subject.clone())
            .text("message", payload.body.clone())
            .text("reference", payload.reference.clone());

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(self.config.token.expose_secret())
            .multipart(form)
            .send()
            .await
            .map_err(|e| TransportError::Http(format!("portal request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TransportError::AuthFailed {
                channel: "portal".into(),
                reason: format!("relay returned {status}"),
            });
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(TransportError::SendFailed {
                channel: "portal".into(),
                reason: format!("relay returned {status}: {detail}"),
            });
        }

        tracing::info!(
            target_id = %target.id,
            organization = %target.organization,
            "Portal submission accepted"
        );
        Ok(SendReceipt::now(ChannelKind::Portal, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_env_disabled_without_url() {
        // Relies on OUTREACH_PORTAL_URL not being set in the test env.
        assert!(PortalConfig::from_env().is_none());
    }

    #[test]
    fn portal_accepts_any_target() {
        let transport = PortalTransport::new(PortalConfig {
            endpoint: "http://localhost:1".into(),
            token: SecretString::from(""),
            timeout_secs: 1,
        });
        let target = Target::from_raw(&crate::targets::model::RawTargetRecord {
            organization: "Acme".into(),
            role_title: "Engineer".into(),
            source_id: "test".into(),
            discovered_at: chrono::Utc::now(),
            priority_score: 0.0,
            contact_email: None,
        });
        assert!(transport.accepts(&target));
    }
}
