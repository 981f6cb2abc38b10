//! API transport — JSON POST to a submission API.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use crate::channels::{ChannelKind, SendReceipt, Transport};
use crate::content::MessagePayload;
use crate::error::TransportError;
use crate::targets::model::Target;

/// Submission API configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub endpoint: String,
    pub api_key: SecretString,
    pub timeout_secs: u64,
}

impl ApiConfig {
    /// Build config from environment variables.
    /// Returns `None` if `OUTREACH_API_URL` is not set (channel disabled).
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("OUTREACH_API_URL").ok()?;
        let api_key = SecretString::from(std::env::var("OUTREACH_API_KEY").unwrap_or_default());
        let timeout_secs: u64 = std::env::var("OUTREACH_API_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        Some(Self {
            endpoint,
            api_key,
            timeout_secs,
        })
    }
}

#[derive(Serialize)]
struct Submission<'a> {
    organization: &'a str,
    role: &'a str,
    subject: &'a str,
    message: &'a str,
    reference: &'a str,
}

/// JSON submission API client.
pub struct ApiTransport {
    config: ApiConfig,
    client: reqwest::Client,
}

impl ApiTransport {
    pub fn new(config: ApiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }
}

#[async_trait]
impl Transport for ApiTransport {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Api
    }

    fn accepts(&self, _target: &Target) -> bool {
        true
    }

    async fn send(
        &self,
        target: &Target,
        payload: &MessagePayload,
    ) -> Result<SendReceipt, TransportError> {
        let submission = Submission {
            organization: &target.display_organization,
            role: &target.display_role,
            subject: &payload.subject,
            message: &payload.body,
            reference: &payload.reference,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&submission)
            .send()
            .await
            .map_err(|e| TransportError::Http(format!("api request failed: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TransportError::AuthFailed {
                channel: "api".into(),
                reason: format!("api returned {status}"),
            });
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(TransportError::SendFailed {
                channel: "api".into(),
                reason: format!("api returned {status}: {detail}"),
            });
        }

        tracing::info!(target_id = %target.id, "API submission accepted");
        Ok(SendReceipt::now(ChannelKind::Api, None))
    }
}
