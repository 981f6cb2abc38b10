//! Transport adapters for outbound dispatch.
//!
//! Every channel implements the [`Transport`] trait; the
//! [`TransportRegistry`] holds whichever adapters are configured and routes
//! a target through the deterministic preference order (email, portal, api).

pub mod api;
pub mod email;
pub mod portal;

pub use api::{ApiConfig, ApiTransport};
pub use email::{EmailTransport, SmtpConfig};
pub use portal::{PortalConfig, PortalTransport};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::MessagePayload;
use crate::error::TransportError;
use crate::targets::model::Target;

/// Known transport channels, in stable identifier form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Portal,
    Api,
}

impl ChannelKind {
    /// Deterministic per-target preference order. Email first: it is the
    /// only channel whose delivery failures feed back as bounces.
    pub fn preference_order() -> [ChannelKind; 3] {
        [Self::Email, Self::Portal, Self::Api]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Portal => "portal",
            Self::Api => "api",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a transport reports back after accepting a message.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub channel: ChannelKind,
    /// Address or endpoint the message went to.
    pub recipient: Option<String>,
    pub accepted_at: DateTime<Utc>,
}

impl SendReceipt {
    pub fn now(channel: ChannelKind, recipient: Option<String>) -> Self {
        Self {
            channel,
            recipient,
            accepted_at: Utc::now(),
        }
    }
}

/// A single outbound channel. Implementations know nothing about
/// eligibility or pacing; they take a target and a payload and either
/// deliver or fail with a transport error.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// Whether this transport can address the target at all (e.g. email
    /// needs a contact address). A `false` here removes the channel from
    /// the target's fallback list; it is not a transport failure.
    fn accepts(&self, target: &Target) -> bool;

    async fn send(
        &self,
        target: &Target,
        payload: &MessagePayload,
    ) -> Result<SendReceipt, TransportError>;
}

/// Registry of configured transports.
#[derive(Default)]
pub struct TransportRegistry {
    transports: Vec<Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the environment: each adapter registers
    /// itself only when its own variables are set.
    pub fn from_env() -> Self {
        let mut registry = Self::new();
        if let Some(config) = SmtpConfig::from_env() {
            registry.register(Arc::new(EmailTransport::new(config)));
        }
        if let Some(config) = PortalConfig::from_env() {
            registry.register(Arc::new(PortalTransport::new(config)));
        }
        if let Some(config) = ApiConfig::from_env() {
            registry.register(Arc::new(ApiTransport::new(config)));
        }
        registry
    }

    pub fn register(&mut self, transport: Arc<dyn Transport>) {
        self.transports.push(transport);
    }

    pub fn get(&self, kind: ChannelKind) -> Option<Arc<dyn Transport>> {
        self.transports.iter().find(|t| t.kind() == kind).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    pub fn len(&self) -> usize {
        self.transports.len()
    }

    /// Configured transports that accept the target, in preference order.
    pub fn route(&self, target: &Target) -> Vec<Arc<dyn Transport>> {
        ChannelKind::preference_order()
            .into_iter()
            .filter_map(|kind| self.get(kind))
            .filter(|t| t.accepts(target))
            .collect()
    }
}
