//! Target model and lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::targets::identity::{normalize_org, normalize_role};

/// Lifecycle state of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetState {
    /// Known but never contacted.
    Discovered,
    /// At least one contact has gone out.
    Contacted,
    /// A human replied with interest. Automated dispatch stops for good.
    Engaged,
    /// Parked after a transient problem (soft bounce, operator hold).
    Deferred,
    /// Hard bounce or explicit opt-out. Automated dispatch stops for good.
    DoNotContact,
    /// An explicit rejection came back.
    Rejected,
}

impl TargetState {
    /// Check if this state allows transitioning to another state.
    ///
    /// The `Engaged -> Discovered` and `DoNotContact -> Discovered` edges
    /// exist only for operator resets and are never taken automatically.
    pub fn can_transition_to(&self, next: TargetState) -> bool {
        use TargetState::*;

        matches!(
            (self, next),
            // From Discovered
            (Discovered, Contacted) | (Discovered, Deferred) | (Discovered, DoNotContact) |
            // From Contacted
            (Contacted, Engaged) | (Contacted, Deferred) |
            (Contacted, Rejected) | (Contacted, DoNotContact) |
            // From Deferred (cooldown over, or a late reply arrives)
            (Deferred, Contacted) | (Deferred, Engaged) |
            (Deferred, Rejected) | (Deferred, DoNotContact) |
            // From Rejected (re-application after the cooldown, or a reversal)
            (Rejected, Contacted) | (Rejected, Engaged) | (Rejected, DoNotContact) |
            // From Engaged (a later rejection can still land)
            (Engaged, Rejected) | (Engaged, DoNotContact) |
            // Operator resets
            (Engaged, Discovered) | (DoNotContact, Discovered)
        )
    }

    /// States that permanently suppress automated dispatch.
    pub fn is_suppressed(&self) -> bool {
        matches!(self, Self::Engaged | Self::DoNotContact)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovered => "discovered",
            Self::Contacted => "contacted",
            Self::Engaged => "engaged",
            Self::Deferred => "deferred",
            Self::DoNotContact => "do_not_contact",
            Self::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for TargetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A raw discovery record, as produced by scrapers and manual entry.
///
/// This is the JSONL wire format for `ingest`. Identity fields are kept
/// verbatim here; normalization happens in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawTargetRecord {
    pub organization: String,
    pub role_title: String,
    /// Which discovery source reported this (board name, referral tag).
    pub source_id: String,
    #[serde(default = "Utc::now")]
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub priority_score: f64,
    #[serde(default)]
    pub contact_email: Option<String>,
}

/// A canonical target: one (organization, role) identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: Uuid,
    /// Normalized organization name. Unique together with `role`.
    pub organization: String,
    /// Normalized role title.
    pub role: String,
    /// Organization as first reported, for rendering.
    pub display_organization: String,
    /// Role title as first reported, for rendering.
    pub display_role: String,
    pub state: TargetState,
    /// Opaque ranking score. Higher dispatches first. Merges keep the max.
    pub priority_score: f64,
    pub contact_email: Option<String>,
    /// Earliest time any source reported this identity.
    pub first_seen_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Target {
    /// Build a fresh target from a raw record, normalizing the identity.
    pub fn from_raw(raw: &RawTargetRecord) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization: normalize_org(&raw.organization),
            role: normalize_role(&raw.role_title),
            display_organization: raw.organization.trim().to_string(),
            display_role: raw.role_title.trim().to_string(),
            state: TargetState::Discovered,
            priority_score: raw.priority_score,
            contact_email: raw
                .contact_email
                .as_deref()
                .map(|e| e.trim().to_lowercase())
                .filter(|e| !e.is_empty()),
            first_seen_at: raw.discovered_at,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A provenance row: one discovery source that reported a target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSource {
    pub target_id: Uuid,
    pub source_id: String,
    pub reported_at: DateTime<Utc>,
}

/// A near-miss identity reported by `find_similar`. Never auto-merged.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarTarget {
    pub id: Uuid,
    pub organization: String,
    pub role: String,
    pub similarity: f64,
}
