//! Per-organization contact policy: blacklist, cooldown, quotas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QuotaDefaults;

/// Why a cooldown was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CooldownCause {
    Rejection,
    BounceSoft,
    BounceHard,
    BounceUnknown,
    /// Set by an operator, not the classifier.
    Manual,
}

impl CooldownCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rejection => "rejection",
            Self::BounceSoft => "bounce_soft",
            Self::BounceHard => "bounce_hard",
            Self::BounceUnknown => "bounce_unknown",
            Self::Manual => "manual",
        }
    }
}

impl std::fmt::Display for CooldownCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rolling window a quota count is taken over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaWindow {
    Day,
    Week,
    Lifetime,
}

impl std::fmt::Display for QuotaWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Day => "day",
            Self::Week => "week",
            Self::Lifetime => "lifetime",
        };
        write!(f, "{s}")
    }
}

/// Contact policy for one organization, keyed by normalized name.
///
/// The blacklist flag is only ever written by the operator console.
/// Cooldowns are written by the feedback classifier and cleared by the
/// operator console.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanyPolicy {
    pub organization: String,
    pub blacklisted: bool,
    pub blacklist_reason: Option<String>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub cooldown_cause: Option<CooldownCause>,
    pub max_per_day: u32,
    pub max_per_week: u32,
    pub max_lifetime: u32,
    pub updated_at: DateTime<Utc>,
}

impl CompanyPolicy {
    /// A fresh policy for an organization with no explicit row, seeded
    /// from the configured defaults.
    pub fn with_defaults(organization: &str, defaults: &QuotaDefaults) -> Self {
        Self {
            organization: organization.to_string(),
            blacklisted: false,
            blacklist_reason: None,
            cooldown_until: None,
            cooldown_cause: None,
            max_per_day: defaults.max_per_day,
            max_per_week: defaults.max_per_week,
            max_lifetime: defaults.max_lifetime,
            updated_at: Utc::now(),
        }
    }

    /// Whether a cooldown is in force at `now`.
    pub fn cooldown_active(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }

    /// Apply a cooldown ending at `until`. A longer existing cooldown wins;
    /// cooldowns never shorten each other.
    pub fn apply_cooldown(&mut self, until: DateTime<Utc>, cause: CooldownCause) {
        match self.cooldown_until {
            Some(existing) if existing >= until => {}
            _ => {
                self.cooldown_until = Some(until);
                self.cooldown_cause = Some(cause);
            }
        }
        self.updated_at = Utc::now();
    }

    /// Clear any cooldown (operator override).
    pub fn clear_cooldown(&mut self) {
        self.cooldown_until = None;
        self.cooldown_cause = None;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn policy() -> CompanyPolicy {
        CompanyPolicy::with_defaults("acme", &QuotaDefaults::default())
    }

    #[test]
    fn fresh_policy_has_no_restrictions() {
        let p = policy();
        assert!(!p.blacklisted);
        assert!(!p.cooldown_active(Utc::now()));
    }

    #[test]
    fn cooldown_expires() {
        let mut p = policy();
        let now = Utc::now();
        p.apply_cooldown(now + Duration::hours(1), CooldownCause::Rejection);
        assert!(p.cooldown_active(now));
        assert!(!p.cooldown_active(now + Duration::hours(2)));
    }

    #[test]
    fn longer_cooldown_wins() {
        let mut p = policy();
        let now = Utc::now();
        p.apply_cooldown(now + Duration::days(90), CooldownCause::Rejection);
        p.apply_cooldown(now + Duration::days(3), CooldownCause::BounceSoft);
        assert_eq!(p.cooldown_cause, Some(CooldownCause::Rejection));
        assert!(p.cooldown_active(now + Duration::days(30)));
    }

    #[test]
    fn clear_cooldown_resets_both_fields() {
        let mut p = policy();
        p.apply_cooldown(Utc::now() + Duration::days(1), CooldownCause::BounceHard);
        p.clear_cooldown();
        assert!(p.cooldown_until.is_none());
        assert!(p.cooldown_cause.is_none());
    }
}
