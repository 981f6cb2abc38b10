//! Eligibility gate — ordered policy checks producing Allow/Deny.
//!
//! `evaluate` is a pure read. It answers "may this target be contacted
//! right now"; it never writes, and callers must not treat an Allow as a
//! reservation. The dispatch orchestrator re-evaluates at send time and
//! relies on the store's one-active-attempt index as the actual race guard.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::QuotaDefaults;
use crate::error::DatabaseError;
use crate::policy::{CompanyPolicy, CooldownCause, QuotaWindow};
use crate::store::Database;
use crate::targets::model::{Target, TargetState};

/// Why a target may not be contacted. Ordered by check priority.
#[derive(Debug, Clone, PartialEq)]
pub enum DenyReason {
    /// Organization is permanently blocked (operator-set).
    Blacklisted,
    /// Target lifecycle suppresses dispatch (engaged / do-not-contact).
    Suppressed(TargetState),
    /// A feedback-driven cooldown is in force for the organization.
    CooldownActive {
        until: DateTime<Utc>,
        cause: Option<CooldownCause>,
    },
    /// A rolling-window contact quota is already used up.
    QuotaExceeded { window: QuotaWindow },
    /// An attempt is still in flight for this target.
    DuplicatePending,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blacklisted => write!(f, "blacklisted"),
            Self::Suppressed(state) => write!(f, "suppressed ({state})"),
            Self::CooldownActive { until, .. } => write!(f, "cooldown active until {until}"),
            Self::QuotaExceeded { window } => write!(f, "{window} quota exceeded"),
            Self::DuplicatePending => write!(f, "attempt already in flight"),
        }
    }
}

/// Gate decision.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Policy evaluation for dispatch eligibility.
pub struct EligibilityGate {
    db: Arc<dyn Database>,
    quotas: QuotaDefaults,
}

impl EligibilityGate {
    pub fn new(db: Arc<dyn Database>, quotas: QuotaDefaults) -> Self {
        Self { db, quotas }
    }

    /// Evaluate a target by id.
    pub async fn evaluate(&self, target_id: Uuid) -> Result<Decision, DatabaseError> {
        let target = self
            .db
            .get_target(target_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "target".into(),
                id: target_id.to_string(),
            })?;
        self.evaluate_target(&target).await
    }

    /// Evaluate an already-loaded target. Checks run cheapest-first; the
    /// first failing check wins.
    pub async fn evaluate_target(&self, target: &Target) -> Result<Decision, DatabaseError> {
        let now = Utc::now();
        let policy = self
            .db
            .get_policy(&target.organization)
            .await?
            .unwrap_or_else(|| CompanyPolicy::with_defaults(&target.organization, &self.quotas));

        if policy.blacklisted {
            return self.deny(target, DenyReason::Blacklisted);
        }

        if target.state.is_suppressed() {
            return self.deny(target, DenyReason::Suppressed(target.state));
        }

        if policy.cooldown_active(now)
            && let Some(until) = policy.cooldown_until
        {
            return self.deny(
                target,
                DenyReason::CooldownActive {
                    until,
                    cause: policy.cooldown_cause,
                },
            );
        }

        if let Some(window) = self.quota_violation(&target.organization, &policy, now).await? {
            return self.deny(target, DenyReason::QuotaExceeded { window });
        }

        if self.db.get_active_attempt(target.id).await?.is_some() {
            return self.deny(target, DenyReason::DuplicatePending);
        }

        Ok(Decision::Allow)
    }

    /// Counting-based quota checks, widest-window last. Only
    /// delivered-derived outcomes count; see `AttemptOutcome::counts_toward_quota`.
    async fn quota_violation(
        &self,
        organization: &str,
        policy: &CompanyPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<QuotaWindow>, DatabaseError> {
        let day_count = self
            .db
            .count_contacts_since(organization, Some(now - Duration::days(1)))
            .await?;
        if day_count >= policy.max_per_day {
            return Ok(Some(QuotaWindow::Day));
        }

        let week_count = self
            .db
            .count_contacts_since(organization, Some(now - Duration::weeks(1)))
            .await?;
        if week_count >= policy.max_per_week {
            return Ok(Some(QuotaWindow::Week));
        }

        let lifetime_count = self.db.count_contacts_since(organization, None).await?;
        if lifetime_count >= policy.max_lifetime {
            return Ok(Some(QuotaWindow::Lifetime));
        }

        Ok(None)
    }

    fn deny(&self, target: &Target, reason: DenyReason) -> Result<Decision, DatabaseError> {
        debug!(
            target_id = %target.id,
            organization = %target.organization,
            reason = %reason,
            "Dispatch denied"
        );
        Ok(Decision::Deny(reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelKind;
    use crate::dispatch::attempt::{Attempt, AttemptOutcome};
    use crate::store::LibSqlBackend;
    use crate::targets::model::RawTargetRecord;

    struct Fixture {
        db: Arc<dyn Database>,
        gate: EligibilityGate,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let gate = EligibilityGate::new(Arc::clone(&db), QuotaDefaults::default());
        Fixture { db, gate }
    }

    async fn insert_target(db: &Arc<dyn Database>, org: &str, role: &str) -> Target {
        let target = Target::from_raw(&RawTargetRecord {
            organization: org.into(),
            role_title: role.into(),
            source_id: "test".into(),
            discovered_at: Utc::now(),
            priority_score: 0.9,
            contact_email: Some(format!("jobs@{}.example", org.to_lowercase())),
        });
        db.insert_target(&target).await.unwrap();
        target
    }

    async fn record_send(db: &Arc<dyn Database>, target_id: Uuid) -> Attempt {
        let attempt = Attempt::queued(target_id, ChannelKind::Email, None, None, "ref");
        db.insert_attempt(&attempt).await.unwrap();
        db.mark_attempt_sent(attempt.id, Utc::now()).await.unwrap();
        attempt
    }

    #[tokio::test]
    async fn fresh_target_is_allowed() {
        let f = fixture().await;
        let target = insert_target(&f.db, "Acme", "Engineer").await;
        assert_eq!(f.gate.evaluate(target.id).await.unwrap(), Decision::Allow);
    }

    #[tokio::test]
    async fn unknown_target_is_not_found() {
        let f = fixture().await;
        let err = f.gate.evaluate(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn blacklist_wins_over_everything() {
        let f = fixture().await;
        let target = insert_target(&f.db, "Acme", "Engineer").await;

        // Pile on a cooldown and an active attempt too; blacklist must
        // still be the reported reason (checked first).
        let mut policy = CompanyPolicy::with_defaults("acme", &QuotaDefaults::default());
        policy.blacklisted = true;
        policy.apply_cooldown(Utc::now() + Duration::days(5), CooldownCause::Rejection);
        f.db.upsert_policy(&policy).await.unwrap();
        let attempt = Attempt::queued(target.id, ChannelKind::Email, None, None, "ref");
        f.db.insert_attempt(&attempt).await.unwrap();

        assert_eq!(
            f.gate.evaluate(target.id).await.unwrap(),
            Decision::Deny(DenyReason::Blacklisted)
        );
    }

    #[tokio::test]
    async fn suppressed_states_deny() {
        let f = fixture().await;
        let target = insert_target(&f.db, "Acme", "Engineer").await;
        f.db.update_target_state(target.id, TargetState::Engaged)
            .await
            .unwrap();

        match f.gate.evaluate(target.id).await.unwrap() {
            Decision::Deny(DenyReason::Suppressed(TargetState::Engaged)) => {}
            other => panic!("expected suppressed denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cooldown_denies_until_expiry() {
        let f = fixture().await;
        let target = insert_target(&f.db, "Acme", "Engineer").await;

        let mut policy = CompanyPolicy::with_defaults("acme", &QuotaDefaults::default());
        policy.apply_cooldown(Utc::now() + Duration::hours(1), CooldownCause::Rejection);
        f.db.upsert_policy(&policy).await.unwrap();

        match f.gate.evaluate(target.id).await.unwrap() {
            Decision::Deny(DenyReason::CooldownActive { cause, .. }) => {
                assert_eq!(cause, Some(CooldownCause::Rejection));
            }
            other => panic!("expected cooldown denial, got {other:?}"),
        }

        // Expired cooldown no longer denies
        let mut policy = f.db.get_policy("acme").await.unwrap().unwrap();
        policy.clear_cooldown();
        policy.apply_cooldown(Utc::now() - Duration::hours(1), CooldownCause::Rejection);
        f.db.upsert_policy(&policy).await.unwrap();
        assert_eq!(f.gate.evaluate(target.id).await.unwrap(), Decision::Allow);
    }

    #[tokio::test]
    async fn day_quota_denies() {
        let f = fixture().await;
        let mut policy = CompanyPolicy::with_defaults("acme", &QuotaDefaults::default());
        policy.max_per_day = 1;
        f.db.upsert_policy(&policy).await.unwrap();

        let first = insert_target(&f.db, "Acme", "Engineer").await;
        let second = insert_target(&f.db, "Acme", "Designer").await;

        let attempt = record_send(&f.db, first.id).await;
        f.db.resolve_attempt(attempt.id, AttemptOutcome::NoResponse)
            .await
            .unwrap();

        assert_eq!(
            f.gate.evaluate(second.id).await.unwrap(),
            Decision::Deny(DenyReason::QuotaExceeded {
                window: QuotaWindow::Day
            })
        );
    }

    #[tokio::test]
    async fn failed_transport_is_quota_exempt() {
        let f = fixture().await;
        let mut policy = CompanyPolicy::with_defaults("acme", &QuotaDefaults::default());
        policy.max_per_day = 1;
        f.db.upsert_policy(&policy).await.unwrap();

        let first = insert_target(&f.db, "Acme", "Engineer").await;
        let second = insert_target(&f.db, "Acme", "Designer").await;

        let attempt = Attempt::queued(first.id, ChannelKind::Email, None, None, "ref");
        f.db.insert_attempt(&attempt).await.unwrap();
        f.db.resolve_attempt(attempt.id, AttemptOutcome::FailedTransport)
            .await
            .unwrap();

        assert_eq!(f.gate.evaluate(second.id).await.unwrap(), Decision::Allow);
    }

    #[tokio::test]
    async fn in_flight_attempt_denies_duplicate() {
        let f = fixture().await;
        // Generous quotas so the duplicate check is what fires
        let mut policy = CompanyPolicy::with_defaults("acme", &QuotaDefaults::default());
        policy.max_per_day = 100;
        policy.max_per_week = 100;
        policy.max_lifetime = 100;
        f.db.upsert_policy(&policy).await.unwrap();

        let target = insert_target(&f.db, "Acme", "Engineer").await;
        record_send(&f.db, target.id).await;

        assert_eq!(
            f.gate.evaluate(target.id).await.unwrap(),
            Decision::Deny(DenyReason::DuplicatePending)
        );
    }

    #[tokio::test]
    async fn resolved_attempt_frees_the_target() {
        let f = fixture().await;
        let mut policy = CompanyPolicy::with_defaults("acme", &QuotaDefaults::default());
        policy.max_per_day = 100;
        policy.max_per_week = 100;
        policy.max_lifetime = 100;
        f.db.upsert_policy(&policy).await.unwrap();

        let target = insert_target(&f.db, "Acme", "Engineer").await;
        let attempt = record_send(&f.db, target.id).await;
        f.db.resolve_attempt(attempt.id, AttemptOutcome::NoResponse)
            .await
            .unwrap();

        assert_eq!(f.gate.evaluate(target.id).await.unwrap(), Decision::Allow);
    }
}
