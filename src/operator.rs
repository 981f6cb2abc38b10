//! Operator console: manual overrides the automation never takes itself.
//!
//! Everything here is audit-logged at info level with the operator's
//! stated reason, since each call overrides a decision the engine made
//! (or would make) on its own.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::QuotaDefaults;
use crate::error::{DatabaseError, DispatchError, Error, Result};
use crate::feedback::types::InboundSignal;
use crate::policy::{CompanyPolicy, CooldownCause};
use crate::store::Database;
use crate::targets::model::{RawTargetRecord, SimilarTarget, Target, TargetState};
use crate::targets::store::TargetStore;

/// Manual override surface over the store.
pub struct OperatorConsole {
    db: Arc<dyn Database>,
    targets: TargetStore,
    quotas: QuotaDefaults,
}

impl OperatorConsole {
    pub fn new(db: Arc<dyn Database>, quotas: QuotaDefaults) -> Self {
        let targets = TargetStore::new(Arc::clone(&db));
        Self {
            db,
            targets,
            quotas,
        }
    }

    /// Blacklist an organization. Takes effect at the next gate check;
    /// in-flight attempts are not recalled.
    pub async fn blacklist(&self, organization: &str, reason: &str) -> Result<()> {
        let mut policy = self.load_or_default(organization).await?;
        policy.blacklisted = true;
        policy.blacklist_reason = Some(reason.to_string());
        policy.updated_at = Utc::now();
        self.db.upsert_policy(&policy).await?;
        info!(organization = %policy.organization, reason = %reason, "Organization blacklisted");
        Ok(())
    }

    /// Lift a blacklist.
    pub async fn unblacklist(&self, organization: &str) -> Result<()> {
        let mut policy = self.require_policy(organization).await?;
        policy.blacklisted = false;
        policy.blacklist_reason = None;
        policy.updated_at = Utc::now();
        self.db.upsert_policy(&policy).await?;
        info!(organization = %policy.organization, "Blacklist lifted");
        Ok(())
    }

    /// Clear an active cooldown ahead of its expiry.
    pub async fn clear_cooldown(&self, organization: &str) -> Result<()> {
        let mut policy = self.require_policy(organization).await?;
        let was = policy.cooldown_until;
        policy.clear_cooldown();
        self.db.upsert_policy(&policy).await?;
        info!(
            organization = %policy.organization,
            cleared_until = ?was,
            "Cooldown cleared by operator"
        );
        Ok(())
    }

    /// Impose a manual cooldown until `until`. A longer existing cooldown
    /// is kept.
    pub async fn impose_cooldown(
        &self,
        organization: &str,
        until: DateTime<Utc>,
    ) -> Result<()> {
        let mut policy = self.load_or_default(organization).await?;
        policy.apply_cooldown(until, CooldownCause::Manual);
        self.db.upsert_policy(&policy).await?;
        info!(organization = %policy.organization, until = %until, "Manual cooldown imposed");
        Ok(())
    }

    /// Reset a terminally suppressed target back to discovered. Only the
    /// operator edges of the state machine allow this; any other state is
    /// rejected rather than silently rewound.
    pub async fn reset_target(&self, target_id: Uuid) -> Result<Target> {
        let target = self.require_target(target_id).await?;
        if !target.state.can_transition_to(TargetState::Discovered) {
            return Err(DispatchError::InvalidTransition {
                entity: "target",
                id: target_id,
                from: target.state.to_string(),
                requested: TargetState::Discovered.to_string(),
            }
            .into());
        }
        self.db
            .update_target_state(target_id, TargetState::Discovered)
            .await?;
        info!(target_id = %target_id, from = %target.state, "Target reset to discovered");
        self.require_target(target_id).await
    }

    /// Mark a target do-not-contact by hand (opt-out received outside the
    /// feedback channel, for example).
    pub async fn suppress_target(&self, target_id: Uuid, reason: &str) -> Result<Target> {
        let target = self.require_target(target_id).await?;
        if !target.state.can_transition_to(TargetState::DoNotContact) {
            return Err(DispatchError::InvalidTransition {
                entity: "target",
                id: target_id,
                from: target.state.to_string(),
                requested: TargetState::DoNotContact.to_string(),
            }
            .into());
        }
        self.db
            .update_target_state(target_id, TargetState::DoNotContact)
            .await?;
        info!(target_id = %target_id, reason = %reason, "Target suppressed by operator");
        self.require_target(target_id).await
    }

    /// Near-miss identities for a raw record, for manual merge review.
    /// The engine reports these but never merges them on its own.
    pub async fn review_similar(&self, raw: &RawTargetRecord) -> Result<Vec<SimilarTarget>> {
        Ok(self.targets.find_similar(raw).await?)
    }

    /// Signals correlation could not attach to an attempt.
    pub async fn unresolved_signals(&self, limit: usize) -> Result<Vec<InboundSignal>> {
        Ok(self.db.list_unresolved_signals(limit).await?)
    }

    async fn load_or_default(&self, organization: &str) -> Result<CompanyPolicy> {
        let key = crate::targets::identity::normalize_org(organization);
        Ok(self
            .db
            .get_policy(&key)
            .await?
            .unwrap_or_else(|| CompanyPolicy::with_defaults(&key, &self.quotas)))
    }

    async fn require_policy(&self, organization: &str) -> Result<CompanyPolicy> {
        let key = crate::targets::identity::normalize_org(organization);
        self.db
            .get_policy(&key)
            .await?
            .ok_or_else(|| {
                Error::Database(DatabaseError::NotFound {
                    entity: "policy".into(),
                    id: key,
                })
            })
    }

    async fn require_target(&self, target_id: Uuid) -> Result<Target> {
        self.db
            .get_target(target_id)
            .await?
            .ok_or_else(|| {
                Error::Database(DatabaseError::NotFound {
                    entity: "target".into(),
                    id: target_id.to_string(),
                })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    struct Fixture {
        db: Arc<dyn Database>,
        console: OperatorConsole,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let console = OperatorConsole::new(Arc::clone(&db), QuotaDefaults::default());
        Fixture { db, console }
    }

    fn raw(org: &str, role: &str) -> RawTargetRecord {
        RawTargetRecord {
            organization: org.into(),
            role_title: role.into(),
            source_id: "test".into(),
            discovered_at: Utc::now(),
            priority_score: 0.5,
            contact_email: None,
        }
    }

    #[tokio::test]
    async fn blacklist_roundtrip() {
        let f = fixture().await;
        f.console
            .blacklist("ACME Corp., Inc.", "asked us to stop")
            .await
            .unwrap();

        // Keyed by normalized name
        let policy = f.db.get_policy("acme").await.unwrap().unwrap();
        assert!(policy.blacklisted);
        assert_eq!(policy.blacklist_reason.as_deref(), Some("asked us to stop"));

        f.console.unblacklist("acme").await.unwrap();
        let policy = f.db.get_policy("acme").await.unwrap().unwrap();
        assert!(!policy.blacklisted);
        assert!(policy.blacklist_reason.is_none());
    }

    #[tokio::test]
    async fn cooldown_impose_and_clear() {
        let f = fixture().await;
        let until = Utc::now() + chrono::Duration::days(30);
        f.console.impose_cooldown("acme", until).await.unwrap();

        let policy = f.db.get_policy("acme").await.unwrap().unwrap();
        assert!(policy.cooldown_active(Utc::now()));
        assert_eq!(policy.cooldown_cause, Some(CooldownCause::Manual));

        f.console.clear_cooldown("acme").await.unwrap();
        let policy = f.db.get_policy("acme").await.unwrap().unwrap();
        assert!(!policy.cooldown_active(Utc::now()));
    }

    #[tokio::test]
    async fn clear_cooldown_without_policy_is_not_found() {
        let f = fixture().await;
        let err = f.console.clear_cooldown("ghost").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Database(DatabaseError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn reset_only_from_operator_edges() {
        let f = fixture().await;
        let target = Target::from_raw(&raw("Acme", "Engineer"));
        f.db.insert_target(&target).await.unwrap();
        f.db.update_target_state(target.id, TargetState::Contacted)
            .await
            .unwrap();
        f.db.update_target_state(target.id, TargetState::Engaged)
            .await
            .unwrap();

        let reset = f.console.reset_target(target.id).await.unwrap();
        assert_eq!(reset.state, TargetState::Discovered);

        // Contacted has no reset edge
        f.db.update_target_state(target.id, TargetState::Contacted)
            .await
            .unwrap();
        let err = f.console.reset_target(target.id).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Dispatch(DispatchError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn manual_suppression() {
        let f = fixture().await;
        let target = Target::from_raw(&raw("Acme", "Engineer"));
        f.db.insert_target(&target).await.unwrap();

        let suppressed = f
            .console
            .suppress_target(target.id, "opted out by phone")
            .await
            .unwrap();
        assert_eq!(suppressed.state, TargetState::DoNotContact);
    }

    #[tokio::test]
    async fn review_similar_reports_near_misses() {
        let f = fixture().await;
        let store = TargetStore::new(Arc::clone(&f.db));
        store
            .upsert(&raw("Acme Widget Labs Inc", "Backend Engineer"))
            .await
            .unwrap();

        let similar = f
            .console
            .review_similar(&raw("Acme Widget Labs Europe", "Backend Engineer"))
            .await
            .unwrap();
        assert_eq!(similar.len(), 1);
        assert!(similar[0].similarity >= 0.7);
    }

    #[tokio::test]
    async fn unresolved_signal_queue() {
        let f = fixture().await;
        assert!(f.console.unresolved_signals(10).await.unwrap().is_empty());
    }
}
