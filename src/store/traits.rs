//! Unified `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::dispatch::attempt::{Attempt, AttemptOutcome};
use crate::error::DatabaseError;
use crate::feedback::types::InboundSignal;
use crate::policy::CompanyPolicy;
use crate::targets::model::{Target, TargetSource, TargetState};

/// A bare identity row, for similarity scans.
#[derive(Debug, Clone)]
pub struct IdentityRow {
    pub id: Uuid,
    pub organization: String,
    pub role: String,
}

/// Backend-agnostic database trait covering targets, policies, attempts,
/// and inbound signals.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Targets ─────────────────────────────────────────────────────

    /// Insert a new target.
    async fn insert_target(&self, target: &Target) -> Result<(), DatabaseError>;

    /// Get a target by ID.
    async fn get_target(&self, id: Uuid) -> Result<Option<Target>, DatabaseError>;

    /// Look up a target by its normalized identity.
    async fn get_target_by_identity(
        &self,
        organization: &str,
        role: &str,
    ) -> Result<Option<Target>, DatabaseError>;

    /// Merge new discovery data into an existing target: earliest
    /// first-seen wins, highest priority wins, a missing contact email is
    /// filled in. Never touches state.
    async fn merge_target_fields(
        &self,
        id: Uuid,
        priority_score: f64,
        contact_email: Option<&str>,
        first_seen_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Update a target's lifecycle state.
    async fn update_target_state(
        &self,
        id: Uuid,
        state: TargetState,
    ) -> Result<(), DatabaseError>;

    /// Dispatch candidates, best first: priority descending, then
    /// first-seen ascending. Excludes suppressive states, targets with an
    /// active attempt, and organizations blacklisted or in cooldown, so
    /// blocked targets never occupy `limit` slots. Quota windows are the
    /// gate's job.
    async fn list_dispatchable_targets(
        &self,
        limit: usize,
    ) -> Result<Vec<Target>, DatabaseError>;

    /// All identities, for the fuzzy-similarity scan.
    async fn list_identities(&self) -> Result<Vec<IdentityRow>, DatabaseError>;

    /// Record that a source reported a target. Idempotent per
    /// (target, source) pair.
    async fn add_target_source(
        &self,
        target_id: Uuid,
        source_id: &str,
        reported_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// List provenance rows for a target.
    async fn get_target_sources(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<TargetSource>, DatabaseError>;

    // ── Policies ────────────────────────────────────────────────────

    /// Get the policy row for an organization, if one exists.
    async fn get_policy(
        &self,
        organization: &str,
    ) -> Result<Option<CompanyPolicy>, DatabaseError>;

    /// Insert or replace a policy row.
    async fn upsert_policy(&self, policy: &CompanyPolicy) -> Result<(), DatabaseError>;

    // ── Attempts ────────────────────────────────────────────────────

    /// Insert a write-ahead attempt. Fails with
    /// [`DatabaseError::DuplicateActive`] when the target already holds an
    /// active (pending/sent) attempt; the partial unique index is the
    /// authority, not a prior read.
    async fn insert_attempt(&self, attempt: &Attempt) -> Result<(), DatabaseError>;

    /// Get an attempt by ID.
    async fn get_attempt(&self, id: Uuid) -> Result<Option<Attempt>, DatabaseError>;

    /// The active (pending/sent) attempt for a target, if any.
    async fn get_active_attempt(
        &self,
        target_id: Uuid,
    ) -> Result<Option<Attempt>, DatabaseError>;

    /// All attempts for a target, most recent first.
    async fn list_attempts_for_target(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<Attempt>, DatabaseError>;

    /// Mark an attempt sent.
    async fn mark_attempt_sent(
        &self,
        id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Resolve an attempt to a terminal outcome.
    async fn resolve_attempt(
        &self,
        id: Uuid,
        outcome: AttemptOutcome,
    ) -> Result<(), DatabaseError>;

    /// Count quota-relevant contacts for an organization since `since`
    /// (or ever, when `None`).
    async fn count_contacts_since(
        &self,
        organization: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u32, DatabaseError>;

    /// Age active attempts queued/sent before `cutoff` to no-response.
    /// Returns the number of attempts swept.
    async fn expire_stale_attempts(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;

    /// Attempts addressed to a recipient, most recent first.
    async fn list_attempts_for_recipient(
        &self,
        recipient: &str,
        limit: usize,
    ) -> Result<Vec<Attempt>, DatabaseError>;

    /// Most recent attempts regardless of target, for the subject-based
    /// correlation fallback.
    async fn list_recent_attempts(&self, limit: usize) -> Result<Vec<Attempt>, DatabaseError>;

    // ── Inbound signals ─────────────────────────────────────────────

    /// Store a classified signal. Signals are immutable; there is no
    /// update path.
    async fn insert_signal(&self, signal: &InboundSignal) -> Result<(), DatabaseError>;

    /// Get a signal by ID.
    async fn get_signal(&self, id: Uuid) -> Result<Option<InboundSignal>, DatabaseError>;

    /// Signals for a target, most recent first.
    async fn list_signals_for_target(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<InboundSignal>, DatabaseError>;

    /// Signals that correlation could not resolve, most recent first.
    async fn list_unresolved_signals(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundSignal>, DatabaseError>;
}
