//! libSQL backend — async `Database` trait implementation.
//!
//! Single connection reused for all operations; `libsql::Connection` is
//! `Send + Sync` and safe for concurrent async use. All datetimes are
//! stored as RFC 3339 text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::channels::ChannelKind;
use crate::dispatch::attempt::{Attempt, AttemptOutcome};
use crate::error::DatabaseError;
use crate::feedback::types::{Classification, Confidence, InboundSignal};
use crate::policy::{CompanyPolicy, CooldownCause};
use crate::store::migrations;
use crate::store::traits::{Database, IdentityRow};
use crate::targets::model::{Target, TargetSource, TargetState};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_optional_uuid(s: &Option<String>) -> Option<Uuid> {
    s.as_ref().and_then(|s| Uuid::parse_str(s).ok())
}

/// Parse a state string from the DB.
fn str_to_state(s: &str) -> TargetState {
    match s {
        "contacted" => TargetState::Contacted,
        "engaged" => TargetState::Engaged,
        "deferred" => TargetState::Deferred,
        "do_not_contact" => TargetState::DoNotContact,
        "rejected" => TargetState::Rejected,
        _ => TargetState::Discovered,
    }
}

fn str_to_outcome(s: &str) -> AttemptOutcome {
    match s {
        "sent" => AttemptOutcome::Sent,
        "failed_transport" => AttemptOutcome::FailedTransport,
        "bounced" => AttemptOutcome::Bounced,
        "answered" => AttemptOutcome::Answered,
        "no_response" => AttemptOutcome::NoResponse,
        _ => AttemptOutcome::Pending,
    }
}

fn str_to_channel(s: &str) -> ChannelKind {
    match s {
        "portal" => ChannelKind::Portal,
        "api" => ChannelKind::Api,
        _ => ChannelKind::Email,
    }
}

fn str_to_classification(s: &str) -> Classification {
    match s {
        "bounce_hard" => Classification::BounceHard,
        "bounce_soft" => Classification::BounceSoft,
        "bounce_unknown" => Classification::BounceUnknown,
        "reply_rejection" => Classification::ReplyRejection,
        "reply_interview_or_next_step" => Classification::ReplyInterviewOrNextStep,
        "reply_auto_ack" => Classification::ReplyAutoAck,
        "reply_personal" => Classification::ReplyPersonal,
        _ => Classification::ReplyOther,
    }
}

fn str_to_confidence(s: &str) -> Confidence {
    match s {
        "high" => Confidence::High,
        "medium" => Confidence::Medium,
        _ => Confidence::Low,
    }
}

fn str_to_cause(s: &str) -> CooldownCause {
    match s {
        "rejection" => CooldownCause::Rejection,
        "bounce_soft" => CooldownCause::BounceSoft,
        "bounce_hard" => CooldownCause::BounceHard,
        "bounce_unknown" => CooldownCause::BounceUnknown,
        _ => CooldownCause::Manual,
    }
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Map a libsql Row to a Target. Column order matches TARGET_COLUMNS.
fn row_to_target(row: &libsql::Row) -> Result<Target, libsql::Error> {
    let id_str: String = row.get(0)?;
    let state_str: String = row.get(5)?;
    let first_seen_str: String = row.get(8)?;
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;

    Ok(Target {
        id: parse_uuid(&id_str),
        organization: row.get(1)?,
        role: row.get(2)?,
        display_organization: row.get(3)?,
        display_role: row.get(4)?,
        state: str_to_state(&state_str),
        priority_score: row.get(6)?,
        contact_email: row.get(7).ok(),
        first_seen_at: parse_datetime(&first_seen_str),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to an Attempt. Column order matches ATTEMPT_COLUMNS.
fn row_to_attempt(row: &libsql::Row) -> Result<Attempt, libsql::Error> {
    let id_str: String = row.get(0)?;
    let target_str: String = row.get(1)?;
    let channel_str: String = row.get(2)?;
    let outcome_str: String = row.get(3)?;
    let queued_str: String = row.get(7)?;
    let sent_str: Option<String> = row.get(8).ok();
    let resolved_str: Option<String> = row.get(9).ok();

    Ok(Attempt {
        id: parse_uuid(&id_str),
        target_id: parse_uuid(&target_str),
        channel: str_to_channel(&channel_str),
        outcome: str_to_outcome(&outcome_str),
        recipient: row.get(4).ok(),
        subject: row.get(5).ok(),
        content_ref: row.get(6)?,
        queued_at: parse_datetime(&queued_str),
        sent_at: parse_optional_datetime(&sent_str),
        resolved_at: parse_optional_datetime(&resolved_str),
    })
}

/// Map a libsql Row to a CompanyPolicy. Column order matches POLICY_COLUMNS.
fn row_to_policy(row: &libsql::Row) -> Result<CompanyPolicy, libsql::Error> {
    let blacklisted: i64 = row.get(1)?;
    let cooldown_until_str: Option<String> = row.get(3).ok();
    let cooldown_cause_str: Option<String> = row.get(4).ok();
    let max_per_day: i64 = row.get(5)?;
    let max_per_week: i64 = row.get(6)?;
    let max_lifetime: i64 = row.get(7)?;
    let updated_str: String = row.get(8)?;

    Ok(CompanyPolicy {
        organization: row.get(0)?,
        blacklisted: blacklisted != 0,
        blacklist_reason: row.get(2).ok(),
        cooldown_until: parse_optional_datetime(&cooldown_until_str),
        cooldown_cause: cooldown_cause_str.as_deref().map(str_to_cause),
        max_per_day: max_per_day.max(0) as u32,
        max_per_week: max_per_week.max(0) as u32,
        max_lifetime: max_lifetime.max(0) as u32,
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to an InboundSignal. Column order matches SIGNAL_COLUMNS.
fn row_to_signal(row: &libsql::Row) -> Result<InboundSignal, libsql::Error> {
    let id_str: String = row.get(0)?;
    let received_str: String = row.get(4)?;
    let headers_json: String = row.get(5)?;
    let classification_str: String = row.get(6)?;
    let confidence_str: String = row.get(7)?;
    let attempt_str: Option<String> = row.get(10).ok();
    let target_str: Option<String> = row.get(11).ok();
    let created_str: String = row.get(12)?;

    Ok(InboundSignal {
        id: parse_uuid(&id_str),
        sender: row.get(1)?,
        subject: row.get(2).ok(),
        body: row.get(3)?,
        received_at: parse_datetime(&received_str),
        header_names: serde_json::from_str(&headers_json).unwrap_or_default(),
        classification: str_to_classification(&classification_str),
        confidence: str_to_confidence(&confidence_str),
        matched_rule: row.get(8).ok(),
        extracted_address: row.get(9).ok(),
        attempt_id: parse_optional_uuid(&attempt_str),
        target_id: parse_optional_uuid(&target_str),
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const TARGET_COLUMNS: &str = "id, organization, role, display_organization, display_role, state, priority_score, contact_email, first_seen_at, created_at, updated_at";

const ATTEMPT_COLUMNS: &str =
    "id, target_id, channel, outcome, recipient, subject, content_ref, queued_at, sent_at, resolved_at";

const POLICY_COLUMNS: &str = "organization, blacklisted, blacklist_reason, cooldown_until, cooldown_cause, max_per_day, max_per_week, max_lifetime, updated_at";

const SIGNAL_COLUMNS: &str = "id, sender, subject, body, received_at, header_names, classification, confidence, matched_rule, extracted_address, attempt_id, target_id, created_at";

const QUOTA_OUTCOMES: &str = "('sent', 'bounced', 'answered', 'no_response')";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Targets ─────────────────────────────────────────────────────

    async fn insert_target(&self, target: &Target) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO targets (id, organization, role, display_organization, display_role, state, priority_score, contact_email, first_seen_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    target.id.to_string(),
                    target.organization.clone(),
                    target.role.clone(),
                    target.display_organization.clone(),
                    target.display_role.clone(),
                    target.state.as_str(),
                    target.priority_score,
                    opt_text(target.contact_email.as_deref()),
                    target.first_seen_at.to_rfc3339(),
                    target.created_at.to_rfc3339(),
                    target.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE constraint failed") {
                    DatabaseError::Constraint(format!(
                        "identity ({}, {}) already exists",
                        target.organization, target.role
                    ))
                } else {
                    DatabaseError::Query(format!("insert_target: {msg}"))
                }
            })?;

        debug!(target_id = %target.id, organization = %target.organization, "Target inserted");
        Ok(())
    }

    async fn get_target(&self, id: Uuid) -> Result<Option<Target>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TARGET_COLUMNS} FROM targets WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_target: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let target = row_to_target(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_target row parse: {e}")))?;
                Ok(Some(target))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_target: {e}"))),
        }
    }

    async fn get_target_by_identity(
        &self,
        organization: &str,
        role: &str,
    ) -> Result<Option<Target>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TARGET_COLUMNS} FROM targets WHERE organization = ?1 AND role = ?2"
                ),
                params![organization, role],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_target_by_identity: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let target = row_to_target(&row).map_err(|e| {
                    DatabaseError::Query(format!("get_target_by_identity row parse: {e}"))
                })?;
                Ok(Some(target))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_target_by_identity: {e}"))),
        }
    }

    async fn merge_target_fields(
        &self,
        id: Uuid,
        priority_score: f64,
        contact_email: Option<&str>,
        first_seen_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE targets SET
                     priority_score = MAX(priority_score, ?1),
                     contact_email = COALESCE(contact_email, ?2),
                     first_seen_at = MIN(first_seen_at, ?3),
                     updated_at = ?4
                 WHERE id = ?5",
                params![
                    priority_score,
                    opt_text(contact_email),
                    first_seen_at.to_rfc3339(),
                    now,
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("merge_target_fields: {e}")))?;
        Ok(())
    }

    async fn update_target_state(
        &self,
        id: Uuid,
        state: TargetState,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE targets SET state = ?1, updated_at = ?2 WHERE id = ?3",
                params![state.as_str(), now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_target_state: {e}")))?;

        debug!(target_id = %id, state = %state, "Target state updated");
        Ok(())
    }

    async fn list_dispatchable_targets(
        &self,
        limit: usize,
    ) -> Result<Vec<Target>, DatabaseError> {
        // The cheap eligibility predicates run inside the selection, so a
        // blocked high-priority target cannot occupy a LIMIT slot that an
        // eligible lower-priority one would have used. Quota windows are
        // left to the gate, which re-checks everything at dispatch time.
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TARGET_COLUMNS} FROM targets
                     WHERE state NOT IN ('engaged', 'do_not_contact')
                       AND NOT EXISTS (
                           SELECT 1 FROM attempts a
                           WHERE a.target_id = targets.id
                             AND a.outcome IN ('pending', 'sent'))
                       AND NOT EXISTS (
                           SELECT 1 FROM company_policies p
                           WHERE p.organization = targets.organization
                             AND (p.blacklisted = 1
                                  OR (p.cooldown_until IS NOT NULL
                                      AND p.cooldown_until > ?1)))
                     ORDER BY priority_score DESC, first_seen_at ASC
                     LIMIT ?2"
                ),
                params![now, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_dispatchable_targets: {e}")))?;

        let mut targets = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_dispatchable_targets: {e}")))?
        {
            targets.push(row_to_target(&row).map_err(|e| {
                DatabaseError::Query(format!("list_dispatchable_targets row parse: {e}"))
            })?);
        }
        Ok(targets)
    }

    async fn list_identities(&self) -> Result<Vec<IdentityRow>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT id, organization, role FROM targets", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_identities: {e}")))?;

        let mut identities = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_identities: {e}")))?
        {
            let id_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("list_identities row parse: {e}")))?;
            identities.push(IdentityRow {
                id: parse_uuid(&id_str),
                organization: row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("list_identities row parse: {e}")))?,
                role: row
                    .get(2)
                    .map_err(|e| DatabaseError::Query(format!("list_identities row parse: {e}")))?,
            });
        }
        Ok(identities)
    }

    async fn add_target_source(
        &self,
        target_id: Uuid,
        source_id: &str,
        reported_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO target_sources (target_id, source_id, reported_at)
                 VALUES (?1, ?2, ?3)",
                params![target_id.to_string(), source_id, reported_at.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_target_source: {e}")))?;
        Ok(())
    }

    async fn get_target_sources(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<TargetSource>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT target_id, source_id, reported_at FROM target_sources
                 WHERE target_id = ?1 ORDER BY reported_at ASC",
                params![target_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_target_sources: {e}")))?;

        let mut sources = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_target_sources: {e}")))?
        {
            let target_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("get_target_sources row parse: {e}")))?;
            let reported_str: String = row
                .get(2)
                .map_err(|e| DatabaseError::Query(format!("get_target_sources row parse: {e}")))?;
            sources.push(TargetSource {
                target_id: parse_uuid(&target_str),
                source_id: row.get(1).map_err(|e| {
                    DatabaseError::Query(format!("get_target_sources row parse: {e}"))
                })?,
                reported_at: parse_datetime(&reported_str),
            });
        }
        Ok(sources)
    }

    // ── Policies ────────────────────────────────────────────────────

    async fn get_policy(
        &self,
        organization: &str,
    ) -> Result<Option<CompanyPolicy>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {POLICY_COLUMNS} FROM company_policies WHERE organization = ?1"
                ),
                params![organization],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_policy: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let policy = row_to_policy(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_policy row parse: {e}")))?;
                Ok(Some(policy))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_policy: {e}"))),
        }
    }

    async fn upsert_policy(&self, policy: &CompanyPolicy) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO company_policies (organization, blacklisted, blacklist_reason, cooldown_until, cooldown_cause, max_per_day, max_per_week, max_lifetime, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(organization) DO UPDATE SET
                     blacklisted = excluded.blacklisted,
                     blacklist_reason = excluded.blacklist_reason,
                     cooldown_until = excluded.cooldown_until,
                     cooldown_cause = excluded.cooldown_cause,
                     max_per_day = excluded.max_per_day,
                     max_per_week = excluded.max_per_week,
                     max_lifetime = excluded.max_lifetime,
                     updated_at = excluded.updated_at",
                params![
                    policy.organization.clone(),
                    i64::from(policy.blacklisted),
                    opt_text(policy.blacklist_reason.as_deref()),
                    opt_text(policy.cooldown_until.map(|d| d.to_rfc3339()).as_deref()),
                    opt_text(policy.cooldown_cause.map(|c| c.as_str()).as_deref()),
                    i64::from(policy.max_per_day),
                    i64::from(policy.max_per_week),
                    i64::from(policy.max_lifetime),
                    policy.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_policy: {e}")))?;

        debug!(organization = %policy.organization, blacklisted = policy.blacklisted, "Policy upserted");
        Ok(())
    }

    // ── Attempts ────────────────────────────────────────────────────

    async fn insert_attempt(&self, attempt: &Attempt) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO attempts (id, target_id, channel, outcome, recipient, subject, content_ref, queued_at, sent_at, resolved_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    attempt.id.to_string(),
                    attempt.target_id.to_string(),
                    attempt.channel.as_str(),
                    attempt.outcome.as_str(),
                    opt_text(attempt.recipient.as_deref()),
                    opt_text(attempt.subject.as_deref()),
                    attempt.content_ref.clone(),
                    attempt.queued_at.to_rfc3339(),
                    opt_text(attempt.sent_at.map(|d| d.to_rfc3339()).as_deref()),
                    opt_text(attempt.resolved_at.map(|d| d.to_rfc3339()).as_deref()),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE constraint failed") {
                    DatabaseError::DuplicateActive {
                        target_id: attempt.target_id,
                    }
                } else {
                    DatabaseError::Query(format!("insert_attempt: {msg}"))
                }
            })?;

        debug!(attempt_id = %attempt.id, target_id = %attempt.target_id, channel = %attempt.channel, "Attempt recorded");
        Ok(())
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<Attempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_attempt: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let attempt = row_to_attempt(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_attempt row parse: {e}")))?;
                Ok(Some(attempt))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_attempt: {e}"))),
        }
    }

    async fn get_active_attempt(
        &self,
        target_id: Uuid,
    ) -> Result<Option<Attempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM attempts
                     WHERE target_id = ?1 AND outcome IN ('pending', 'sent')
                     LIMIT 1"
                ),
                params![target_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_active_attempt: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let attempt = row_to_attempt(&row).map_err(|e| {
                    DatabaseError::Query(format!("get_active_attempt row parse: {e}"))
                })?;
                Ok(Some(attempt))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_active_attempt: {e}"))),
        }
    }

    async fn list_attempts_for_target(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<Attempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM attempts
                     WHERE target_id = ?1
                     ORDER BY queued_at DESC"
                ),
                params![target_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_attempts_for_target: {e}")))?;

        let mut attempts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_attempts_for_target: {e}")))?
        {
            attempts.push(row_to_attempt(&row).map_err(|e| {
                DatabaseError::Query(format!("list_attempts_for_target row parse: {e}"))
            })?);
        }
        Ok(attempts)
    }

    async fn mark_attempt_sent(
        &self,
        id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE attempts SET outcome = 'sent', sent_at = ?1 WHERE id = ?2",
                params![sent_at.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_attempt_sent: {e}")))?;

        debug!(attempt_id = %id, "Attempt marked sent");
        Ok(())
    }

    async fn resolve_attempt(
        &self,
        id: Uuid,
        outcome: AttemptOutcome,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE attempts SET outcome = ?1, resolved_at = ?2 WHERE id = ?3",
                params![outcome.as_str(), now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("resolve_attempt: {e}")))?;

        debug!(attempt_id = %id, outcome = %outcome, "Attempt resolved");
        Ok(())
    }

    async fn count_contacts_since(
        &self,
        organization: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<u32, DatabaseError> {
        let mut rows = match since {
            Some(since) => self
                .conn()
                .query(
                    &format!(
                        "SELECT COUNT(*) FROM attempts a
                         JOIN targets t ON a.target_id = t.id
                         WHERE t.organization = ?1
                           AND a.outcome IN {QUOTA_OUTCOMES}
                           AND COALESCE(a.sent_at, a.queued_at) >= ?2"
                    ),
                    params![organization, since.to_rfc3339()],
                )
                .await,
            None => self
                .conn()
                .query(
                    &format!(
                        "SELECT COUNT(*) FROM attempts a
                         JOIN targets t ON a.target_id = t.id
                         WHERE t.organization = ?1
                           AND a.outcome IN {QUOTA_OUTCOMES}"
                    ),
                    params![organization],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("count_contacts_since: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_contacts_since: {e}")))?;

        match row {
            Some(row) => {
                let count: i64 = row.get(0).map_err(|e| {
                    DatabaseError::Query(format!("count_contacts_since row parse: {e}"))
                })?;
                Ok(count.max(0) as u32)
            }
            None => Ok(0),
        }
    }

    async fn expire_stale_attempts(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let affected = self
            .conn()
            .execute(
                "UPDATE attempts SET outcome = 'no_response', resolved_at = ?1
                 WHERE outcome IN ('pending', 'sent')
                   AND COALESCE(sent_at, queued_at) < ?2",
                params![now, cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("expire_stale_attempts: {e}")))?;

        Ok(affected as usize)
    }

    async fn list_attempts_for_recipient(
        &self,
        recipient: &str,
        limit: usize,
    ) -> Result<Vec<Attempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM attempts
                     WHERE lower(recipient) = lower(?1)
                     ORDER BY queued_at DESC
                     LIMIT ?2"
                ),
                params![recipient, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_attempts_for_recipient: {e}")))?;

        let mut attempts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_attempts_for_recipient: {e}")))?
        {
            attempts.push(row_to_attempt(&row).map_err(|e| {
                DatabaseError::Query(format!("list_attempts_for_recipient row parse: {e}"))
            })?);
        }
        Ok(attempts)
    }

    async fn list_recent_attempts(&self, limit: usize) -> Result<Vec<Attempt>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ATTEMPT_COLUMNS} FROM attempts
                     ORDER BY queued_at DESC
                     LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recent_attempts: {e}")))?;

        let mut attempts = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recent_attempts: {e}")))?
        {
            attempts.push(row_to_attempt(&row).map_err(|e| {
                DatabaseError::Query(format!("list_recent_attempts row parse: {e}"))
            })?);
        }
        Ok(attempts)
    }

    // ── Inbound signals ─────────────────────────────────────────────

    async fn insert_signal(&self, signal: &InboundSignal) -> Result<(), DatabaseError> {
        let headers_json = serde_json::to_string(&signal.header_names)
            .map_err(|e| DatabaseError::Serialization(format!("header_names: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO inbound_signals (id, sender, subject, body, received_at, header_names, classification, confidence, matched_rule, extracted_address, attempt_id, target_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    signal.id.to_string(),
                    signal.sender.clone(),
                    opt_text(signal.subject.as_deref()),
                    signal.body.clone(),
                    signal.received_at.to_rfc3339(),
                    headers_json,
                    signal.classification.as_str(),
                    signal.confidence.as_str(),
                    opt_text(signal.matched_rule.as_deref()),
                    opt_text(signal.extracted_address.as_deref()),
                    opt_text(signal.attempt_id.map(|u| u.to_string()).as_deref()),
                    opt_text(signal.target_id.map(|u| u.to_string()).as_deref()),
                    signal.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_signal: {e}")))?;

        debug!(
            signal_id = %signal.id,
            classification = %signal.classification,
            resolved = signal.attempt_id.is_some(),
            "Signal stored"
        );
        Ok(())
    }

    async fn get_signal(&self, id: Uuid) -> Result<Option<InboundSignal>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SIGNAL_COLUMNS} FROM inbound_signals WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_signal: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let signal = row_to_signal(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_signal row parse: {e}")))?;
                Ok(Some(signal))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_signal: {e}"))),
        }
    }

    async fn list_signals_for_target(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<InboundSignal>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SIGNAL_COLUMNS} FROM inbound_signals
                     WHERE target_id = ?1
                     ORDER BY received_at DESC"
                ),
                params![target_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_signals_for_target: {e}")))?;

        let mut signals = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_signals_for_target: {e}")))?
        {
            signals.push(row_to_signal(&row).map_err(|e| {
                DatabaseError::Query(format!("list_signals_for_target row parse: {e}"))
            })?);
        }
        Ok(signals)
    }

    async fn list_unresolved_signals(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundSignal>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SIGNAL_COLUMNS} FROM inbound_signals
                     WHERE attempt_id IS NULL
                     ORDER BY received_at DESC
                     LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_unresolved_signals: {e}")))?;

        let mut signals = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_unresolved_signals: {e}")))?
        {
            signals.push(row_to_signal(&row).map_err(|e| {
                DatabaseError::Query(format!("list_unresolved_signals row parse: {e}"))
            })?);
        }
        Ok(signals)
    }
}
