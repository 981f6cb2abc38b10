//! Target store — cross-source dedup, merge, and similarity reporting.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::Database;
use crate::targets::identity::{normalize_org, normalize_role, token_similarity};
use crate::targets::model::{RawTargetRecord, SimilarTarget, Target};

/// Token-set similarity at or above this is reported as a near-duplicate.
pub const SIMILARITY_THRESHOLD: f64 = 0.7;

/// Result of an upsert: either a fresh target or a merge into an existing
/// one. Both carry the canonical target id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Created(Uuid),
    Merged(Uuid),
}

impl Upserted {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Created(id) | Self::Merged(id) => *id,
        }
    }
}

/// Canonical target identity store.
///
/// Exact normalized-identity matches merge automatically; fuzzy matches are
/// only ever reported through [`find_similar`](Self::find_similar) and left
/// for operator review.
pub struct TargetStore {
    db: Arc<dyn Database>,
}

impl TargetStore {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Merge a raw discovery record into the store.
    ///
    /// Identical identities union their provenance and keep the best of
    /// each merged field (earliest first-seen, highest priority, first
    /// known contact address). Idempotent for identical records.
    pub async fn upsert(&self, raw: &RawTargetRecord) -> Result<Upserted, DatabaseError> {
        let organization = normalize_org(&raw.organization);
        let role = normalize_role(&raw.role_title);

        if let Some(existing) = self.db.get_target_by_identity(&organization, &role).await? {
            self.merge_into(existing.id, raw).await?;
            debug!(
                target_id = %existing.id,
                organization = %organization,
                source = %raw.source_id,
                "Merged discovery record into existing target"
            );
            return Ok(Upserted::Merged(existing.id));
        }

        let target = Target::from_raw(raw);
        match self.db.insert_target(&target).await {
            Ok(()) => {
                self.db
                    .add_target_source(target.id, &raw.source_id, raw.discovered_at)
                    .await?;
                info!(
                    target_id = %target.id,
                    organization = %target.organization,
                    role = %target.role,
                    source = %raw.source_id,
                    "New target discovered"
                );
                Ok(Upserted::Created(target.id))
            }
            // Lost a race with a concurrent upsert of the same identity;
            // fall back to merging into the winner's row.
            Err(DatabaseError::Constraint(_)) => {
                let existing = self
                    .db
                    .get_target_by_identity(&organization, &role)
                    .await?
                    .ok_or_else(|| DatabaseError::NotFound {
                        entity: "target".into(),
                        id: format!("{organization}/{role}"),
                    })?;
                self.merge_into(existing.id, raw).await?;
                Ok(Upserted::Merged(existing.id))
            }
            Err(e) => Err(e),
        }
    }

    async fn merge_into(&self, id: Uuid, raw: &RawTargetRecord) -> Result<(), DatabaseError> {
        let email = raw
            .contact_email
            .as_deref()
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty());
        self.db
            .merge_target_fields(id, raw.priority_score, email.as_deref(), raw.discovered_at)
            .await?;
        self.db
            .add_target_source(id, &raw.source_id, raw.discovered_at)
            .await
    }

    /// Report stored identities fuzzily similar to a raw record.
    ///
    /// Exact matches are excluded (those merge via `upsert`). Near-misses
    /// are never merged automatically: conflating two distinct employers is
    /// worse than carrying a duplicate until an operator looks.
    pub async fn find_similar(
        &self,
        raw: &RawTargetRecord,
    ) -> Result<Vec<SimilarTarget>, DatabaseError> {
        let organization = normalize_org(&raw.organization);
        let role = normalize_role(&raw.role_title);

        let mut similar = Vec::new();
        for row in self.db.list_identities().await? {
            if row.organization == organization && row.role == role {
                continue;
            }
            let org_similarity = token_similarity(&row.organization, &organization);
            let role_similarity = token_similarity(&row.role, &role);
            let similarity = org_similarity.min(role_similarity);
            if similarity >= SIMILARITY_THRESHOLD {
                similar.push(SimilarTarget {
                    id: row.id,
                    organization: row.organization,
                    role: row.role,
                    similarity,
                });
            }
        }

        similar.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if !similar.is_empty() {
            warn!(
                organization = %organization,
                role = %role,
                candidates = similar.len(),
                "Near-duplicate identities found; flagged for operator review"
            );
        }
        Ok(similar)
    }
}
