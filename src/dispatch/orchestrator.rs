//! Dispatch orchestrator — batch selection, channel fallback, pacing.
//!
//! Batches are externally triggered. Within a batch, organizations run
//! concurrently (bounded) while targets inside one organization are
//! strictly serialized, which makes the per-organization day counter
//! race-free without locks. Every transport call is preceded by a
//! write-ahead attempt row; the store's partial unique index is the final
//! authority against double-sending a target.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::channels::{ChannelKind, Transport, TransportRegistry};
use crate::config::EngineConfig;
use crate::content::{ContentGenerator, MessagePayload};
use crate::dispatch::attempt::{Attempt, AttemptOutcome};
use crate::dispatch::pacing::SendPacer;
use crate::error::{DatabaseError, DispatchError, Error};
use crate::gate::{Decision, EligibilityGate};
use crate::policy::CompanyPolicy;
use crate::store::Database;
use crate::targets::model::{Target, TargetState};

/// How many channels one target may try in a single batch: the preferred
/// channel plus one fallback hop.
const MAX_CHANNEL_HOPS: usize = 2;

/// Counts from one batch run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    /// Stale active attempts aged to no-response before selection.
    pub swept: usize,
    /// Targets pulled from the store for this batch.
    pub selected: usize,
    pub sent: usize,
    /// Transport calls that failed (a target may contribute two).
    pub failed_transport: usize,
    /// Gate denials at dispatch time.
    pub denied: usize,
    /// Targets deferred to a later run by the per-organization day cap.
    pub deferred_day_cap: usize,
    /// Targets with no configured channel that accepts them.
    pub no_channel: usize,
    /// Duplicate-active races detected at attempt write time.
    pub integrity_errors: usize,
    /// Content generation or unexpected store failures.
    pub errors: usize,
}

impl BatchSummary {
    fn absorb(&mut self, other: BatchSummary) {
        self.swept += other.swept;
        self.selected += other.selected;
        self.sent += other.sent;
        self.failed_transport += other.failed_transport;
        self.denied += other.denied;
        self.deferred_day_cap += other.deferred_day_cap;
        self.no_channel += other.no_channel;
        self.integrity_errors += other.integrity_errors;
        self.errors += other.errors;
    }
}

/// Batch dispatch engine.
pub struct Orchestrator {
    db: Arc<dyn Database>,
    gate: EligibilityGate,
    transports: Arc<TransportRegistry>,
    generator: Arc<dyn ContentGenerator>,
    pacer: Arc<SendPacer>,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        db: Arc<dyn Database>,
        transports: Arc<TransportRegistry>,
        generator: Arc<dyn ContentGenerator>,
        pacer: Arc<SendPacer>,
        config: EngineConfig,
    ) -> Self {
        let gate = EligibilityGate::new(Arc::clone(&db), config.quotas);
        Self {
            db,
            gate,
            transports,
            generator,
            pacer,
            config,
        }
    }

    /// Run one dispatch batch of up to `max_count` targets (further capped
    /// by the configured per-run ceiling). Aborting between targets is
    /// safe: every attempt commits independently.
    pub async fn run_batch(&self, max_count: usize) -> Result<BatchSummary, Error> {
        if max_count == 0 {
            return Err(DispatchError::EmptyBudget { max: max_count }.into());
        }

        let mut summary = BatchSummary::default();

        // Free targets whose active attempt never resolved.
        let grace = Duration::from_std(self.config.attempt_grace)
            .unwrap_or_else(|_| Duration::days(14));
        summary.swept = self.db.expire_stale_attempts(Utc::now() - grace).await?;
        if summary.swept > 0 {
            info!(swept = summary.swept, "Aged stale attempts to no-response");
        }

        // Selection order is the run's send ceiling: at most one accepted
        // send per selected target.
        let limit = max_count.min(self.config.batch_ceiling);
        let targets = self.db.list_dispatchable_targets(limit).await?;
        summary.selected = targets.len();
        if targets.is_empty() {
            info!("No dispatchable targets");
            return Ok(summary);
        }

        let groups = group_by_organization(targets);
        info!(
            targets = summary.selected,
            organizations = groups.len(),
            "Dispatch batch starting"
        );

        let outcomes: Vec<BatchSummary> = futures::stream::iter(
            groups
                .into_iter()
                .map(|(organization, members)| self.dispatch_organization(organization, members)),
        )
        .buffer_unordered(self.config.org_concurrency)
        .collect()
        .await;

        for outcome in outcomes {
            summary.absorb(outcome);
        }

        info!(
            sent = summary.sent,
            denied = summary.denied,
            failed_transport = summary.failed_transport,
            deferred_day_cap = summary.deferred_day_cap,
            "Dispatch batch complete"
        );
        Ok(summary)
    }

    /// Serially dispatch one organization's targets. Serialization is what
    /// keeps the day counter race-free; errors are scoped per target.
    async fn dispatch_organization(
        &self,
        organization: String,
        targets: Vec<Target>,
    ) -> BatchSummary {
        let mut tally = BatchSummary::default();

        let policy = match self.db.get_policy(&organization).await {
            Ok(Some(policy)) => policy,
            Ok(None) => CompanyPolicy::with_defaults(&organization, &self.config.quotas),
            Err(e) => {
                error!(organization = %organization, error = %e, "Policy load failed; skipping organization");
                tally.errors += targets.len();
                return tally;
            }
        };

        let mut day_sent = match self
            .db
            .count_contacts_since(&organization, Some(Utc::now() - Duration::days(1)))
            .await
        {
            Ok(count) => count,
            Err(e) => {
                error!(organization = %organization, error = %e, "Day count failed; skipping organization");
                tally.errors += targets.len();
                return tally;
            }
        };

        for target in targets {
            if day_sent >= policy.max_per_day {
                // Not a denial: the target simply waits for a later run.
                debug!(
                    target_id = %target.id,
                    organization = %organization,
                    "Per-organization day cap reached; deferring"
                );
                tally.deferred_day_cap += 1;
                continue;
            }

            match self.dispatch_one(&target, &mut tally).await {
                Ok(true) => day_sent += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(target_id = %target.id, error = %e, "Dispatch failed for target");
                    tally.errors += 1;
                }
            }
        }

        tally
    }

    /// Dispatch a single target. Returns `Ok(true)` when a send was
    /// accepted by some channel.
    async fn dispatch_one(
        &self,
        target: &Target,
        tally: &mut BatchSummary,
    ) -> Result<bool, DatabaseError> {
        // Re-check at send time; the earlier selection read is stale by now.
        match self.gate.evaluate_target(target).await? {
            Decision::Allow => {}
            Decision::Deny(reason) => {
                debug!(target_id = %target.id, reason = %reason, "Denied at dispatch time");
                tally.denied += 1;
                return Ok(false);
            }
        }

        let payload = match self.generator.generate(target).await {
            Ok(payload) => payload,
            Err(e) => {
                error!(target_id = %target.id, error = %e, "Content generation failed");
                tally.errors += 1;
                return Ok(false);
            }
        };

        let route = self.transports.route(target);
        if route.is_empty() {
            warn!(target_id = %target.id, "No configured channel accepts target");
            tally.no_channel += 1;
            return Ok(false);
        }

        for transport in route.iter().take(MAX_CHANNEL_HOPS) {
            match self.try_channel(target, transport.as_ref(), &payload).await? {
                ChannelOutcome::Sent => {
                    tally.sent += 1;
                    return Ok(true);
                }
                ChannelOutcome::TransportFailed => {
                    tally.failed_transport += 1;
                    // Fall through to the next channel in the list.
                }
                ChannelOutcome::DuplicateActive => {
                    tally.integrity_errors += 1;
                    return Ok(false);
                }
            }
        }

        Ok(false)
    }

    /// One write-ahead attempt plus one transport call.
    async fn try_channel(
        &self,
        target: &Target,
        transport: &dyn Transport,
        payload: &MessagePayload,
    ) -> Result<ChannelOutcome, DatabaseError> {
        let recipient = match transport.kind() {
            ChannelKind::Email => target.contact_email.clone(),
            _ => None,
        };
        let attempt = Attempt::queued(
            target.id,
            transport.kind(),
            recipient,
            Some(payload.subject.clone()),
            payload.reference.clone(),
        );

        // Write-ahead: the row exists before the transport call, so a crash
        // mid-send never produces an untracked contact.
        match self.db.insert_attempt(&attempt).await {
            Ok(()) => {}
            Err(DatabaseError::DuplicateActive { target_id }) => {
                error!(
                    target_id = %target_id,
                    "Duplicate active attempt at write time; another worker got here first"
                );
                return Ok(ChannelOutcome::DuplicateActive);
            }
            Err(e) => return Err(e),
        }

        self.pacer.pace().await;

        match transport.send(target, payload).await {
            Ok(receipt) => {
                self.db
                    .mark_attempt_sent(attempt.id, receipt.accepted_at)
                    .await?;
                self.mark_contacted(target).await?;
                info!(
                    target_id = %target.id,
                    channel = %transport.kind(),
                    attempt_id = %attempt.id,
                    "Dispatched"
                );
                Ok(ChannelOutcome::Sent)
            }
            Err(e) => {
                // Transport failures are transient by definition: terminal
                // for this attempt, quota-exempt, no cooldown.
                warn!(
                    target_id = %target.id,
                    channel = %transport.kind(),
                    error = %e,
                    "Transport failed"
                );
                self.db
                    .resolve_attempt(attempt.id, AttemptOutcome::FailedTransport)
                    .await?;
                Ok(ChannelOutcome::TransportFailed)
            }
        }
    }

    async fn mark_contacted(&self, target: &Target) -> Result<(), DatabaseError> {
        if target.state != TargetState::Contacted
            && target.state.can_transition_to(TargetState::Contacted)
        {
            self.db
                .update_target_state(target.id, TargetState::Contacted)
                .await?;
        }
        Ok(())
    }
}

enum ChannelOutcome {
    Sent,
    TransportFailed,
    DuplicateActive,
}

/// Group targets by organization, preserving the priority order of each
/// organization's first appearance and of targets within it.
fn group_by_organization(targets: Vec<Target>) -> Vec<(String, Vec<Target>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Target>> = HashMap::new();
    for target in targets {
        let key = target.organization.clone();
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        groups.entry(key).or_default().push(target);
    }
    order
        .into_iter()
        .map(|key| {
            let members = groups.remove(&key).unwrap_or_default();
            (key, members)
        })
        .collect()
}
