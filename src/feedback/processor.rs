//! Feedback processing: classify, correlate, record, react.
//!
//! Each inbound message becomes exactly one immutable signal row. State
//! side effects (attempt outcome, target state, organization cooldown)
//! only fire when the signal is both correlated to an attempt and
//! classified with at least medium confidence; everything else is
//! recorded for the operator review queue and touches nothing.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CooldownDurations;
use crate::dispatch::attempt::{Attempt, AttemptOutcome};
use crate::error::DatabaseError;
use crate::feedback::extract::AddressExtractor;
use crate::feedback::rules::Classifier;
use crate::feedback::types::{Classification, Confidence, InboundEmail, InboundSignal};
use crate::policy::{CompanyPolicy, CooldownCause};
use crate::store::Database;
use crate::targets::model::TargetState;

/// How many recent attempts the subject-containment fallback scans.
const SUBJECT_SCAN_LIMIT: usize = 100;

/// Counts from one feedback processing run.
#[derive(Debug, Default, Clone)]
pub struct ProcessSummary {
    pub processed: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub side_effects: usize,
    pub errors: usize,
}

/// Classifies inbound messages and applies their state consequences.
pub struct FeedbackProcessor {
    db: Arc<dyn Database>,
    classifier: Classifier,
    extractor: AddressExtractor,
    cooldowns: CooldownDurations,
}

impl FeedbackProcessor {
    pub fn new(db: Arc<dyn Database>, cooldowns: CooldownDurations) -> Self {
        Self {
            db,
            classifier: Classifier::new(),
            extractor: AddressExtractor::new(),
            cooldowns,
        }
    }

    /// Process one inbound message end to end. The signal row is written
    /// even when correlation fails or side effects are skipped.
    pub async fn process(&self, email: &InboundEmail) -> Result<InboundSignal, DatabaseError> {
        let matched = self.classifier.classify(email);

        let extracted_address = if matched.classification.is_bounce() {
            self.extractor.extract(&email.body)
        } else {
            None
        };

        let correlated = self
            .correlate(email, matched.classification, extracted_address.as_deref())
            .await?;

        let signal = InboundSignal {
            id: Uuid::new_v4(),
            sender: email.sender.clone(),
            subject: email.subject.clone(),
            body: email.body.clone(),
            received_at: email.received_at,
            header_names: email.header_names.clone(),
            classification: matched.classification,
            confidence: matched.confidence,
            matched_rule: Some(matched.rule.to_string()),
            extracted_address,
            attempt_id: correlated.as_ref().map(|a| a.id),
            target_id: correlated.as_ref().map(|a| a.target_id),
            created_at: Utc::now(),
        };
        self.db.insert_signal(&signal).await?;

        match &correlated {
            Some(attempt) if matched.confidence >= Confidence::Medium => {
                self.apply_side_effects(&signal, attempt).await?;
            }
            Some(attempt) => {
                debug!(
                    signal_id = %signal.id,
                    attempt_id = %attempt.id,
                    confidence = %matched.confidence,
                    "Low confidence; recorded without side effects"
                );
            }
            None => {
                info!(
                    signal_id = %signal.id,
                    classification = %matched.classification,
                    sender = %signal.sender,
                    "Unresolved signal queued for operator review"
                );
            }
        }

        Ok(signal)
    }

    /// Process a batch with per-message isolation.
    pub async fn process_batch(&self, emails: &[InboundEmail]) -> ProcessSummary {
        let mut summary = ProcessSummary::default();
        for email in emails {
            match self.process(email).await {
                Ok(signal) => {
                    summary.processed += 1;
                    if signal.is_resolved() {
                        summary.resolved += 1;
                        if signal.confidence >= Confidence::Medium {
                            summary.side_effects += 1;
                        }
                    } else {
                        summary.unresolved += 1;
                    }
                }
                Err(e) => {
                    warn!(sender = %email.sender, error = %e, "Failed to process inbound message");
                    summary.errors += 1;
                }
            }
        }
        summary
    }

    /// Find the attempt this message answers. Bounces correlate through
    /// the address recovered from the report body; replies through the
    /// sender address. Both fall back to subject containment against
    /// recent attempts.
    async fn correlate(
        &self,
        email: &InboundEmail,
        classification: Classification,
        extracted: Option<&str>,
    ) -> Result<Option<Attempt>, DatabaseError> {
        let address = if classification.is_bounce() {
            extracted
        } else {
            Some(email.sender.as_str())
        };

        if let Some(address) = address {
            let candidates = self.db.list_attempts_for_recipient(address, 10).await?;
            // Most recent first; prefer one still awaiting an answer.
            if let Some(attempt) = candidates
                .iter()
                .find(|a| a.outcome.is_active())
                .or(candidates.first())
            {
                return Ok(Some(attempt.clone()));
            }
        }

        self.correlate_by_subject(email).await
    }

    /// Subject-containment fallback: strip reply prefixes from the inbound
    /// subject and look for an attempt whose subject it contains.
    async fn correlate_by_subject(
        &self,
        email: &InboundEmail,
    ) -> Result<Option<Attempt>, DatabaseError> {
        let Some(subject) = email.subject.as_deref() else {
            return Ok(None);
        };
        let needle = normalize_subject(subject);
        if needle.is_empty() {
            return Ok(None);
        }

        let recent = self.db.list_recent_attempts(SUBJECT_SCAN_LIMIT).await?;
        Ok(recent
            .into_iter()
            .find(|attempt| {
                attempt
                    .subject
                    .as_deref()
                    .map(normalize_subject)
                    .is_some_and(|sent| !sent.is_empty() && needle.contains(&sent))
            }))
    }

    /// State consequences of a resolved, confident signal.
    async fn apply_side_effects(
        &self,
        signal: &InboundSignal,
        attempt: &Attempt,
    ) -> Result<(), DatabaseError> {
        let (outcome, target_state, cooldown) = match signal.classification {
            Classification::BounceHard => (
                Some(AttemptOutcome::Bounced),
                Some(TargetState::DoNotContact),
                Some((CooldownCause::BounceHard, self.cooldowns.bounce_hard)),
            ),
            Classification::BounceSoft => (
                Some(AttemptOutcome::Bounced),
                Some(TargetState::Deferred),
                Some((CooldownCause::BounceSoft, self.cooldowns.bounce_soft)),
            ),
            Classification::BounceUnknown => (
                Some(AttemptOutcome::Bounced),
                None,
                Some((CooldownCause::BounceUnknown, self.cooldowns.bounce_unknown)),
            ),
            Classification::ReplyRejection => (
                Some(AttemptOutcome::Answered),
                Some(TargetState::Rejected),
                Some((CooldownCause::Rejection, self.cooldowns.rejection)),
            ),
            Classification::ReplyInterviewOrNextStep => (
                Some(AttemptOutcome::Answered),
                Some(TargetState::Engaged),
                None,
            ),
            // Acknowledgements and unclear replies are informational.
            Classification::ReplyAutoAck
            | Classification::ReplyPersonal
            | Classification::ReplyOther => (None, None, None),
        };

        if let Some(outcome) = outcome {
            if attempt.outcome.can_transition_to(outcome) {
                self.db.resolve_attempt(attempt.id, outcome).await?;
            } else {
                debug!(
                    attempt_id = %attempt.id,
                    from = %attempt.outcome,
                    to = %outcome,
                    "Attempt already resolved; outcome left as is"
                );
            }
        }

        if let Some(next_state) = target_state
            && let Some(target) = self.db.get_target(attempt.target_id).await?
        {
            if target.state != next_state && target.state.can_transition_to(next_state) {
                self.db.update_target_state(target.id, next_state).await?;
                info!(
                    target_id = %target.id,
                    from = %target.state,
                    to = %next_state,
                    classification = %signal.classification,
                    "Target state updated from feedback"
                );
            }
        }

        if let Some((cause, duration)) = cooldown {
            // The window counts from the send, not from classification.
            // Draining an old spool must not block an organization past
            // what the original send already earned it.
            let anchor = attempt.sent_at.unwrap_or(signal.received_at);
            self.apply_cooldown(attempt.target_id, cause, duration, anchor)
                .await?;
        }

        Ok(())
    }

    async fn apply_cooldown(
        &self,
        target_id: Uuid,
        cause: CooldownCause,
        duration: std::time::Duration,
        anchor: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let Some(target) = self.db.get_target(target_id).await? else {
            return Ok(());
        };
        let mut policy = match self.db.get_policy(&target.organization).await? {
            Some(policy) => policy,
            None => CompanyPolicy::with_defaults(&target.organization, &Default::default()),
        };
        let until = anchor + Duration::from_std(duration).unwrap_or_else(|_| Duration::days(7));
        policy.apply_cooldown(until, cause);
        self.db.upsert_policy(&policy).await?;
        info!(
            organization = %target.organization,
            cause = %cause,
            until = %until,
            "Cooldown applied"
        );
        Ok(())
    }
}

/// Lowercase and strip leading reply/forward prefixes.
fn normalize_subject(subject: &str) -> String {
    let mut s = subject.trim().to_lowercase();
    loop {
        let stripped = s
            .strip_prefix("re:")
            .or_else(|| s.strip_prefix("fwd:"))
            .or_else(|| s.strip_prefix("fw:"))
            .map(|rest| rest.trim_start().to_string());
        match stripped {
            Some(rest) => s = rest,
            None => break,
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelKind;
    use crate::store::LibSqlBackend;
    use crate::targets::model::{RawTargetRecord, Target};

    struct Fixture {
        db: Arc<dyn Database>,
        processor: FeedbackProcessor,
    }

    async fn fixture() -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let processor = FeedbackProcessor::new(Arc::clone(&db), CooldownDurations::default());
        Fixture { db, processor }
    }

    async fn seed_sent_attempt(db: &Arc<dyn Database>, org: &str, recipient: &str) -> Attempt {
        let target = Target::from_raw(&RawTargetRecord {
            organization: org.into(),
            role_title: "Engineer".into(),
            source_id: "test".into(),
            discovered_at: Utc::now(),
            priority_score: 0.5,
            contact_email: Some(recipient.into()),
        });
        db.insert_target(&target).await.unwrap();
        db.update_target_state(target.id, TargetState::Contacted)
            .await
            .unwrap();

        let attempt = Attempt::queued(
            target.id,
            ChannelKind::Email,
            Some(recipient.into()),
            Some("Backend Engineer at Acme".into()),
            "ref-1",
        );
        db.insert_attempt(&attempt).await.unwrap();
        db.mark_attempt_sent(attempt.id, Utc::now()).await.unwrap();
        attempt
    }

    fn bounce_email(failed: &str, body_extra: &str) -> InboundEmail {
        InboundEmail {
            sender: "mailer-daemon@mx.example.com".into(),
            subject: Some("Mail delivery failed".into()),
            body: format!("Final-Recipient: rfc822; {failed}\n{body_extra}"),
            received_at: Utc::now(),
            header_names: vec!["from".into(), "subject".into()],
        }
    }

    #[tokio::test]
    async fn hard_bounce_full_side_effects() {
        let f = fixture().await;
        let attempt = seed_sent_attempt(&f.db, "Acme", "jobs@acme.example").await;

        let signal = f
            .processor
            .process(&bounce_email(
                "jobs@acme.example",
                "550 5.1.1 User unknown",
            ))
            .await
            .unwrap();

        assert_eq!(signal.classification, Classification::BounceHard);
        assert_eq!(signal.attempt_id, Some(attempt.id));

        let resolved = f.db.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(resolved.outcome, AttemptOutcome::Bounced);

        let target = f.db.get_target(attempt.target_id).await.unwrap().unwrap();
        assert_eq!(target.state, TargetState::DoNotContact);

        let policy = f.db.get_policy("acme").await.unwrap().unwrap();
        assert!(policy.cooldown_active(Utc::now()));
        assert_eq!(policy.cooldown_cause, Some(CooldownCause::BounceHard));
    }

    #[tokio::test]
    async fn soft_bounce_defers_target() {
        let f = fixture().await;
        let attempt = seed_sent_attempt(&f.db, "Acme", "jobs@acme.example").await;

        f.processor
            .process(&bounce_email(
                "jobs@acme.example",
                "452 4.2.2 Mailbox full, try again later",
            ))
            .await
            .unwrap();

        let target = f.db.get_target(attempt.target_id).await.unwrap().unwrap();
        assert_eq!(target.state, TargetState::Deferred);
        let policy = f.db.get_policy("acme").await.unwrap().unwrap();
        assert_eq!(policy.cooldown_cause, Some(CooldownCause::BounceSoft));
    }

    #[tokio::test]
    async fn unknown_bounce_leaves_target_state() {
        let f = fixture().await;
        let attempt = seed_sent_attempt(&f.db, "Acme", "jobs@acme.example").await;

        f.processor
            .process(&bounce_email(
                "jobs@acme.example",
                "Your message could not be delivered.",
            ))
            .await
            .unwrap();

        let resolved = f.db.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(resolved.outcome, AttemptOutcome::Bounced);
        // Permanence unclear, so the target stays contacted
        let target = f.db.get_target(attempt.target_id).await.unwrap().unwrap();
        assert_eq!(target.state, TargetState::Contacted);
        let policy = f.db.get_policy("acme").await.unwrap().unwrap();
        assert_eq!(policy.cooldown_cause, Some(CooldownCause::BounceUnknown));
    }

    #[tokio::test]
    async fn rejection_reply_correlates_by_sender() {
        let f = fixture().await;
        let attempt = seed_sent_attempt(&f.db, "Acme", "recruiting@acme.example").await;

        let signal = f
            .processor
            .process(&InboundEmail {
                sender: "recruiting@acme.example".into(),
                subject: Some("Re: Backend Engineer at Acme".into()),
                body: "Unfortunately, we decided to move forward with other candidates.".into(),
                received_at: Utc::now(),
                header_names: vec![],
            })
            .await
            .unwrap();

        assert_eq!(signal.classification, Classification::ReplyRejection);
        assert_eq!(signal.attempt_id, Some(attempt.id));

        let resolved = f.db.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(resolved.outcome, AttemptOutcome::Answered);
        let target = f.db.get_target(attempt.target_id).await.unwrap().unwrap();
        assert_eq!(target.state, TargetState::Rejected);
        let policy = f.db.get_policy("acme").await.unwrap().unwrap();
        assert_eq!(policy.cooldown_cause, Some(CooldownCause::Rejection));

        // The cooldown now gates any further contact with the organization
        let gate = crate::gate::EligibilityGate::new(Arc::clone(&f.db), Default::default());
        match gate.evaluate(attempt.target_id).await.unwrap() {
            crate::gate::Decision::Deny(crate::gate::DenyReason::CooldownActive { .. }) => {}
            other => panic!("expected cooldown denial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_report_cooldown_anchors_at_send_time() {
        let f = fixture().await;
        let attempt = seed_sent_attempt(&f.db, "Acme", "recruiting@acme.example").await;
        // The send happened long ago; the report only surfaces now.
        let sent_long_ago = Utc::now() - Duration::days(400);
        f.db.mark_attempt_sent(attempt.id, sent_long_ago)
            .await
            .unwrap();

        f.processor
            .process(&InboundEmail {
                sender: "recruiting@acme.example".into(),
                subject: Some("Re: Backend Engineer at Acme".into()),
                body: "Unfortunately, we decided to move forward with other candidates.".into(),
                received_at: Utc::now(),
                header_names: vec![],
            })
            .await
            .unwrap();

        // The 90-day rejection window counted from that send is long over,
        // so the organization is not blocked again today.
        let policy = f.db.get_policy("acme").await.unwrap().unwrap();
        assert_eq!(policy.cooldown_cause, Some(CooldownCause::Rejection));
        assert!(!policy.cooldown_active(Utc::now()));
        let until = policy.cooldown_until.unwrap();
        assert_eq!(
            until.timestamp(),
            (sent_long_ago + Duration::days(90)).timestamp()
        );

        let gate = crate::gate::EligibilityGate::new(Arc::clone(&f.db), Default::default());
        match gate.evaluate(attempt.target_id).await.unwrap() {
            crate::gate::Decision::Deny(crate::gate::DenyReason::CooldownActive { .. }) => {
                panic!("expired cooldown must not deny")
            }
            _ => {}
        }
    }

    #[tokio::test]
    async fn interview_reply_engages_without_cooldown() {
        let f = fixture().await;
        let attempt = seed_sent_attempt(&f.db, "Acme", "alice@acme.example").await;

        f.processor
            .process(&InboundEmail {
                sender: "alice@acme.example".into(),
                subject: Some("Re: Backend Engineer at Acme".into()),
                body: "We'd love to set up a call. What's your availability?".into(),
                received_at: Utc::now(),
                header_names: vec![],
            })
            .await
            .unwrap();

        let target = f.db.get_target(attempt.target_id).await.unwrap().unwrap();
        assert_eq!(target.state, TargetState::Engaged);
        assert!(f.db.get_policy("acme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_sender_falls_back_to_subject_containment() {
        let f = fixture().await;
        let attempt = seed_sent_attempt(&f.db, "Acme", "jobs@acme.example").await;

        // Reply arrives from a different person than we wrote to
        let signal = f
            .processor
            .process(&InboundEmail {
                sender: "hiring-manager@acme.example".into(),
                subject: Some("Re: Re: Backend Engineer at Acme".into()),
                body: "Let's schedule a call to discuss the interview process.".into(),
                received_at: Utc::now(),
                header_names: vec![],
            })
            .await
            .unwrap();

        assert_eq!(signal.attempt_id, Some(attempt.id));
        let target = f.db.get_target(attempt.target_id).await.unwrap().unwrap();
        assert_eq!(target.state, TargetState::Engaged);
    }

    #[tokio::test]
    async fn uncorrelatable_signal_is_stored_unresolved() {
        let f = fixture().await;
        seed_sent_attempt(&f.db, "Acme", "jobs@acme.example").await;

        let signal = f
            .processor
            .process(&InboundEmail {
                sender: "stranger@elsewhere.example".into(),
                subject: Some("hello".into()),
                body: "We should talk about an interview sometime.".into(),
                received_at: Utc::now(),
                header_names: vec![],
            })
            .await
            .unwrap();

        assert!(!signal.is_resolved());
        let unresolved = f.db.list_unresolved_signals(10).await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].id, signal.id);
    }

    #[tokio::test]
    async fn low_confidence_never_mutates_state() {
        let f = fixture().await;
        let attempt = seed_sent_attempt(&f.db, "Acme", "bob@acme.example").await;

        // Personal reply: correlates by sender but is only Low confidence
        let signal = f
            .processor
            .process(&InboundEmail {
                sender: "bob@acme.example".into(),
                subject: Some("Re: Backend Engineer at Acme".into()),
                body: "Forwarded internally.".into(),
                received_at: Utc::now(),
                header_names: vec![],
            })
            .await
            .unwrap();

        assert_eq!(signal.classification, Classification::ReplyPersonal);
        assert!(signal.is_resolved());

        let unchanged = f.db.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(unchanged.outcome, AttemptOutcome::Sent);
        let target = f.db.get_target(attempt.target_id).await.unwrap().unwrap();
        assert_eq!(target.state, TargetState::Contacted);
        assert!(f.db.get_policy("acme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_bounce_does_not_double_apply() {
        let f = fixture().await;
        let attempt = seed_sent_attempt(&f.db, "Acme", "jobs@acme.example").await;
        let email = bounce_email("jobs@acme.example", "550 5.1.1 User unknown");

        f.processor.process(&email).await.unwrap();
        // Second copy of the same report: attempt already Bounced, which
        // is terminal; processing records a second signal and moves on.
        let second = f.processor.process(&email).await.unwrap();
        assert_eq!(second.classification, Classification::BounceHard);

        let resolved = f.db.get_attempt(attempt.id).await.unwrap().unwrap();
        assert_eq!(resolved.outcome, AttemptOutcome::Bounced);
        let signals = f.db.list_signals_for_target(attempt.target_id).await.unwrap();
        assert_eq!(signals.len(), 2);
    }

    #[tokio::test]
    async fn batch_isolates_messages() {
        let f = fixture().await;
        seed_sent_attempt(&f.db, "Acme", "jobs@acme.example").await;

        let batch = vec![
            bounce_email("jobs@acme.example", "550 5.1.1 User unknown"),
            InboundEmail {
                sender: "stranger@elsewhere.example".into(),
                subject: None,
                body: "noise".into(),
                received_at: Utc::now(),
                header_names: vec![],
            },
        ];
        let summary = f.processor.process_batch(&batch).await;
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.side_effects, 1);
    }

    #[test]
    fn subject_normalization_strips_prefixes() {
        assert_eq!(normalize_subject("Re: Re: Hello"), "hello");
        assert_eq!(normalize_subject("FWD: Fw: Hello there"), "hello there");
        assert_eq!(normalize_subject("  Hello  "), "hello");
    }
}
