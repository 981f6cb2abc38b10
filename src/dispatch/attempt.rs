//! Attempt records and the outcome state machine.
//!
//! An attempt is written *before* its transport call, so a crash between
//! write and send leaves a pending row that keeps blocking the target until
//! the expiry sweep ages it out. At most one pending/sent attempt may exist
//! per target; the store enforces that with a partial unique index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channels::ChannelKind;

/// Outcome of a contact attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Written ahead of the transport call.
    Pending,
    /// The transport accepted the message.
    Sent,
    /// The transport call failed. Terminal; quota-exempt.
    FailedTransport,
    /// A delivery failure signal correlated back to this attempt.
    Bounced,
    /// A reply correlated back to this attempt.
    Answered,
    /// Aged out by the expiry sweep without any signal.
    NoResponse,
}

impl AttemptOutcome {
    /// Check if this outcome allows transitioning to another outcome.
    pub fn can_transition_to(&self, next: AttemptOutcome) -> bool {
        use AttemptOutcome::*;

        matches!(
            (self, next),
            (Pending, Sent) | (Pending, FailedTransport) | (Pending, NoResponse) |
            (Sent, Bounced) | (Sent, Answered) | (Sent, NoResponse)
        )
    }

    /// Active outcomes hold the one-per-target slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Sent)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Whether this outcome counts against organization quotas.
    /// Only outcomes derived from an accepted send count; a transport
    /// failure produced no externally visible contact.
    pub fn counts_toward_quota(&self) -> bool {
        matches!(
            self,
            Self::Sent | Self::Bounced | Self::Answered | Self::NoResponse
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::FailedTransport => "failed_transport",
            Self::Bounced => "bounced",
            Self::Answered => "answered",
            Self::NoResponse => "no_response",
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One outbound contact attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: Uuid,
    pub target_id: Uuid,
    pub channel: ChannelKind,
    pub outcome: AttemptOutcome,
    /// Address the message went to, when the channel has one. Bounce and
    /// reply correlation matches against this.
    pub recipient: Option<String>,
    /// Subject line used, for the correlation fallback.
    pub subject: Option<String>,
    /// Opaque reference into the content generator's store.
    pub content_ref: String,
    pub queued_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Attempt {
    /// Build a write-ahead (pending) attempt.
    pub fn queued(
        target_id: Uuid,
        channel: ChannelKind,
        recipient: Option<String>,
        subject: Option<String>,
        content_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_id,
            channel,
            outcome: AttemptOutcome::Pending,
            recipient,
            subject,
            content_ref: content_ref.into(),
            queued_at: Utc::now(),
            sent_at: None,
            resolved_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_transitions_valid() {
        use AttemptOutcome::*;
        assert!(Pending.can_transition_to(Sent));
        assert!(Pending.can_transition_to(FailedTransport));
        assert!(Sent.can_transition_to(Bounced));
        assert!(Sent.can_transition_to(Answered));
        assert!(Sent.can_transition_to(NoResponse));
    }

    #[test]
    fn outcome_transitions_invalid() {
        use AttemptOutcome::*;
        assert!(!Sent.can_transition_to(Pending));
        assert!(!Bounced.can_transition_to(Answered));
        assert!(!FailedTransport.can_transition_to(Sent));
        assert!(!Answered.can_transition_to(Bounced));
        assert!(!NoResponse.can_transition_to(Sent));
    }

    #[test]
    fn active_outcomes() {
        assert!(AttemptOutcome::Pending.is_active());
        assert!(AttemptOutcome::Sent.is_active());
        assert!(AttemptOutcome::Bounced.is_terminal());
        assert!(AttemptOutcome::FailedTransport.is_terminal());
    }

    #[test]
    fn quota_counting_excludes_transport_failures() {
        assert!(!AttemptOutcome::FailedTransport.counts_toward_quota());
        assert!(!AttemptOutcome::Pending.counts_toward_quota());
        assert!(AttemptOutcome::Sent.counts_toward_quota());
        assert!(AttemptOutcome::Bounced.counts_toward_quota());
        assert!(AttemptOutcome::NoResponse.counts_toward_quota());
    }

    #[test]
    fn queued_attempt_is_pending() {
        let a = Attempt::queued(
            Uuid::new_v4(),
            ChannelKind::Email,
            Some("jobs@acme.example".into()),
            Some("Hello".into()),
            "ref-1",
        );
        assert_eq!(a.outcome, AttemptOutcome::Pending);
        assert!(a.sent_at.is_none());
        assert!(a.resolved_at.is_none());
    }
}
