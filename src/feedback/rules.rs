//! Ordered classification rules for inbound feedback.
//!
//! The rule list is walked top to bottom and the first match wins, so
//! specificity lives in the ordering: hard evidence (SMTP status codes)
//! outranks structural evidence (daemon senders, report headers), which
//! outranks phrasing. A message that matches nothing still gets a
//! low-confidence fallback; classification is total.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::feedback::types::{Classification, Confidence, InboundEmail, RuleMatch};

/// Which part of the message a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalField {
    Sender,
    Subject,
    Body,
    /// Matched against the newline-joined list of lowercased header names.
    Header,
}

struct IndicatorRule {
    name: &'static str,
    field: SignalField,
    pattern: Regex,
    classification: Classification,
    confidence: Confidence,
    /// Body-phrase bounce rules only apply to messages that already look
    /// like delivery reports, so a human quoting an error string in a
    /// normal reply cannot trigger a bounce.
    needs_bounce_context: bool,
}

fn rule(
    name: &'static str,
    field: SignalField,
    pattern: &str,
    classification: Classification,
    confidence: Confidence,
    needs_bounce_context: bool,
) -> IndicatorRule {
    IndicatorRule {
        name,
        field,
        pattern: Regex::new(pattern).expect("static rule pattern"),
        classification,
        confidence,
        needs_bounce_context,
    }
}

static DAEMON_SENDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(mailer[-_]?daemon|postmaster)@").expect("static pattern"));

static NOREPLY_SENDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(no[-_.]?reply|do[-_.]?not[-_.]?reply|notifications?)@").expect("static pattern")
});

static BOUNCE_SUBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)delivery status notification|undeliver(able|ed)|mail delivery fail|returned mail|failure notice|delivery has failed",
    )
    .expect("static pattern")
});

static RULES: LazyLock<Vec<IndicatorRule>> = LazyLock::new(|| {
    vec![
        rule(
            "bounce-hard-evidence",
            SignalField::Body,
            r"(?i)\b5\.[0-9]+\.[0-9]+\b|\b55[0-9]\b|user unknown|unknown user|no such user|recipient address rejected|address not found|does not exist|mailbox unavailable|permanent(ly)? (failed|failure|rejected)",
            Classification::BounceHard,
            Confidence::High,
            true,
        ),
        rule(
            "bounce-soft-evidence",
            SignalField::Body,
            r"(?i)\b4\.[0-9]+\.[0-9]+\b|\b4[2-5][0-9]\b|mailbox (is )?full|quota exceeded|over quota|temporar(y|ily)|try again later|greylist",
            Classification::BounceSoft,
            Confidence::High,
            true,
        ),
        rule(
            "bounce-report-header",
            SignalField::Header,
            r"(?m)^x-failed-recipients$",
            Classification::BounceUnknown,
            Confidence::High,
            false,
        ),
        rule(
            "bounce-daemon-sender",
            SignalField::Sender,
            r"(?i)^(mailer[-_]?daemon|postmaster)@",
            Classification::BounceUnknown,
            Confidence::High,
            false,
        ),
        rule(
            "bounce-subject",
            SignalField::Subject,
            r"(?i)delivery status notification|undeliver(able|ed)|mail delivery fail|returned mail|failure notice|delivery has failed",
            Classification::BounceUnknown,
            Confidence::Medium,
            false,
        ),
        // Rejection outranks interview: "unfortunately we went with another
        // candidate, good luck with next steps" is a rejection.
        rule(
            "reply-rejection-phrasing",
            SignalField::Body,
            r"(?i)not (be )?moving forward|will not be (moving|proceeding)|unfortunately,? we|regret to inform|other candidates?|pursue other|position has been filled|not selected|decided not to proceed|no longer under consideration",
            Classification::ReplyRejection,
            Confidence::Medium,
            false,
        ),
        rule(
            "reply-interview-phrasing",
            SignalField::Body,
            r"(?i)\binterview\b|schedule a (call|chat|meeting)|next steps?|would love to (talk|chat|speak)|set up a (time|call)|your availability",
            Classification::ReplyInterviewOrNextStep,
            Confidence::Medium,
            false,
        ),
        rule(
            "auto-ack-sender",
            SignalField::Sender,
            r"(?i)^(no[-_.]?reply|do[-_.]?not[-_.]?reply|notifications?)@",
            Classification::ReplyAutoAck,
            Confidence::Medium,
            false,
        ),
        rule(
            "auto-ack-phrasing",
            SignalField::Body,
            r"(?i)received your (application|message|submission)|thank you for (applying|your application|your interest)|application has been received|automatic reply|auto[- ]?reply|out of (the )?office",
            Classification::ReplyAutoAck,
            Confidence::Medium,
            false,
        ),
    ]
});

/// Walks the ordered rule list over a message.
#[derive(Debug, Default)]
pub struct Classifier;

impl Classifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify one inbound message. Always returns a match; messages no
    /// rule recognizes fall back to a low-confidence reply class.
    pub fn classify(&self, email: &InboundEmail) -> RuleMatch {
        let bounce_context = looks_like_bounce(email);
        let headers = email.header_names.join("\n");

        for rule in RULES.iter() {
            if rule.needs_bounce_context && !bounce_context {
                continue;
            }
            let text: &str = match rule.field {
                SignalField::Sender => &email.sender,
                SignalField::Subject => email.subject.as_deref().unwrap_or(""),
                SignalField::Body => &email.body,
                SignalField::Header => &headers,
            };
            if rule.pattern.is_match(text) {
                debug!(rule = rule.name, classification = %rule.classification, "Rule fired");
                return RuleMatch {
                    classification: rule.classification,
                    confidence: rule.confidence,
                    rule: rule.name,
                };
            }
        }

        // Fallback: a non-automated sender is probably a human.
        if !email.sender.is_empty()
            && email.sender.contains('@')
            && !NOREPLY_SENDER.is_match(&email.sender)
            && !DAEMON_SENDER.is_match(&email.sender)
        {
            RuleMatch {
                classification: Classification::ReplyPersonal,
                confidence: Confidence::Low,
                rule: "fallback-personal",
            }
        } else {
            RuleMatch {
                classification: Classification::ReplyOther,
                confidence: Confidence::Low,
                rule: "fallback-other",
            }
        }
    }
}

/// Structural bounce signals: a daemon sender, a delivery-report subject,
/// or a failed-recipients header.
fn looks_like_bounce(email: &InboundEmail) -> bool {
    DAEMON_SENDER.is_match(&email.sender)
        || email.has_header("x-failed-recipients")
        || email
            .subject
            .as_deref()
            .is_some_and(|s| BOUNCE_SUBJECT.is_match(s))
}
