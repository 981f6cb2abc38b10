//! Inbound signal types and raw message parsing.

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ClassifyError;

/// Classification taxonomy for delivery feedback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Permanent delivery failure (5xx, user unknown).
    BounceHard,
    /// Transient delivery failure (4xx, mailbox full).
    BounceSoft,
    /// Delivery failure of indeterminate permanence.
    BounceUnknown,
    /// Explicit rejection reply.
    ReplyRejection,
    /// Interview invitation or other forward motion.
    ReplyInterviewOrNextStep,
    /// Automated acknowledgement ("we received your application").
    ReplyAutoAck,
    /// A human wrote back, intent unclear.
    ReplyPersonal,
    /// Anything else.
    ReplyOther,
}

impl Classification {
    pub fn is_bounce(&self) -> bool {
        matches!(
            self,
            Self::BounceHard | Self::BounceSoft | Self::BounceUnknown
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BounceHard => "bounce_hard",
            Self::BounceSoft => "bounce_soft",
            Self::BounceUnknown => "bounce_unknown",
            Self::ReplyRejection => "reply_rejection",
            Self::ReplyInterviewOrNextStep => "reply_interview_or_next_step",
            Self::ReplyAutoAck => "reply_auto_ack",
            Self::ReplyPersonal => "reply_personal",
            Self::ReplyOther => "reply_other",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How strong the evidence behind a classification is. State side effects
/// only fire on `High` and `Medium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A raw inbound message before classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEmail {
    pub sender: String,
    pub subject: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
    /// Lowercased header names, for structural delivery-report checks.
    pub header_names: Vec<String>,
}

impl InboundEmail {
    /// Parse a raw RFC-822 message.
    pub fn from_rfc822(raw: &[u8]) -> Result<Self, ClassifyError> {
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| ClassifyError::Parse("unparsable message".into()))?;

        let sender = extract_sender(&parsed);
        let subject = parsed.subject().map(|s| s.to_string());
        let body = extract_text(&parsed);
        let header_names = parsed
            .parts
            .first()
            .map(|part| {
                part.headers
                    .iter()
                    .map(|h| h.name.as_str().to_lowercase())
                    .collect()
            })
            .unwrap_or_default();

        let received_at = parsed
            .date()
            .and_then(|d| {
                chrono::NaiveDate::from_ymd_opt(
                    i32::from(d.year),
                    u32::from(d.month),
                    u32::from(d.day),
                )
                .and_then(|date| {
                    date.and_hms_opt(
                        u32::from(d.hour),
                        u32::from(d.minute),
                        u32::from(d.second),
                    )
                })
                .map(|naive| naive.and_utc())
            })
            .unwrap_or_else(Utc::now);

        Ok(Self {
            sender,
            subject,
            body,
            received_at,
            header_names,
        })
    }

    /// Check for a header by (lowercase) name.
    pub fn has_header(&self, name: &str) -> bool {
        self.header_names.iter().any(|h| h == name)
    }
}

/// Result of running the classifier rules over one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleMatch {
    pub classification: Classification,
    pub confidence: Confidence,
    /// Name of the rule that fired, for the audit trail.
    pub rule: &'static str,
}

/// A classified, stored signal. Immutable once written: the classification
/// is a snapshot of the rules at processing time and is never re-scored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundSignal {
    pub id: Uuid,
    pub sender: String,
    pub subject: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
    pub header_names: Vec<String>,
    pub classification: Classification,
    pub confidence: Confidence,
    pub matched_rule: Option<String>,
    /// Address recovered from a bounce body, when one was found.
    pub extracted_address: Option<String>,
    /// Correlated attempt, or `None` for unresolved signals.
    pub attempt_id: Option<Uuid>,
    /// Correlated target, or `None` for unresolved signals.
    pub target_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl InboundSignal {
    /// Whether correlation found an owning attempt.
    pub fn is_resolved(&self) -> bool {
        self.attempt_id.is_some()
    }
}

/// Extract the sender address from a parsed email.
fn extract_sender(parsed: &mail_parser::Message) -> String {
    parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

/// Extract readable text from a parsed email. Falls back to stripped HTML,
/// then to text attachments (delivery reports often carry the original
/// message and the status part as attachments).
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            return text.to_string();
        }
    }
    String::new()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_rfc822_plain_message() {
        let raw = b"From: alice@acme.example\r\n\
                    To: me@self.example\r\n\
                    Subject: Re: Backend opening\r\n\
                    Date: Mon, 4 Aug 2025 10:00:00 +0000\r\n\
                    \r\n\
                    Thanks for reaching out, let's talk.\r\n";
        let email = InboundEmail::from_rfc822(raw).unwrap();
        assert_eq!(email.sender, "alice@acme.example");
        assert_eq!(email.subject.as_deref(), Some("Re: Backend opening"));
        assert!(email.body.contains("let's talk"));
        assert!(email.has_header("subject"));
        assert!(!email.has_header("x-failed-recipients"));
    }

    #[test]
    fn from_rfc822_rejects_garbage() {
        assert!(InboundEmail::from_rfc822(&[]).is_err());
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello <b>there</b></p>"), "Hello there");
        assert_eq!(strip_html("no tags"), "no tags");
    }

    #[test]
    fn classification_strings() {
        assert_eq!(Classification::BounceHard.as_str(), "bounce_hard");
        assert_eq!(
            Classification::ReplyInterviewOrNextStep.as_str(),
            "reply_interview_or_next_step"
        );
        assert!(Classification::BounceUnknown.is_bounce());
        assert!(!Classification::ReplyRejection.is_bounce());
    }

    #[test]
    fn confidence_ordering() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
    }

    #[test]
    fn classification_serde_roundtrip() {
        let json = serde_json::to_string(&Classification::ReplyInterviewOrNextStep).unwrap();
        assert_eq!(json, "\"reply_interview_or_next_step\"");
        let parsed: Classification = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Classification::ReplyInterviewOrNextStep);
    }
}
