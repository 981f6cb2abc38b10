//! Content generation seam.
//!
//! Message bodies come from an external generator; the engine treats them as
//! opaque and persists only the reference. `TemplateGenerator` is the
//! built-in implementation for deployments without a separate generator
//! process.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::targets::model::Target;

/// An opaque message payload. The engine records `reference` on the
/// attempt and never inspects `subject`/`body` beyond handing them to a
/// transport.
#[derive(Debug, Clone)]
pub struct MessagePayload {
    pub reference: String,
    pub subject: String,
    pub body: String,
}

/// External content generator seam.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    /// Produce a message payload for one target.
    async fn generate(&self, target: &Target) -> Result<MessagePayload, DispatchError>;
}

/// Minimal built-in generator: fills a fixed template from the target's
/// display fields.
pub struct TemplateGenerator {
    subject_template: String,
    body_template: String,
}

impl TemplateGenerator {
    pub fn new(subject_template: impl Into<String>, body_template: impl Into<String>) -> Self {
        Self {
            subject_template: subject_template.into(),
            body_template: body_template.into(),
        }
    }

    fn fill(template: &str, target: &Target) -> String {
        template
            .replace("{organization}", &target.display_organization)
            .replace("{role}", &target.display_role)
    }
}

impl Default for TemplateGenerator {
    fn default() -> Self {
        Self::new(
            "Regarding the {role} opening at {organization}",
            "Hello,\n\nI came across the {role} opening at {organization} and \
             would like to be considered.\n",
        )
    }
}

#[async_trait]
impl ContentGenerator for TemplateGenerator {
    async fn generate(&self, target: &Target) -> Result<MessagePayload, DispatchError> {
        Ok(MessagePayload {
            reference: format!("tmpl-{}", Uuid::new_v4()),
            subject: Self::fill(&self.subject_template, target),
            body: Self::fill(&self.body_template, target),
        })
    }
}
