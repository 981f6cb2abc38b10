//! Delivery feedback: classification, correlation, state side effects.

pub mod extract;
pub mod processor;
pub mod rules;
pub mod spool;
pub mod types;

pub use extract::AddressExtractor;
pub use processor::{FeedbackProcessor, ProcessSummary};
pub use rules::Classifier;
pub use spool::SpoolReader;
pub use types::{Classification, Confidence, InboundEmail, InboundSignal, RuleMatch};
