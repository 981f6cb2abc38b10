//! Outbound dispatch: attempt lifecycle, pacing, batch orchestration.

pub mod attempt;
pub mod orchestrator;
pub mod pacing;

pub use attempt::{Attempt, AttemptOutcome};
pub use orchestrator::{BatchSummary, Orchestrator};
pub use pacing::SendPacer;
