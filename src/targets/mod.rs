//! Target identity: normalization, dedup/merge, discovery ingest.

pub mod identity;
pub mod ingest;
pub mod model;
pub mod store;

pub use ingest::{IngestSummary, ingest_file, ingest_stream};
pub use model::{RawTargetRecord, SimilarTarget, Target, TargetSource, TargetState};
pub use store::{TargetStore, Upserted};
