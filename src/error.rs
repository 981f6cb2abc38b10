//! Error types for the outreach engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Classification error: {0}")]
    Classify(#[from] ClassifyError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Target {target_id} already has an active attempt")]
    DuplicateActive { target_id: Uuid },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Transport adapter errors. Always transient from the orchestrator's
/// point of view: a failed send marks the attempt and falls through to
/// the next channel, it never cools the target down.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Channel {channel} is not configured")]
    NotConfigured { channel: String },

    #[error("Send failed on channel {channel}: {reason}")]
    SendFailed { channel: String, reason: String },

    #[error("Authentication failed on channel {channel}: {reason}")]
    AuthFailed { channel: String, reason: String },

    #[error("Target has no usable address for channel {channel}")]
    NoAddress { channel: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

/// Dispatch orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{entity} {id} cannot move from {from} to {requested}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        requested: String,
    },

    #[error("No configured channel accepts target {target_id}")]
    NoUsableChannel { target_id: Uuid },

    #[error("Content generation failed for target {target_id}: {reason}")]
    ContentFailed { target_id: Uuid, reason: String },

    #[error("Batch ceiling ({max}) must be non-zero")]
    EmptyBudget { max: usize },

    #[error("Pacer interval {interval:?} is invalid: {reason}")]
    InvalidPacing { interval: Duration, reason: String },
}

/// Feedback classification errors.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("Failed to parse raw message: {0}")]
    Parse(String),

    #[error("Signal {id} is already classified and immutable")]
    AlreadyClassified { id: Uuid },

    #[error("Spool read failed: {0}")]
    Spool(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Discovery ingest errors.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Malformed record on line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
