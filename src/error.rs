//! Error types for the automation pipeline.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Calendar error: {0}")]
    Calendar(#[from] CalendarError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
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
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Messaging transport errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Media download failed for {reference}: {reason}")]
    MediaFailed { reference: String, reason: String },

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Rate limited on channel {name}")]
    RateLimited { name: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Calendar provider errors.
#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("Calendar request failed: {0}")]
    RequestFailed(String),

    #[error("Calendar rejected event: {status} {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid calendar response: {0}")]
    InvalidResponse(String),
}

/// Action queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue item {id} not found")]
    NotFound { id: Uuid },

    #[error("Queue item {id} is {status}, expected {expected}")]
    InvalidTransition {
        id: Uuid,
        status: String,
        expected: String,
    },

    #[error("Queue item {id} is no longer claimed by {worker}")]
    ClaimLost { id: Uuid, worker: String },

    #[error("Claim timed out after {0:?}")]
    ClaimTimeout(Duration),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Errors raised by a single action run.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Invalid parameters for {action}: {reason}")]
    InvalidParameters { action: String, reason: String },

    #[error("No usable extraction for {action}")]
    MissingExtraction { action: String },

    #[error("Action {action} timed out after {timeout:?}")]
    Timeout { action: String, timeout: Duration },

    #[error("Webhook call failed: {0}")]
    Webhook(String),

    #[error("Email send failed: {0}")]
    Email(String),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Calendar error: {0}")]
    Calendar(#[from] CalendarError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Pipeline-related errors. Any of these sends the queue item back for retry.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Rule lookup failed: {0}")]
    Rules(#[from] DatabaseError),

    #[error("Ledger write failed for rule {rule_id}: {reason}")]
    Ledger { rule_id: Uuid, reason: String },

    #[error("{failed} of {total} rule runs did not complete")]
    RunsIncomplete { failed: usize, total: usize },
}

/// Event ingestion errors. `Invalid` maps to a 400; the rest to a 500.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Invalid event: {0}")]
    Invalid(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
