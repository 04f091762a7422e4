//! Error types and failure classification for the ingest pipeline

use rdkafka::error::KafkaError;
use serde::Serialize;
use thiserror::Error;

pub type IngestResult<T> = Result<T, IngestError>;

/// Decides whether a failed record is retried or dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorClass {
    /// Leave unacknowledged, redeliver with backoff
    Recoverable,
    /// Acknowledge and dead-letter immediately
    NonRecoverable,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Recoverable => "RECOVERABLE",
            ErrorClass::NonRecoverable => "NON_RECOVERABLE",
        }
    }
}

/// Reason code attached to failure metrics, logs and dead-letter records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    MalformedPayload,
    MissingField,
    SchemaViolation,
    DatastoreUnavailable,
    DuplicateRace,
    Unknown,
    RetriesExhausted,
    DeadLetterUnavailable,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::MalformedPayload => "malformed_payload",
            FailureReason::MissingField => "missing_field",
            FailureReason::SchemaViolation => "schema_violation",
            FailureReason::DatastoreUnavailable => "datastore_unavailable",
            FailureReason::DuplicateRace => "duplicate_race",
            FailureReason::Unknown => "unknown",
            FailureReason::RetriesExhausted => "retries_exhausted",
            FailureReason::DeadLetterUnavailable => "dead_letter_unavailable",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("validation error on {field}: {message}")]
    Validation {
        field: String,
        message: String,
        /// The field was absent or blank rather than malformed
        missing: bool,
    },

    #[error("datastore transient error: {0}")]
    DatastoreTransient(String),

    #[error("unique constraint violated: {}", constraint.as_deref().unwrap_or("unnamed"))]
    DatastoreConstraint { constraint: Option<String> },

    #[error("datastore rejected row: {0}")]
    DatastoreRejected(String),

    #[error("dead-letter publish failed: {0}")]
    DeadLetterPublish(String),

    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl IngestError {
    pub fn missing_field(field: &str) -> Self {
        IngestError::Validation {
            field: field.to_string(),
            message: "is required".to_string(),
            missing: true,
        }
    }

    pub fn invalid_field(field: &str, message: impl Into<String>) -> Self {
        IngestError::Validation {
            field: field.to_string(),
            message: message.into(),
            missing: false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            IngestError::Deserialization(_)
            | IngestError::Validation { .. }
            | IngestError::DatastoreRejected(_) => ErrorClass::NonRecoverable,
            IngestError::DatastoreTransient(_)
            | IngestError::DatastoreConstraint { .. }
            | IngestError::DeadLetterPublish(_)
            | IngestError::Unknown(_) => ErrorClass::Recoverable,
        }
    }

    pub fn reason(&self) -> FailureReason {
        match self {
            IngestError::Deserialization(_) => FailureReason::MalformedPayload,
            IngestError::Validation { missing: true, .. } => FailureReason::MissingField,
            IngestError::Validation { missing: false, .. } => FailureReason::SchemaViolation,
            IngestError::DatastoreRejected(_) => FailureReason::SchemaViolation,
            IngestError::DatastoreTransient(_) => FailureReason::DatastoreUnavailable,
            IngestError::DatastoreConstraint { .. } => FailureReason::DuplicateRace,
            IngestError::DeadLetterPublish(_) => FailureReason::DeadLetterUnavailable,
            IngestError::Unknown(_) => FailureReason::Unknown,
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self, IngestError::DatastoreConstraint { .. })
    }
}

/// Kind of datastore failure, derived from the error variant and SQLSTATE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DatastoreFailure {
    UniqueViolation,
    Transient,
    Rejected,
    Unknown,
}

/// Classify a PostgreSQL SQLSTATE code
pub(crate) fn classify_sqlstate(code: &str) -> DatastoreFailure {
    match code {
        "23505" => DatastoreFailure::UniqueViolation,
        // serialization_failure, deadlock_detected, lock_not_available, query_canceled
        "40001" | "40P01" | "55P03" | "57014" => DatastoreFailure::Transient,
        // connection_exception and insufficient_resources classes
        c if c.starts_with("08") || c.starts_with("53") => DatastoreFailure::Transient,
        // data_exception and integrity_constraint_violation classes
        c if c.starts_with("22") || c.starts_with("23") => DatastoreFailure::Rejected,
        _ => DatastoreFailure::Unknown,
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::WorkerCrashed => IngestError::DatastoreTransient(err.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
                match classify_sqlstate(&code) {
                    DatastoreFailure::UniqueViolation => IngestError::DatastoreConstraint {
                        constraint: db_err.constraint().map(str::to_string),
                    },
                    DatastoreFailure::Transient => IngestError::DatastoreTransient(err.to_string()),
                    DatastoreFailure::Rejected => IngestError::DatastoreRejected(err.to_string()),
                    DatastoreFailure::Unknown => IngestError::Unknown(err.to_string()),
                }
            }
            _ => IngestError::Unknown(err.to_string()),
        }
    }
}

/// Failure to receive from, or settle a record with, the transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("transport error: {0}")]
    Other(String),
}
