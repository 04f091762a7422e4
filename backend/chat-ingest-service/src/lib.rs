//! Chat message ingestion
//!
//! Consumes chat message events from Kafka and stores each one exactly once
//! in PostgreSQL with a gap-free, per-conversation sequence number. Records
//! that cannot be stored are classified: malformed ones are dead-lettered at
//! once, transient failures are redelivered with backoff and dead-lettered
//! when the attempt budget runs out.

pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod store;

pub use dispatcher::{Dispatcher, Disposition, InboundRecord, RecordSource, Worker};
pub use error::{ErrorClass, FailureReason, IngestError, IngestResult};
pub use metrics::IngestMetrics;
