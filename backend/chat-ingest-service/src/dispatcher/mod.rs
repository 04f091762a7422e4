//! Record dispatch
//!
//! Runs one inbound record through deserialize, validate and persist, then
//! decides how the transport settles it:
//!
//! ```text
//! RECEIVED -> DESERIALIZING -> VALIDATING -> PERSISTING -> ACKED_OK
//!                                                       -> ACKED_DEADLETTERED
//!                                                       -> UNACKED_RETRY
//! ```
//!
//! A record is acknowledged only once it is durably stored or has been
//! handed to the dead-letter topic. Every failure is classified here, so a
//! bad record never takes a worker down.

pub mod delivery;
pub mod kafka;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use resilience::RetryConfig;
use tracing::{debug, error, info_span, trace, warn, Instrument};

use crate::error::{ErrorClass, FailureReason, IngestError, IngestResult};
use crate::metrics::IngestMetrics;
use crate::models::{ChatMessageEvent, PersistOutcome};
use crate::services::{DeadLetterRecord, DeadLetterSink, PersistenceService};

pub use worker::{RecordSource, Worker, WorkerSummary};

/// One record as delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    /// `None` for a tombstone
    pub payload: Option<Vec<u8>>,
    pub timestamp: Option<DateTime<Utc>>,
    /// 1 on first delivery, incremented on each redelivery
    pub delivery_attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Received,
    Deserializing,
    Validating,
    Persisting,
    AckedOk,
    AckedDeadLettered,
    UnackedRetry,
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Received => "RECEIVED",
            RecordState::Deserializing => "DESERIALIZING",
            RecordState::Validating => "VALIDATING",
            RecordState::Persisting => "PERSISTING",
            RecordState::AckedOk => "ACKED_OK",
            RecordState::AckedDeadLettered => "ACKED_DEADLETTERED",
            RecordState::UnackedRetry => "UNACKED_RETRY",
        }
    }
}

/// How the transport must settle a dispatched record
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Stored (or already stored); acknowledge
    Acked(PersistOutcome),
    /// Published to the dead-letter topic; acknowledge
    DeadLettered {
        reason: FailureReason,
        class: ErrorClass,
        attempts: u32,
    },
    /// Leave unacknowledged and redeliver after `delay`
    Retry {
        delay: Duration,
        attempt: u32,
        reason: FailureReason,
    },
}

impl Disposition {
    pub fn state(&self) -> RecordState {
        match self {
            Disposition::Acked(_) => RecordState::AckedOk,
            Disposition::DeadLettered { .. } => RecordState::AckedDeadLettered,
            Disposition::Retry { .. } => RecordState::UnackedRetry,
        }
    }

    pub fn should_ack(&self) -> bool {
        !matches!(self, Disposition::Retry { .. })
    }
}

pub struct Dispatcher {
    persistence: PersistenceService,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry: RetryConfig,
    metrics: IngestMetrics,
}

impl Dispatcher {
    pub fn new(
        persistence: PersistenceService,
        dead_letters: Arc<dyn DeadLetterSink>,
        retry: RetryConfig,
        metrics: IngestMetrics,
    ) -> Self {
        Self {
            persistence,
            dead_letters,
            retry,
            metrics,
        }
    }

    pub fn metrics(&self) -> &IngestMetrics {
        &self.metrics
    }

    pub async fn dispatch(&self, record: &InboundRecord) -> Disposition {
        let span = info_span!(
            "record",
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            attempt = record.delivery_attempt
        );

        async {
            let timer = self.metrics.processing_seconds.start_timer();
            let mut state = RecordState::Received;

            let disposition = match self.run_pipeline(record, &mut state).await {
                Ok(outcome) => {
                    self.metrics.messages_processed_total.inc();
                    if outcome.duplicate {
                        self.metrics.messages_duplicate_total.inc();
                    }
                    Disposition::Acked(outcome)
                }
                Err(e) => {
                    self.metrics.messages_failed_total.inc();
                    self.handle_failure(record, e, state).await
                }
            };

            timer.observe_duration();
            debug!(state = disposition.state().as_str(), "Record dispatched");
            disposition
        }
        .instrument(span)
        .await
    }

    async fn run_pipeline(
        &self,
        record: &InboundRecord,
        state: &mut RecordState,
    ) -> IngestResult<PersistOutcome> {
        transition(state, RecordState::Deserializing);
        let event = ChatMessageEvent::from_payload(record.payload.as_deref())?;

        transition(state, RecordState::Validating);
        let event = event.into_validated(Utc::now())?;

        transition(state, RecordState::Persisting);
        self.persistence.persist(&event).await
    }

    async fn handle_failure(
        &self,
        record: &InboundRecord,
        err: IngestError,
        failed_in: RecordState,
    ) -> Disposition {
        let attempt = record.delivery_attempt.max(1);
        let class = err.class();
        let reason = err.reason();

        match class {
            ErrorClass::NonRecoverable => {
                warn!(
                    stage = failed_in.as_str(),
                    reason = %reason,
                    error = %err,
                    "Non-recoverable failure, dead-lettering record"
                );
                self.dead_letter(record, class, reason, err.to_string(), attempt)
                    .await
            }
            ErrorClass::Recoverable if self.retry.is_exhausted(attempt) => {
                error!(
                    attempts = attempt,
                    partition = record.partition,
                    offset = record.offset,
                    reason = %reason,
                    error = %err,
                    "Retries exhausted, dead-lettering record"
                );
                self.dead_letter(
                    record,
                    class,
                    FailureReason::RetriesExhausted,
                    format!("{reason}: {err}"),
                    attempt,
                )
                .await
            }
            ErrorClass::Recoverable => {
                warn!(
                    attempt = attempt,
                    max_attempts = self.retry.max_attempts,
                    reason = %reason,
                    error = %err,
                    "Recoverable failure, record will be redelivered"
                );
                self.retry_later(attempt, reason)
            }
        }
    }

    async fn dead_letter(
        &self,
        record: &InboundRecord,
        class: ErrorClass,
        reason: FailureReason,
        detail: String,
        attempt: u32,
    ) -> Disposition {
        let letter = DeadLetterRecord::new(record, class, reason, detail, attempt);

        match self.dead_letters.publish(record, &letter).await {
            Ok(()) => {
                self.metrics.record_dead_lettered(reason);
                Disposition::DeadLettered {
                    reason,
                    class,
                    attempts: attempt,
                }
            }
            Err(e) => {
                error!(
                    reason = %reason,
                    error = %e,
                    "Dead-letter publish failed, leaving record unacknowledged"
                );
                self.retry_later(attempt, FailureReason::DeadLetterUnavailable)
            }
        }
    }

    /// Redelivery after `attempt`; a failed dead-letter publish past the budget
    /// waits as long as the last regular retry
    fn retry_later(&self, attempt: u32, reason: FailureReason) -> Disposition {
        self.metrics.messages_retried_total.inc();
        Disposition::Retry {
            delay: self
                .retry
                .backoff_for(attempt.min(self.retry.last_retry_attempt())),
            attempt,
            reason,
        }
    }
}

fn transition(state: &mut RecordState, next: RecordState) {
    trace!(from = state.as_str(), to = next.as_str(), "Record state");
    *state = next;
}
