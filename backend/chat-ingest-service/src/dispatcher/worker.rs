use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{Dispatcher, Disposition, InboundRecord};
use crate::error::TransportError;

const UNHEALTHY_THRESHOLD: u32 = 5;
const CRITICAL_THRESHOLD: u32 = 10;
const MIN_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 60;

/// Transport feeding one worker
#[async_trait]
pub trait RecordSource: Send {
    /// Next record; `None` once the stream is closed.
    ///
    /// Must be cancel-safe: the worker races it against shutdown.
    async fn next_record(&mut self) -> Option<Result<InboundRecord, TransportError>>;

    /// Mark the record as done so it is never redelivered
    async fn ack(&mut self, record: &InboundRecord) -> Result<(), TransportError>;

    /// Make the record the next one delivered on its partition
    async fn nack(&mut self, record: &InboundRecord) -> Result<(), TransportError>;
}

/// Consecutive transport error tracking for one worker
#[derive(Debug, Default)]
pub struct TransportHealth {
    consecutive_errors: u32,
}

impl TransportHealth {
    /// Returns true when this success ends an unhealthy streak
    pub fn record_success(&mut self) -> bool {
        let recovered = !self.is_healthy();
        self.consecutive_errors = 0;
        recovered
    }

    pub fn record_error(&mut self) -> u32 {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.consecutive_errors
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_errors < UNHEALTHY_THRESHOLD
    }

    /// 1s doubling per consecutive error, capped at 60s
    pub fn backoff(&self) -> Duration {
        if self.consecutive_errors == 0 {
            return Duration::from_secs(MIN_BACKOFF_SECS);
        }
        let secs = 2u64
            .saturating_pow(self.consecutive_errors.saturating_sub(1))
            .min(MAX_BACKOFF_SECS);
        Duration::from_secs(secs)
    }
}

/// Settlement counts for one worker run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub acked: u64,
    pub dead_lettered: u64,
    pub retried: u64,
}

pub struct Worker<S> {
    id: usize,
    source: S,
    dispatcher: Arc<Dispatcher>,
    health: TransportHealth,
    summary: WorkerSummary,
}

impl<S: RecordSource> Worker<S> {
    pub fn new(id: usize, source: S, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            id,
            source,
            dispatcher,
            health: TransportHealth::default(),
            summary: WorkerSummary::default(),
        }
    }

    /// Pull and settle records until shutdown is signalled or the source ends.
    ///
    /// The record in flight when shutdown arrives is finished and settled;
    /// a record waiting out its retry backoff is left for redelivery.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerSummary {
        info!(worker = self.id, "Worker started");
        self.dispatcher.metrics().set_worker_healthy(self.id, true);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                next = self.source.next_record() => next,
            };

            let record = match next {
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    self.on_transport_error(e, &mut shutdown).await;
                    continue;
                }
                None => {
                    info!(worker = self.id, "Record stream closed");
                    break;
                }
            };

            if self.health.record_success() {
                info!(worker = self.id, "Kafka consumer recovered");
                self.dispatcher.metrics().set_worker_healthy(self.id, true);
            }

            let disposition = self.dispatcher.dispatch(&record).await;
            self.settle(&record, disposition, &mut shutdown).await;
        }

        info!(
            worker = self.id,
            acked = self.summary.acked,
            dead_lettered = self.summary.dead_lettered,
            retried = self.summary.retried,
            "Worker stopped"
        );
        self.summary
    }

    async fn settle(
        &mut self,
        record: &InboundRecord,
        disposition: Disposition,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        match disposition {
            Disposition::Acked(_) => {
                self.summary.acked += 1;
                self.ack(record).await;
            }
            Disposition::DeadLettered { .. } => {
                self.summary.dead_lettered += 1;
                self.ack(record).await;
            }
            Disposition::Retry { delay, attempt, .. } => {
                self.summary.retried += 1;
                debug!(
                    worker = self.id,
                    partition = record.partition,
                    offset = record.offset,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Backing off before redelivery"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        if let Err(e) = self.source.nack(record).await {
                            warn!(
                                worker = self.id,
                                partition = record.partition,
                                offset = record.offset,
                                error = %e,
                                "Failed to rewind partition for redelivery"
                            );
                        }
                    }
                    _ = wait_for_shutdown(shutdown) => {
                        info!(
                            worker = self.id,
                            offset = record.offset,
                            "Shutdown during backoff, record left for redelivery"
                        );
                    }
                }
            }
        }
    }

    async fn ack(&mut self, record: &InboundRecord) {
        if let Err(e) = self.source.ack(record).await {
            warn!(
                worker = self.id,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "Failed to acknowledge record, it may be redelivered"
            );
        }
    }

    async fn on_transport_error(
        &mut self,
        err: TransportError,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let metrics = self.dispatcher.metrics();
        metrics.consumer_errors_total.inc();
        let count = self.health.record_error();
        let backoff = self.health.backoff();

        if count >= CRITICAL_THRESHOLD {
            error!(
                worker = self.id,
                consecutive_errors = count,
                backoff_secs = backoff.as_secs(),
                error = %err,
                "Kafka consumer critically unhealthy"
            );
        } else if count >= UNHEALTHY_THRESHOLD {
            warn!(
                worker = self.id,
                consecutive_errors = count,
                backoff_secs = backoff.as_secs(),
                error = %err,
                "Kafka consumer unhealthy"
            );
        } else {
            warn!(
                worker = self.id,
                consecutive_errors = count,
                error = %err,
                "Kafka receive error"
            );
        }
        metrics.set_worker_healthy(self.id, self.health.is_healthy());

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = wait_for_shutdown(shutdown) => {}
        }
    }
}

/// Resolves once shutdown is signalled or the sender is gone
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut health = TransportHealth::default();
        assert_eq!(health.backoff(), Duration::from_secs(1));

        let expected = [1, 2, 4, 8, 16, 32, 60, 60];
        for secs in expected {
            health.record_error();
            assert_eq!(health.backoff(), Duration::from_secs(secs));
        }
    }

    #[test]
    fn test_unhealthy_after_five_errors() {
        let mut health = TransportHealth::default();
        for _ in 0..4 {
            health.record_error();
        }
        assert!(health.is_healthy());

        health.record_error();
        assert!(!health.is_healthy());

        assert!(health.record_success());
        assert!(health.is_healthy());
        assert!(!health.record_success());
    }

    #[tokio::test]
    async fn test_wait_for_shutdown_returns_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        wait_for_shutdown(&mut rx).await;
    }
}
