//! Dead-letter routing
//!
//! Failed records are republished to `<origin-topic><suffix>` on the same
//! partition with the same key, carrying the original fields plus failure
//! metadata. Nothing here retries; a failed publish is reported to the caller,
//! which leaves the origin record unacknowledged.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::dispatcher::InboundRecord;
use crate::error::{ErrorClass, FailureReason, IngestError, IngestResult};

/// Keys written by the router; an original field with the same name is dropped
const RESERVED_KEYS: &[&str] = &[
    "originTopic",
    "originPartition",
    "originOffset",
    "failureClass",
    "failureReason",
    "failureDetail",
    "attemptCount",
    "failedAt",
    "rawPayload",
];

pub fn dead_letter_topic(origin_topic: &str, suffix: &str) -> String {
    format!("{origin_topic}{suffix}")
}

/// Payload published to the dead-letter topic
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    /// Original event fields when the payload was a JSON object
    #[serde(flatten)]
    pub original: Map<String, Value>,
    /// Original payload text when it was not a JSON object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,
    pub origin_topic: String,
    pub origin_partition: i32,
    pub origin_offset: i64,
    pub failure_class: ErrorClass,
    pub failure_reason: FailureReason,
    pub failure_detail: String,
    pub attempt_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(
        record: &InboundRecord,
        class: ErrorClass,
        reason: FailureReason,
        detail: impl Into<String>,
        attempt_count: u32,
    ) -> Self {
        let (original, raw_payload) = split_payload(record.payload.as_deref());

        Self {
            original,
            raw_payload,
            origin_topic: record.topic.clone(),
            origin_partition: record.partition,
            origin_offset: record.offset,
            failure_class: class,
            failure_reason: reason,
            failure_detail: detail.into(),
            attempt_count,
            failed_at: Utc::now(),
        }
    }
}

fn split_payload(payload: Option<&[u8]>) -> (Map<String, Value>, Option<String>) {
    let Some(bytes) = payload else {
        return (Map::new(), None);
    };

    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(mut fields)) => {
            for key in RESERVED_KEYS {
                fields.remove(*key);
            }
            (fields, None)
        }
        _ => (
            Map::new(),
            Some(String::from_utf8_lossy(bytes).into_owned()),
        ),
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Publish `letter` for the failed `record`
    async fn publish(&self, record: &InboundRecord, letter: &DeadLetterRecord) -> IngestResult<()>;
}

#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    pub brokers: String,
    pub suffix: String,
    pub timeout: Duration,
}

pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    suffix: String,
    timeout: Duration,
}

impl KafkaDeadLetterSink {
    pub fn new(config: &DeadLetterConfig) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.timeout.as_millis().to_string())
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .create()?;

        Ok(Self {
            producer,
            suffix: config.suffix.clone(),
            timeout: config.timeout,
        })
    }

    async fn send(
        &self,
        topic: &str,
        record: &InboundRecord,
        payload: &str,
        reason: FailureReason,
        partition: Option<i32>,
    ) -> Result<(i32, i64), KafkaError> {
        let origin_partition = record.partition.to_string();
        let origin_offset = record.offset.to_string();

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "origin_topic",
                value: Some(record.topic.as_bytes()),
            })
            .insert(Header {
                key: "origin_partition",
                value: Some(origin_partition.as_bytes()),
            })
            .insert(Header {
                key: "origin_offset",
                value: Some(origin_offset.as_bytes()),
            })
            .insert(Header {
                key: "failure_reason",
                value: Some(reason.as_str().as_bytes()),
            });

        let mut future_record = FutureRecord::<str, str>::to(topic)
            .payload(payload)
            .headers(headers);
        if let Some(key) = record.key.as_deref() {
            future_record = future_record.key(key);
        }
        if let Some(partition) = partition {
            future_record = future_record.partition(partition);
        }

        self.producer
            .send(future_record, self.timeout)
            .await
            .map_err(|(err, _)| err)
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn publish(&self, record: &InboundRecord, letter: &DeadLetterRecord) -> IngestResult<()> {
        let topic = dead_letter_topic(&record.topic, &self.suffix);
        let payload = serde_json::to_string(letter)
            .map_err(|e| IngestError::DeadLetterPublish(format!("serialize: {e}")))?;

        let sent = match self
            .send(
                &topic,
                record,
                &payload,
                letter.failure_reason,
                Some(record.partition),
            )
            .await
        {
            Err(KafkaError::MessageProduction(RDKafkaErrorCode::UnknownPartition)) => {
                warn!(
                    topic = %topic,
                    partition = record.partition,
                    "Dead-letter topic has no matching partition, letting the partitioner choose"
                );
                self.send(&topic, record, &payload, letter.failure_reason, None)
                    .await
            }
            other => other,
        };

        match sent {
            Ok((partition, offset)) => {
                info!(
                    topic = %topic,
                    partition = partition,
                    offset = offset,
                    origin_partition = record.partition,
                    origin_offset = record.offset,
                    reason = %letter.failure_reason,
                    "Record dead-lettered"
                );
                Ok(())
            }
            Err(e) => Err(IngestError::DeadLetterPublish(format!("{topic}: {e}"))),
        }
    }
}
