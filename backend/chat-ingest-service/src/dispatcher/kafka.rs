//! Kafka transport for the worker loop
//!
//! Each worker owns a `StreamConsumer` in the shared consumer group, so the
//! broker hands every worker a disjoint set of partitions. Offsets are only
//! committed on acknowledgment; a negative acknowledgment seeks the partition
//! back to the failed record.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Message, OwnedMessage};
use rdkafka::{Offset, TopicPartitionList};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::delivery::DeliveryTracker;
use super::{Dispatcher, InboundRecord, RecordSource, Worker, WorkerSummary};
use crate::config::KafkaConfig;
use crate::error::TransportError;
use crate::services::dead_letter_topic;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaRecordSource {
    consumer: StreamConsumer,
    deliveries: DeliveryTracker,
}

impl KafkaRecordSource {
    pub fn new(config: &KafkaConfig, worker_id: usize) -> Result<Self, KafkaError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("client.id", format!("{}-{}", config.group_id, worker_id))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", config.max_poll_interval_ms.to_string())
            .set("fetch.wait.max.ms", "500")
            .set("fetch.min.bytes", "1")
            .set("isolation.level", "read_uncommitted")
            .set("enable.partition.eof", "false")
            .create()?;

        consumer.subscribe(&[config.topic.as_str()])?;

        info!(
            worker = worker_id,
            topic = %config.topic,
            group_id = %config.group_id,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            deliveries: DeliveryTracker::new(),
        })
    }

    /// True when the message was fetched ahead of a rewound offset and must be
    /// dropped so the rewound record is delivered first
    fn is_stale(&mut self, message: &OwnedMessage) -> bool {
        let (topic, partition) = (message.topic(), message.partition());
        let Some(expected) = self
            .deliveries
            .stale_rewind(topic, partition, message.offset())
        else {
            return false;
        };

        trace!(
            partition = partition,
            offset = message.offset(),
            expected = expected,
            "Skipping record fetched past a rewound offset"
        );

        // Seeking fails once the partition is no longer assigned here
        if let Err(e) = self
            .consumer
            .seek(topic, partition, Offset::Offset(expected), SEEK_TIMEOUT)
        {
            debug!(
                partition = partition,
                error = %e,
                "Rewind no longer applicable, resuming from current position"
            );
            self.deliveries.clear_rewind(topic, partition);
            return false;
        }
        true
    }
}

fn to_inbound(message: &OwnedMessage, delivery_attempt: u32) -> InboundRecord {
    InboundRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        payload: message.payload().map(<[u8]>::to_vec),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        delivery_attempt,
    }
}

#[async_trait]
impl RecordSource for KafkaRecordSource {
    async fn next_record(&mut self) -> Option<Result<InboundRecord, TransportError>> {
        loop {
            let message = match self.consumer.recv().await {
                Ok(message) => message.detach(),
                Err(e) => return Some(Err(e.into())),
            };

            if self.is_stale(&message) {
                continue;
            }

            let attempt =
                self.deliveries
                    .next_attempt(message.topic(), message.partition(), message.offset());
            return Some(Ok(to_inbound(&message, attempt)));
        }
    }

    async fn ack(&mut self, record: &InboundRecord) -> Result<(), TransportError> {
        // Settled even when the commit fails; a redelivery counts from 1 again
        self.deliveries
            .on_ack(&record.topic, record.partition, record.offset);

        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)?;
        trace!(partition = record.partition, offset = record.offset, "Offset committed");
        Ok(())
    }

    async fn nack(&mut self, record: &InboundRecord) -> Result<(), TransportError> {
        self.consumer.seek(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset),
            SEEK_TIMEOUT,
        )?;
        self.deliveries
            .on_nack(&record.topic, record.partition, record.offset);
        debug!(
            partition = record.partition,
            offset = record.offset,
            "Partition rewound for redelivery"
        );
        Ok(())
    }
}

/// Start `config.concurrency` workers, each with its own consumer
pub fn spawn_workers(
    config: &KafkaConfig,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Receiver<bool>,
) -> Result<Vec<JoinHandle<WorkerSummary>>, KafkaError> {
    let mut handles = Vec::with_capacity(config.concurrency);

    for worker_id in 0..config.concurrency {
        let source = KafkaRecordSource::new(config, worker_id)?;
        let worker = Worker::new(worker_id, source, dispatcher.clone());
        handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    info!(workers = handles.len(), topic = %config.topic, "Kafka workers started");
    Ok(handles)
}

/// Create the origin and dead-letter topics if they do not exist
pub async fn ensure_topics(config: &KafkaConfig) -> Result<(), KafkaError> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &config.brokers)
        .set("request.timeout.ms", "5000")
        .create()?;

    let dead_letter = dead_letter_topic(&config.topic, &config.dead_letter_suffix);
    let topics = [
        NewTopic::new(
            &config.topic,
            config.topic_partitions,
            TopicReplication::Fixed(config.topic_replication),
        ),
        NewTopic::new(
            &dead_letter,
            config.topic_partitions,
            TopicReplication::Fixed(config.topic_replication),
        ),
    ];

    let results = admin.create_topics(&topics, &AdminOptions::new()).await?;
    for result in results {
        match result {
            Ok(topic) => info!(topic = %topic, "Kafka topic created"),
            Err((topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                debug!(topic = %topic, "Kafka topic already exists")
            }
            Err((topic, code)) => {
                warn!(topic = %topic, code = ?code, "Kafka topic creation failed");
                return Err(KafkaError::AdminOp(code));
            }
        }
    }

    Ok(())
}
