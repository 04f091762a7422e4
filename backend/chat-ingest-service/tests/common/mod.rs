#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chat_ingest_service::dispatcher::{Dispatcher, InboundRecord, RecordSource};
use chat_ingest_service::error::{IngestError, IngestResult, TransportError};
use chat_ingest_service::metrics::IngestMetrics;
use chat_ingest_service::models::{Message, ValidatedEvent};
use chat_ingest_service::services::{DeadLetterRecord, DeadLetterSink, PersistenceService};
use chat_ingest_service::store::{InMemoryMessageStore, MessageStore};
use prometheus::Registry;
use resilience::RetryConfig;
use tokio::sync::Barrier;

pub const TOPIC: &str = "chat-messages";

pub fn event_json(event_id: &str, conversation_id: &str, content: &str) -> String {
    serde_json::json!({
        "eventId": event_id,
        "conversationId": conversation_id,
        "senderId": "alice",
        "recipientId": "bob",
        "content": content,
    })
    .to_string()
}

pub fn record(partition: i32, offset: i64, payload: &str) -> InboundRecord {
    InboundRecord {
        topic: TOPIC.to_string(),
        partition,
        offset,
        key: None,
        payload: Some(payload.as_bytes().to_vec()),
        timestamp: None,
        delivery_attempt: 1,
    }
}

/// Millisecond backoff with the default attempt budget
pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

pub fn dispatcher(
    store: Arc<dyn MessageStore>,
    sink: Arc<dyn DeadLetterSink>,
    retry: RetryConfig,
) -> Arc<Dispatcher> {
    let metrics = IngestMetrics::register(&Registry::new()).expect("metrics register");
    Arc::new(Dispatcher::new(
        PersistenceService::new(store),
        sink,
        retry,
        metrics,
    ))
}

/// Dead-letter sink that keeps every published letter
#[derive(Default)]
pub struct RecordingSink {
    letters: Mutex<Vec<DeadLetterRecord>>,
    failures_remaining: AtomicU32,
}

impl RecordingSink {
    pub fn failing(times: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(times),
            ..Default::default()
        }
    }

    pub fn letters(&self) -> Vec<DeadLetterRecord> {
        self.letters.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingSink {
    async fn publish(&self, _record: &InboundRecord, letter: &DeadLetterRecord) -> IngestResult<()> {
        if take_failure(&self.failures_remaining) {
            return Err(IngestError::DeadLetterPublish("broker unavailable".into()));
        }
        self.letters.lock().unwrap().push(letter.clone());
        Ok(())
    }
}

fn take_failure(remaining: &AtomicU32) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Store whose inserts fail with a transient error a fixed number of times
pub struct FlakyStore {
    pub inner: InMemoryMessageStore,
    failures_remaining: AtomicU32,
    pub insert_calls: AtomicU32,
}

impl FlakyStore {
    pub fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryMessageStore::new(),
            failures_remaining: AtomicU32::new(failures),
            insert_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl MessageStore for FlakyStore {
    async fn find_by_event_id(&self, event_id: &str) -> IngestResult<Option<Message>> {
        self.inner.find_by_event_id(event_id).await
    }

    async fn find_by_client_msg_id(&self, client_msg_id: &str) -> IngestResult<Option<Message>> {
        self.inner.find_by_client_msg_id(client_msg_id).await
    }

    async fn insert_sequenced(&self, event: &ValidatedEvent) -> IngestResult<Message> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures_remaining) {
            return Err(IngestError::DatastoreTransient("pool timed out".into()));
        }
        self.inner.insert_sequenced(event).await
    }

    async fn last_seq(&self, conversation_id: &str) -> IngestResult<i64> {
        self.inner.last_seq(conversation_id).await
    }
}

/// Store that holds every insert until `parties` inserts are waiting, so all
/// duplicate checks run before any row exists
pub struct InterleavingStore {
    pub inner: InMemoryMessageStore,
    barrier: Barrier,
    armed: AtomicU32,
}

impl InterleavingStore {
    pub fn new(parties: usize) -> Self {
        Self {
            inner: InMemoryMessageStore::new(),
            barrier: Barrier::new(parties),
            armed: AtomicU32::new(parties as u32),
        }
    }
}

#[async_trait]
impl MessageStore for InterleavingStore {
    async fn find_by_event_id(&self, event_id: &str) -> IngestResult<Option<Message>> {
        self.inner.find_by_event_id(event_id).await
    }

    async fn find_by_client_msg_id(&self, client_msg_id: &str) -> IngestResult<Option<Message>> {
        self.inner.find_by_client_msg_id(client_msg_id).await
    }

    async fn insert_sequenced(&self, event: &ValidatedEvent) -> IngestResult<Message> {
        // Only the first round of inserts waits; re-tries after a lost race pass through
        if take_failure(&self.armed) {
            self.barrier.wait().await;
        }
        self.inner.insert_sequenced(event).await
    }

    async fn last_seq(&self, conversation_id: &str) -> IngestResult<i64> {
        self.inner.last_seq(conversation_id).await
    }
}

#[derive(Debug, Default)]
pub struct SourceLog {
    pub acked: Vec<(i32, i64)>,
    pub nacked: Vec<(i32, i64, u32)>,
}

/// In-memory record source.
///
/// A nack puts the record back at the head of the queue with its delivery
/// attempt incremented, like a partition rewind.
pub struct ScriptedSource {
    queue: VecDeque<InboundRecord>,
    close_when_empty: bool,
    log: Arc<Mutex<SourceLog>>,
}

impl ScriptedSource {
    pub fn new(records: Vec<InboundRecord>) -> (Self, Arc<Mutex<SourceLog>>) {
        let log = Arc::new(Mutex::new(SourceLog::default()));
        let source = Self {
            queue: records.into(),
            close_when_empty: true,
            log: log.clone(),
        };
        (source, log)
    }

    /// Keep the stream open after the last record, like an idle partition
    pub fn stay_open(mut self) -> Self {
        self.close_when_empty = false;
        self
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn next_record(&mut self) -> Option<Result<InboundRecord, TransportError>> {
        match self.queue.pop_front() {
            Some(record) => Some(Ok(record)),
            None if self.close_when_empty => None,
            None => std::future::pending().await,
        }
    }

    async fn ack(&mut self, record: &InboundRecord) -> Result<(), TransportError> {
        self.log
            .lock()
            .unwrap()
            .acked
            .push((record.partition, record.offset));
        Ok(())
    }

    async fn nack(&mut self, record: &InboundRecord) -> Result<(), TransportError> {
        self.log.lock().unwrap().nacked.push((
            record.partition,
            record.offset,
            record.delivery_attempt,
        ));
        let mut redelivery = record.clone();
        redelivery.delivery_attempt += 1;
        self.queue.push_front(redelivery);
        Ok(())
    }
}
