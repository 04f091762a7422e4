//! Idempotent message persistence
//!
//! An event is stored at most once. Redeliveries are recognised by `event_id`
//! and, when the client supplied one, by `client_msg_id`; both return the
//! stored row with `duplicate = true` and never touch the sequence counter.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::IngestResult;
use crate::models::{Message, PersistOutcome, ValidatedEvent};
use crate::store::MessageStore;

/// Re-lookups allowed after losing an insert race before giving up
const MAX_RACE_RELOOKUPS: u32 = 2;

#[derive(Clone)]
pub struct PersistenceService {
    store: Arc<dyn MessageStore>,
}

impl PersistenceService {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub async fn persist(&self, event: &ValidatedEvent) -> IngestResult<PersistOutcome> {
        let mut relookups = 0;

        loop {
            if let Some(existing) = self.find_existing(event).await? {
                debug!(
                    event_id = %event.event_id,
                    conversation_id = %existing.conversation_id,
                    seq_no = existing.seq_no,
                    "Duplicate event, returning stored message"
                );
                return Ok(PersistOutcome::duplicate(existing));
            }

            match self.store.insert_sequenced(event).await {
                Ok(message) => {
                    info!(
                        event_id = %message.event_id,
                        conversation_id = %message.conversation_id,
                        seq_no = message.seq_no,
                        "Message persisted"
                    );
                    return Ok(PersistOutcome::created(message));
                }
                Err(e) if e.is_unique_violation() && relookups < MAX_RACE_RELOOKUPS => {
                    relookups += 1;
                    warn!(
                        event_id = %event.event_id,
                        relookup = relookups,
                        error = %e,
                        "Concurrent insert for the same event, re-checking for duplicate"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn find_existing(&self, event: &ValidatedEvent) -> IngestResult<Option<Message>> {
        if let Some(message) = self.store.find_by_event_id(&event.event_id).await? {
            return Ok(Some(message));
        }

        match &event.client_msg_id {
            Some(client_msg_id) => self.store.find_by_client_msg_id(client_msg_id).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::store::InMemoryMessageStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn event(event_id: &str, client_msg_id: Option<&str>) -> ValidatedEvent {
        ValidatedEvent {
            event_id: event_id.to_string(),
            client_msg_id: client_msg_id.map(str::to_string),
            conversation_id: "c1".to_string(),
            sender_id: "u1".to_string(),
            recipient_id: Some("u2".to_string()),
            content: "hi".to_string(),
            attachment_url: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_persist_then_duplicate() {
        let store = Arc::new(InMemoryMessageStore::new());
        let service = PersistenceService::new(store.clone());

        let first = service.persist(&event("e1", None)).await.unwrap();
        let second = service.persist(&event("e1", None)).await.unwrap();

        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.message.seq_no, 1);
        assert_eq!(second.message.seq_no, 1);
        assert_eq!(store.last_seq("c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_client_msg_id_dedup() {
        let store = Arc::new(InMemoryMessageStore::new());
        let service = PersistenceService::new(store.clone());

        service.persist(&event("e1", Some("m1"))).await.unwrap();
        let retry = service.persist(&event("e2", Some("m1"))).await.unwrap();

        assert!(retry.duplicate);
        assert_eq!(retry.message.event_id, "e1");
        assert_eq!(store.len().await, 1);
    }

    /// Store whose first lookups miss, simulating a concurrent writer that
    /// committed between the duplicate check and the insert
    struct RacingStore {
        inner: InMemoryMessageStore,
        hidden_lookups: AtomicU32,
    }

    #[async_trait]
    impl MessageStore for RacingStore {
        async fn find_by_event_id(&self, event_id: &str) -> IngestResult<Option<Message>> {
            if self.hidden_lookups.load(Ordering::SeqCst) > 0 {
                self.hidden_lookups.fetch_sub(1, Ordering::SeqCst);
                return Ok(None);
            }
            self.inner.find_by_event_id(event_id).await
        }

        async fn find_by_client_msg_id(&self, id: &str) -> IngestResult<Option<Message>> {
            self.inner.find_by_client_msg_id(id).await
        }

        async fn insert_sequenced(&self, event: &ValidatedEvent) -> IngestResult<Message> {
            self.inner.insert_sequenced(event).await
        }

        async fn last_seq(&self, conversation_id: &str) -> IngestResult<i64> {
            self.inner.last_seq(conversation_id).await
        }
    }

    #[tokio::test]
    async fn test_lost_race_resolves_to_duplicate() {
        let inner = InMemoryMessageStore::new();
        inner.insert_sequenced(&event("e1", None)).await.unwrap();
        let store = Arc::new(RacingStore {
            inner,
            hidden_lookups: AtomicU32::new(1),
        });
        let service = PersistenceService::new(store.clone());

        let outcome = service.persist(&event("e1", None)).await.unwrap();

        assert!(outcome.duplicate);
        assert_eq!(outcome.message.seq_no, 1);
        assert_eq!(store.last_seq("c1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persistent_conflict_surfaces_after_bounded_relookups() {
        let inner = InMemoryMessageStore::new();
        inner.insert_sequenced(&event("e1", None)).await.unwrap();
        let store = Arc::new(RacingStore {
            inner,
            hidden_lookups: AtomicU32::new(u32::MAX),
        });
        let service = PersistenceService::new(store);

        let err = service.persist(&event("e1", None)).await.unwrap_err();

        assert!(matches!(err, IngestError::DatastoreConstraint { .. }));
    }
}
