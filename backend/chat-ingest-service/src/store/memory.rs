use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::MessageStore;
use crate::error::{IngestError, IngestResult};
use crate::models::{Message, ValidatedEvent};

#[derive(Default)]
struct State {
    next_id: i64,
    messages: HashMap<String, Message>,
    client_msg_ids: HashMap<String, String>,
    counters: HashMap<String, i64>,
}

/// Process-local store with the same unique keys as the `messages` table
#[derive(Default)]
pub struct InMemoryMessageStore {
    state: Mutex<State>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Messages of one conversation ordered by `seq_no`
    pub async fn conversation(&self, conversation_id: &str) -> Vec<Message> {
        let state = self.state.lock().await;
        let mut messages: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.seq_no);
        messages
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn find_by_event_id(&self, event_id: &str) -> IngestResult<Option<Message>> {
        Ok(self.state.lock().await.messages.get(event_id).cloned())
    }

    async fn find_by_client_msg_id(&self, client_msg_id: &str) -> IngestResult<Option<Message>> {
        let state = self.state.lock().await;
        Ok(state
            .client_msg_ids
            .get(client_msg_id)
            .and_then(|event_id| state.messages.get(event_id))
            .cloned())
    }

    async fn insert_sequenced(&self, event: &ValidatedEvent) -> IngestResult<Message> {
        let mut state = self.state.lock().await;

        if state.messages.contains_key(&event.event_id) {
            return Err(IngestError::DatastoreConstraint {
                constraint: Some("uk_messages_event_id".into()),
            });
        }
        if let Some(client_msg_id) = &event.client_msg_id {
            if state.client_msg_ids.contains_key(client_msg_id) {
                return Err(IngestError::DatastoreConstraint {
                    constraint: Some("uk_messages_client_msg_id".into()),
                });
            }
        }

        let seq_no = {
            let counter = state
                .counters
                .entry(event.conversation_id.clone())
                .or_insert(0);
            *counter += 1;
            *counter
        };
        state.next_id += 1;

        let message = Message {
            id: state.next_id,
            event_id: event.event_id.clone(),
            client_msg_id: event.client_msg_id.clone(),
            conversation_id: event.conversation_id.clone(),
            sender_id: event.sender_id.clone(),
            recipient_id: event.recipient_id.clone(),
            content: event.content.clone(),
            attachment_url: event.attachment_url.clone(),
            seq_no,
            created_at: event.created_at,
            read_at: None,
            deleted_at: None,
        };

        if let Some(client_msg_id) = &event.client_msg_id {
            state
                .client_msg_ids
                .insert(client_msg_id.clone(), event.event_id.clone());
        }
        state
            .messages
            .insert(event.event_id.clone(), message.clone());

        Ok(message)
    }

    async fn last_seq(&self, conversation_id: &str) -> IngestResult<i64> {
        Ok(self
            .state
            .lock()
            .await
            .counters
            .get(conversation_id)
            .copied()
            .unwrap_or(0))
    }
}
