use async_trait::async_trait;
use sqlx::PgPool;

use super::MessageStore;
use crate::error::IngestResult;
use crate::models::{Message, ValidatedEvent};
use crate::services::sequencer::SequenceAllocator;

const MESSAGE_COLUMNS: &str = "id, event_id, client_msg_id, conversation_id, sender_id, \
     recipient_id, content, attachment_url, seq_no, created_at, read_at, deleted_at";

#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
}

impl PgMessageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn find_by_event_id(&self, event_id: &str) -> IngestResult<Option<Message>> {
        let query = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE event_id = $1");
        let message = sqlx::query_as::<_, Message>(&query)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(message)
    }

    async fn find_by_client_msg_id(&self, client_msg_id: &str) -> IngestResult<Option<Message>> {
        let query = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE client_msg_id = $1");
        let message = sqlx::query_as::<_, Message>(&query)
            .bind(client_msg_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(message)
    }

    async fn insert_sequenced(&self, event: &ValidatedEvent) -> IngestResult<Message> {
        let mut tx = self.pool.begin().await?;

        let seq_no = SequenceAllocator::allocate(&mut tx, &event.conversation_id).await?;

        let query = format!(
            r#"
            INSERT INTO messages (
                event_id, client_msg_id, conversation_id, sender_id,
                recipient_id, content, attachment_url, seq_no, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {MESSAGE_COLUMNS}
            "#
        );
        let message = sqlx::query_as::<_, Message>(&query)
            .bind(&event.event_id)
            .bind(&event.client_msg_id)
            .bind(&event.conversation_id)
            .bind(&event.sender_id)
            .bind(&event.recipient_id)
            .bind(&event.content)
            .bind(&event.attachment_url)
            .bind(seq_no)
            .bind(event.created_at)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn last_seq(&self, conversation_id: &str) -> IngestResult<i64> {
        Ok(SequenceAllocator::current(&self.pool, conversation_id).await?)
    }
}
