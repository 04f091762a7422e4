//! Message storage
//!
//! `PgMessageStore` is the production backend. `InMemoryMessageStore` keeps
//! the same uniqueness rules in process memory for tests and local runs.

mod memory;
mod postgres;

pub use memory::InMemoryMessageStore;
pub use postgres::PgMessageStore;

use async_trait::async_trait;

use crate::error::IngestResult;
use crate::models::{Message, ValidatedEvent};

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn find_by_event_id(&self, event_id: &str) -> IngestResult<Option<Message>>;

    async fn find_by_client_msg_id(&self, client_msg_id: &str) -> IngestResult<Option<Message>>;

    /// Allocate the next sequence number for the event's conversation and
    /// insert the message, atomically.
    ///
    /// Fails with `IngestError::DatastoreConstraint` when a message with the
    /// same `event_id` or `client_msg_id` already exists; the counter is left
    /// untouched in that case.
    async fn insert_sequenced(&self, event: &ValidatedEvent) -> IngestResult<Message>;

    /// Last sequence number issued for a conversation, 0 if none
    async fn last_seq(&self, conversation_id: &str) -> IngestResult<i64>;
}
