use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Persisted chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub event_id: String,
    pub client_msg_id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub content: String,
    pub attachment_url: Option<String>,
    pub seq_no: i64,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Result of persisting one event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    #[serde(flatten)]
    pub message: Message,
    /// The event had already been stored; nothing was written
    pub duplicate: bool,
}

impl PersistOutcome {
    pub fn created(message: Message) -> Self {
        Self {
            message,
            duplicate: false,
        }
    }

    pub fn duplicate(message: Message) -> Self {
        Self {
            message,
            duplicate: true,
        }
    }
}
