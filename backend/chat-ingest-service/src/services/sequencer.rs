//! Per-conversation sequence allocation
//!
//! The counter row in `conversation_seq` is locked with `FOR UPDATE` for the
//! rest of the caller's transaction, so concurrent allocations for the same
//! conversation serialize on it and a rolled back insert also rolls back the
//! increment.

use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

pub struct SequenceAllocator;

impl SequenceAllocator {
    /// Allocate the next `seq_no` for `conversation_id` inside `tx`
    pub async fn allocate(
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: &str,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO conversation_seq (conversation_id, last_seq)
            VALUES ($1, 0)
            ON CONFLICT (conversation_id) DO NOTHING
            "#,
        )
        .bind(conversation_id)
        .execute(&mut **tx)
        .await?;

        let last_seq: i64 = sqlx::query_scalar(
            r#"
            SELECT last_seq
            FROM conversation_seq
            WHERE conversation_id = $1
            FOR UPDATE
            "#,
        )
        .bind(conversation_id)
        .fetch_one(&mut **tx)
        .await?;

        let next = last_seq + 1;

        sqlx::query(
            r#"
            UPDATE conversation_seq
            SET last_seq = $2, updated_at = NOW()
            WHERE conversation_id = $1
            "#,
        )
        .bind(conversation_id)
        .bind(next)
        .execute(&mut **tx)
        .await?;

        debug!(conversation_id = %conversation_id, seq_no = next, "Allocated sequence number");
        Ok(next)
    }

    /// Committed counter value, 0 for an unknown conversation
    pub async fn current(pool: &PgPool, conversation_id: &str) -> Result<i64, sqlx::Error> {
        let last_seq: Option<i64> =
            sqlx::query_scalar("SELECT last_seq FROM conversation_seq WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_optional(pool)
                .await?;

        Ok(last_seq.unwrap_or(0))
    }
}
