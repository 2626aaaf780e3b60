//! Durable revalidation queue on Postgres.
//!
//! One row per message per consumer group; leasing uses
//! `FOR UPDATE SKIP LOCKED` so concurrent workers in the same group never
//! double-receive inside a visibility window. Receipt handles are minted per
//! delivery, so a stale handle from a lapsed lease can no longer delete the
//! message.

use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::queue::{
    ConsumerGroup, QueueError, ReceiptHandle, ReceivedMessage, RevalidationQueue,
};
use crate::domain::message::RevalidationMessage;

use super::PostgresRepositories;

const METRIC_QUEUE_ENQUEUED: &str = "refolo_queue_enqueued_total";
const METRIC_QUEUE_DEAD_LETTERED: &str = "refolo_queue_dead_lettered_total";

#[derive(Debug, Clone)]
pub struct PostgresQueueConfig {
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
}

pub struct PostgresQueue {
    db: PostgresRepositories,
    config: PostgresQueueConfig,
}

impl PostgresQueue {
    pub fn new(db: PostgresRepositories, config: PostgresQueueConfig) -> Self {
        Self { db, config }
    }

    /// Move messages whose receive budget is spent into the dead-letter
    /// table. Runs ahead of each lease so poison messages cannot loop.
    async fn sweep_exhausted(&self, group: ConsumerGroup) -> Result<u64, QueueError> {
        let swept = sqlx::query(
            r#"
            WITH exhausted AS (
                DELETE FROM revalidation_queue
                 WHERE id IN (
                     SELECT id
                       FROM revalidation_queue
                      WHERE consumer_group = $1
                        AND visible_at <= now()
                        AND receive_count >= $2
                      FOR UPDATE SKIP LOCKED
                 )
                RETURNING id, consumer_group, body, enqueued_at, receive_count
            )
            INSERT INTO revalidation_dead_letters
                        (id, consumer_group, body, enqueued_at, receive_count)
            SELECT id, consumer_group, body, enqueued_at, receive_count
              FROM exhausted
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(group.as_str())
        .bind(self.config.max_receive_count as i32)
        .execute(self.db.pool())
        .await
        .map_err(QueueError::from_persistence)?
        .rows_affected();

        if swept > 0 {
            counter!(METRIC_QUEUE_DEAD_LETTERED, "group" => group.as_str()).increment(swept);
            warn!(
                group = group.as_str(),
                count = swept,
                "Messages exhausted their receive budget; dead-lettered"
            );
        }
        Ok(swept)
    }
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    body: String,
    receipt_handle: Uuid,
    receive_count: i32,
}

#[async_trait]
impl RevalidationQueue for PostgresQueue {
    async fn enqueue(&self, message: &RevalidationMessage) -> Result<(), QueueError> {
        let body = message
            .to_body()
            .map_err(|err| QueueError::Serialization(err.to_string()))?;

        // One row per consumer group in one statement: either every group
        // observes the message or the enqueue fails as a whole.
        let groups: Vec<String> = ConsumerGroup::ALL
            .iter()
            .map(|group| group.as_str().to_string())
            .collect();
        sqlx::query(
            r#"
            INSERT INTO revalidation_queue (consumer_group, body)
            SELECT unnest($1::text[]), $2
            "#,
        )
        .bind(&groups)
        .bind(&body)
        .execute(self.db.pool())
        .await
        .map_err(QueueError::from_persistence)?;

        counter!(METRIC_QUEUE_ENQUEUED).increment(ConsumerGroup::ALL.len() as u64);
        debug!(host = %message.host, url = %message.url, "Message enqueued");
        Ok(())
    }

    async fn receive_batch(
        &self,
        group: ConsumerGroup,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.sweep_exhausted(group).await?;

        let visible_until = OffsetDateTime::now_utc() + self.config.visibility_timeout;
        let rows = sqlx::query_as::<_, DeliveryRow>(
            r#"
            UPDATE revalidation_queue
               SET receive_count = receive_count + 1,
                   visible_at = $3,
                   receipt_handle = gen_random_uuid()
             WHERE id IN (
                 SELECT id
                   FROM revalidation_queue
                  WHERE consumer_group = $1
                    AND visible_at <= now()
                  ORDER BY enqueued_at
                  LIMIT $2
                  FOR UPDATE SKIP LOCKED
             )
            RETURNING id, body, receipt_handle, receive_count
            "#,
        )
        .bind(group.as_str())
        .bind(max as i64)
        .bind(visible_until)
        .fetch_all(self.db.pool())
        .await
        .map_err(QueueError::from_persistence)?;

        Ok(rows
            .into_iter()
            .map(|row| ReceivedMessage {
                id: row.id,
                body: row.body,
                receipt: row.receipt_handle,
                receive_count: row.receive_count.max(0) as u32,
            })
            .collect())
    }

    async fn acknowledge(&self, receipts: &[ReceiptHandle]) -> Result<(), QueueError> {
        if receipts.is_empty() {
            return Ok(());
        }
        sqlx::query(
            r#"
            DELETE FROM revalidation_queue
             WHERE receipt_handle = ANY($1)
            "#,
        )
        .bind(receipts)
        .execute(self.db.pool())
        .await
        .map_err(QueueError::from_persistence)?;

        Ok(())
    }
}
