use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, TransactionBehavior, params};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

use super::{JobQueue, MessageId, QueueMessage};
use crate::pool::{LibsqlManager, LibsqlPool};

/// How often an empty claim looks for new entries while blocking
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Job stream stored in the shared libsql database.
///
/// Group cursors and pending lists are updated inside IMMEDIATE transactions,
/// so two workers claiming at once never receive the same entry.
pub struct LibsqlQueue {
    pool: LibsqlPool,
    poll_interval: Duration,
}

impl LibsqlQueue {
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool, poll_interval: DEFAULT_POLL_INTERVAL }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        self.pool.get().await.map_err(|e| anyhow!("failed to get queue connection: {}", e))
    }

    /// Deliver the next undelivered entries of the group to `consumer`
    async fn deliver_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
    ) -> Result<Vec<QueueMessage>> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).await?;

        match deliver_new_in(&tx, stream, group, consumer, max_count).await {
            Ok(messages) => {
                tx.commit().await?;
                Ok(messages)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!("Failed to roll back claim on {}/{}: {}", stream, group, rollback);
                }
                Err(e)
            }
        }
    }
}

async fn deliver_new_in(
    conn: &Connection,
    stream: &str,
    group: &str,
    consumer: &str,
    max_count: usize,
) -> Result<Vec<QueueMessage>> {
    let mut rows = conn
        .query(
            "SELECT last_delivered_seq FROM queue_groups WHERE stream = ? AND group_name = ?",
            params![stream, group],
        )
        .await?;
    let last_delivered: i64 = match rows.next().await? {
        Some(row) => row.get(0)?,
        None => bail!("consumer group '{}' does not exist on stream '{}'", group, stream),
    };

    let mut rows = conn
        .query(
            "SELECT seq, payload FROM queue_entries WHERE stream = ? AND seq > ? ORDER BY seq LIMIT ?",
            params![stream, last_delivered, max_count as i64],
        )
        .await?;

    let mut messages = Vec::new();
    while let Some(row) = rows.next().await? {
        messages.push(QueueMessage {
            id: MessageId(row.get(0)?),
            payload: row.get(1)?,
            deliveries: 1,
        });
    }

    let Some(newest) = messages.last().map(|m| m.id) else {
        return Ok(messages);
    };

    let now = Utc::now().timestamp_millis();
    conn.execute(
        "UPDATE queue_groups SET last_delivered_seq = ? WHERE stream = ? AND group_name = ?",
        params![newest.0, stream, group],
    )
    .await?;

    for message in &messages {
        conn.execute(
            "INSERT INTO queue_pending (stream, group_name, seq, consumer, delivered_at) VALUES (?, ?, ?, ?, ?)",
            params![stream, group, message.id.0, consumer, now],
        )
        .await?;
    }

    Ok(messages)
}

async fn reclaim_idle_in(
    conn: &Connection,
    stream: &str,
    group: &str,
    consumer: &str,
    min_idle: Duration,
    max_count: usize,
) -> Result<Vec<QueueMessage>> {
    let now = Utc::now().timestamp_millis();
    let idle_before = now.saturating_sub(i64::try_from(min_idle.as_millis()).unwrap_or(i64::MAX));

    let mut rows = conn
        .query(
            "SELECT p.seq, e.payload, p.delivery_count FROM queue_pending p
             JOIN queue_entries e ON e.seq = p.seq
             WHERE p.stream = ? AND p.group_name = ? AND p.delivered_at <= ?
             ORDER BY p.seq LIMIT ?",
            params![stream, group, idle_before, max_count as i64],
        )
        .await?;

    let mut messages = Vec::new();
    while let Some(row) = rows.next().await? {
        let delivered: i64 = row.get(2)?;
        messages.push(QueueMessage {
            id: MessageId(row.get(0)?),
            payload: row.get(1)?,
            deliveries: u32::try_from(delivered.saturating_add(1)).unwrap_or(u32::MAX),
        });
    }

    for message in &messages {
        conn.execute(
            "UPDATE queue_pending SET consumer = ?, delivered_at = ?, delivery_count = delivery_count + 1
             WHERE stream = ? AND group_name = ? AND seq = ?",
            params![consumer, now, stream, group, message.id.0],
        )
        .await?;
    }

    Ok(messages)
}

#[async_trait]
impl JobQueue for LibsqlQueue {
    async fn append(&self, stream: &str, payload: &str) -> Result<MessageId> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO queue_entries (stream, payload, created_at) VALUES (?, ?, ?)",
            params![stream, payload, Utc::now().timestamp_millis()],
        )
        .await?;
        Ok(MessageId(conn.last_insert_rowid()))
    }

    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<bool> {
        let conn = self.get_conn().await?;
        // Start at the current tail; "already exists" is not an error
        let created = conn
            .execute(
                "INSERT OR IGNORE INTO queue_groups (stream, group_name, last_delivered_seq, created_at)
                 SELECT ?1, ?2, COALESCE(MAX(seq), 0), ?3 FROM queue_entries WHERE stream = ?1",
                params![stream, group, Utc::now().timestamp_millis()],
            )
            .await?;
        Ok(created > 0)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<QueueMessage>> {
        let deadline = Instant::now() + block;

        loop {
            let messages = self.deliver_new(stream, group, consumer, max_count).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(messages);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn reclaim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> Result<Vec<QueueMessage>> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate).await?;

        match reclaim_idle_in(&tx, stream, group, consumer, min_idle, max_count).await {
            Ok(messages) => {
                tx.commit().await?;
                Ok(messages)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!("Failed to roll back reclaim on {}/{}: {}", stream, group, rollback);
                }
                Err(e)
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: MessageId) -> Result<bool> {
        let conn = self.get_conn().await?;
        let removed = conn
            .execute(
                "DELETE FROM queue_pending WHERE stream = ? AND group_name = ? AND seq = ?",
                params![stream, group, id.0],
            )
            .await?;
        Ok(removed > 0)
    }

    async fn trim_acknowledged(&self, stream: &str) -> Result<u64> {
        let conn = self.get_conn().await?;
        let trimmed = conn
            .execute(
                "DELETE FROM queue_entries
                 WHERE stream = ?1
                   AND seq <= (SELECT COALESCE(MIN(last_delivered_seq), 0) FROM queue_groups WHERE stream = ?1)
                   AND seq NOT IN (SELECT seq FROM queue_pending WHERE stream = ?1)",
                params![stream],
            )
            .await?;
        Ok(trimmed)
    }
}
