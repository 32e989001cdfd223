//! Durable job queue.
//!
//! An ordered, persistent log with consumer groups: every entry appended to a
//! stream is delivered to exactly one consumer of each group, stays pending
//! until acknowledged, and can be handed to another consumer if it is never
//! acknowledged. The queue knows nothing about monitoring; jobs travel as
//! JSON text and are typed by [`JobPayload`].

pub mod stream;

pub use stream::LibsqlQueue;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Queue-assigned id of an entry, increasing with append order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(MessageId)
    }
}

/// An entry handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: MessageId,
    pub payload: String,
    /// How many times the entry has been handed out, this delivery included
    pub deliveries: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a payload to the end of a stream
    async fn append(&self, stream: &str, payload: &str) -> Result<MessageId>;

    /// Create the group if missing. A new group only sees entries appended
    /// after its creation. Returns whether the group was created.
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<bool>;

    /// Take up to `max_count` entries never delivered to this group, waiting
    /// up to `block` for some to arrive. Claimed entries are pending for
    /// `consumer` until acknowledged.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<QueueMessage>>;

    /// Move pending entries idle for at least `min_idle` to `consumer`
    async fn reclaim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_count: usize,
    ) -> Result<Vec<QueueMessage>>;

    /// Remove an entry from the group's pending list. False if it was not pending.
    async fn ack(&self, stream: &str, group: &str, id: MessageId) -> Result<bool>;

    /// Delete entries every group has received and acknowledged
    async fn trim_acknowledged(&self, stream: &str) -> Result<u64>;
}

/// Job payloads that cannot be turned into a check
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("malformed job payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("job payload is missing {0}")]
    MissingField(&'static str),
    #[error("job url '{url}' is not a valid http(s) url: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// One check request for one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub endpoint_id: String,
    pub url: String,
}

impl JobPayload {
    pub fn new(endpoint_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self { endpoint_id: endpoint_id.into(), url: url.into() }
    }

    /// Decode and validate a payload received from the queue
    pub fn parse(raw: &str) -> Result<Self, JobError> {
        let payload: JobPayload = serde_json::from_str(raw)?;

        if payload.endpoint_id.trim().is_empty() {
            return Err(JobError::MissingField("endpointId"));
        }
        if payload.url.trim().is_empty() {
            return Err(JobError::MissingField("url"));
        }

        let parsed = url::Url::parse(&payload.url).map_err(|e| JobError::InvalidUrl {
            url: payload.url.clone(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(JobError::InvalidUrl {
                url: payload.url.clone(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }

        Ok(payload)
    }

    pub fn to_json(&self) -> Result<String, JobError> {
        Ok(serde_json::to_string(self)?)
    }
}
