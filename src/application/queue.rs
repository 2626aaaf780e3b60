//! The revalidation queue contract.
//!
//! Durable hand-off with at-least-once delivery: messages fan out to every
//! consumer group, receives lease a message for a visibility window, and
//! only an acknowledgment with the delivery's receipt handle removes it.
//! Non-acknowledged messages redeliver once the window lapses; messages that
//! exhaust their receive budget are dead-lettered instead of looping forever.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::message::RevalidationMessage;

/// Receipt handle minted per delivery; valid for exactly that delivery.
pub type ReceiptHandle = Uuid;

/// The two independent subscriptions over the logical message stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerGroup {
    Regeneration,
    CdnPurge,
}

impl ConsumerGroup {
    pub const ALL: [ConsumerGroup; 2] = [ConsumerGroup::Regeneration, ConsumerGroup::CdnPurge];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerGroup::Regeneration => "regenerate",
            ConsumerGroup::CdnPurge => "purge-cdn",
        }
    }
}

/// One leased delivery of a queue message.
///
/// `id` is the stable item identifier used when reporting failures; `body`
/// stays raw so malformed payloads are representable and isolatable.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: Uuid,
    pub body: String,
    pub receipt: ReceiptHandle,
    pub receive_count: u32,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue persistence error: {0}")]
    Persistence(String),
    #[error("message body could not be serialized: {0}")]
    Serialization(String),
    #[error("queue timeout")]
    Timeout,
}

impl QueueError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[async_trait]
pub trait RevalidationQueue: Send + Sync {
    /// Enqueue one message for every consumer group. Failure is surfaced to
    /// the caller as a distinct error, never silently dropped.
    async fn enqueue(&self, message: &RevalidationMessage) -> Result<(), QueueError>;

    /// Lease up to `max` visible messages for `group`. Received messages
    /// become invisible for the queue's visibility window.
    async fn receive_batch(
        &self,
        group: ConsumerGroup,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Remove the deliveries behind the given receipt handles. Unknown or
    /// stale handles are ignored: acknowledging twice is safe.
    async fn acknowledge(&self, receipts: &[ReceiptHandle]) -> Result<(), QueueError>;
}
