//! In-memory store and queue.
//!
//! First-class implementations of the persistence seams with the same
//! contracts as the Postgres adapters: idempotent upserts, passive expiry,
//! visibility-window leasing, receive budgets and dead-lettering. They back
//! the test suite and embedded single-process use.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::application::queue::{
    ConsumerGroup, QueueError, ReceiptHandle, ReceivedMessage, RevalidationQueue,
};
use crate::application::repos::{CacheStateRepo, RepoError};
use crate::domain::entry::CacheEntry;
use crate::domain::message::RevalidationMessage;
use crate::util::lock::mutex_lock;

const SOURCE: &str = "infra::memory";
const METRIC_QUEUE_ENQUEUED: &str = "refolo_queue_enqueued_total";
const METRIC_QUEUE_DEAD_LETTERED: &str = "refolo_queue_dead_lettered_total";

// ============================================================================
// Cache-state store
// ============================================================================

pub struct MemoryStateStore {
    rows: Mutex<HashMap<(String, String), CacheEntry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.rows, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStateRepo for MemoryStateStore {
    async fn upsert(&self, entry: CacheEntry) -> Result<(), RepoError> {
        let key = (entry.tag.clone(), entry.path.clone());
        mutex_lock(&self.rows, SOURCE, "upsert").insert(key, entry);
        Ok(())
    }

    async fn query_by_tag(&self, tag: &str) -> Result<Vec<CacheEntry>, RepoError> {
        let now = OffsetDateTime::now_utc();
        Ok(mutex_lock(&self.rows, SOURCE, "query_by_tag")
            .values()
            .filter(|entry| entry.tag == tag && !entry.is_expired(now))
            .cloned()
            .collect())
    }

    async fn query_by_path(&self, path: &str) -> Result<Vec<CacheEntry>, RepoError> {
        let now = OffsetDateTime::now_utc();
        let mut entries: Vec<CacheEntry> = mutex_lock(&self.rows, SOURCE, "query_by_path")
            .values()
            .filter(|entry| entry.path == path && !entry.is_expired(now))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.revalidated_at.cmp(&a.revalidated_at));
        Ok(entries)
    }
}

// ============================================================================
// Queue
// ============================================================================

#[derive(Debug, Clone)]
struct StoredMessage {
    id: Uuid,
    body: String,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<Uuid>,
}

/// A dead-lettered message kept for inspection.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub id: Uuid,
    pub group: ConsumerGroup,
    pub body: String,
    pub receive_count: u32,
}

pub struct MemoryQueue {
    visibility: Duration,
    max_receive_count: u32,
    channels: Mutex<HashMap<ConsumerGroup, VecDeque<StoredMessage>>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryQueue {
    pub fn new(visibility: Duration, max_receive_count: u32) -> Self {
        let mut channels = HashMap::new();
        for group in ConsumerGroup::ALL {
            channels.insert(group, VecDeque::new());
        }
        Self {
            visibility,
            max_receive_count,
            channels: Mutex::new(channels),
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    /// A queue whose messages redeliver immediately when unacknowledged,
    /// which keeps tests free of sleeps.
    pub fn for_tests() -> Self {
        Self::new(Duration::ZERO, 5)
    }

    /// Push a raw body, bypassing serialization. Lets tests exercise the
    /// malformed-message paths that `enqueue` cannot produce.
    pub fn push_raw(&self, body: impl Into<String>) -> Uuid {
        let id = Uuid::new_v4();
        let body = body.into();
        let mut channels = mutex_lock(&self.channels, SOURCE, "push_raw");
        for group in ConsumerGroup::ALL {
            if let Some(channel) = channels.get_mut(&group) {
                channel.push_back(StoredMessage {
                    id,
                    body: body.clone(),
                    visible_at: Instant::now(),
                    receive_count: 0,
                    receipt: None,
                });
            }
        }
        id
    }

    pub fn len(&self, group: ConsumerGroup) -> usize {
        mutex_lock(&self.channels, SOURCE, "len")
            .get(&group)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        mutex_lock(&self.dead_letters, SOURCE, "dead_letters").clone()
    }
}

#[async_trait]
impl RevalidationQueue for MemoryQueue {
    async fn enqueue(&self, message: &RevalidationMessage) -> Result<(), QueueError> {
        let body = message
            .to_body()
            .map_err(|err| QueueError::Serialization(err.to_string()))?;
        self.push_raw(body);
        counter!(METRIC_QUEUE_ENQUEUED).increment(ConsumerGroup::ALL.len() as u64);
        debug!(host = %message.host, url = %message.url, "Message enqueued");
        Ok(())
    }

    async fn receive_batch(
        &self,
        group: ConsumerGroup,
        max: usize,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let now = Instant::now();
        let mut channels = mutex_lock(&self.channels, SOURCE, "receive_batch");
        let Some(channel) = channels.get_mut(&group) else {
            return Ok(Vec::new());
        };

        // Exhausted messages move aside before leasing.
        let mut kept = VecDeque::with_capacity(channel.len());
        let mut dead = Vec::new();
        while let Some(message) = channel.pop_front() {
            if message.visible_at <= now && message.receive_count >= self.max_receive_count {
                dead.push(message);
            } else {
                kept.push_back(message);
            }
        }
        *channel = kept;

        let mut received = Vec::new();
        for message in channel.iter_mut() {
            if received.len() >= max {
                break;
            }
            if message.visible_at > now {
                continue;
            }
            message.receive_count += 1;
            message.visible_at = now + self.visibility;
            let receipt = Uuid::new_v4();
            message.receipt = Some(receipt);
            received.push(ReceivedMessage {
                id: message.id,
                body: message.body.clone(),
                receipt,
                receive_count: message.receive_count,
            });
        }
        drop(channels);

        if !dead.is_empty() {
            counter!(METRIC_QUEUE_DEAD_LETTERED, "group" => group.as_str())
                .increment(dead.len() as u64);
            let mut dead_letters = mutex_lock(&self.dead_letters, SOURCE, "receive_batch.dead");
            for message in dead {
                warn!(
                    message_id = %message.id,
                    group = group.as_str(),
                    receive_count = message.receive_count,
                    "Message exhausted its receive budget; dead-lettered"
                );
                dead_letters.push(DeadLetter {
                    id: message.id,
                    group,
                    body: message.body,
                    receive_count: message.receive_count,
                });
            }
        }

        Ok(received)
    }

    async fn acknowledge(&self, receipts: &[ReceiptHandle]) -> Result<(), QueueError> {
        if receipts.is_empty() {
            return Ok(());
        }
        let mut channels = mutex_lock(&self.channels, SOURCE, "acknowledge");
        for channel in channels.values_mut() {
            channel.retain(|message| {
                message
                    .receipt
                    .map(|receipt| !receipts.contains(&receipt))
                    .unwrap_or(true)
            });
        }
        Ok(())
    }
}
