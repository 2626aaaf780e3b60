//! Queue worker loop shared by both consumers.
//!
//! Each worker owns one consumer group: it leases a batch, runs the consumer
//! under the batch deadline, acknowledges whatever was not reported failed,
//! and lets the visibility window redeliver the rest. A deadline overrun
//! acknowledges nothing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use super::outcome::BatchOutcome;
use super::queue::{ConsumerGroup, ReceivedMessage, RevalidationQueue};

const METRIC_QUEUE_RECEIVED: &str = "refolo_queue_received_total";
const METRIC_QUEUE_ACKNOWLEDGED: &str = "refolo_queue_acknowledged_total";
const METRIC_BATCH_FAILED_ITEMS: &str = "refolo_batch_failed_items_total";
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// A consumer's whole contract with the worker loop: turn a leased batch
/// into an outcome. Consumers never touch receipt handles themselves.
#[async_trait]
pub trait BatchConsumer: Send + Sync {
    fn name(&self) -> &'static str;
    async fn process_batch(&self, messages: &[ReceivedMessage]) -> BatchOutcome;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub batch_deadline: Duration,
}

/// Drive one consumer group forever. Runs inside a task the binary aborts
/// on shutdown; an in-flight batch that dies unacknowledged simply
/// redelivers later.
pub async fn run_worker(
    queue: Arc<dyn RevalidationQueue>,
    group: ConsumerGroup,
    consumer: Arc<dyn BatchConsumer>,
    config: WorkerConfig,
) {
    info!(
        consumer = consumer.name(),
        group = group.as_str(),
        batch_size = config.batch_size,
        "Worker started"
    );

    loop {
        let messages = match queue.receive_batch(group, config.batch_size).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(
                    consumer = consumer.name(),
                    group = group.as_str(),
                    error = %err,
                    "Queue receive failed; backing off"
                );
                sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        if messages.is_empty() {
            sleep(config.poll_interval).await;
            continue;
        }

        counter!(METRIC_QUEUE_RECEIVED, "group" => group.as_str())
            .increment(messages.len() as u64);

        let outcome = match timeout(config.batch_deadline, consumer.process_batch(&messages)).await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    consumer = consumer.name(),
                    group = group.as_str(),
                    batch = messages.len(),
                    deadline_secs = config.batch_deadline.as_secs(),
                    "Batch deadline exceeded; abandoning for redelivery"
                );
                continue;
            }
        };

        if !outcome.is_clean() {
            counter!(METRIC_BATCH_FAILED_ITEMS, "group" => group.as_str())
                .increment(outcome.failed.len() as u64);
        }

        let receipts = outcome.acknowledgable(&messages);
        if receipts.is_empty() {
            continue;
        }
        match queue.acknowledge(&receipts).await {
            Ok(()) => {
                counter!(METRIC_QUEUE_ACKNOWLEDGED, "group" => group.as_str())
                    .increment(receipts.len() as u64);
                debug!(
                    consumer = consumer.name(),
                    group = group.as_str(),
                    acknowledged = receipts.len(),
                    failed = outcome.failed.len(),
                    "Batch complete"
                );
            }
            Err(err) => {
                // The work itself is durable and idempotent; the messages
                // will redeliver and the consumers will no-op through them.
                warn!(
                    consumer = consumer.name(),
                    group = group.as_str(),
                    error = %err,
                    "Acknowledge failed; processed messages will redeliver"
                );
            }
        }
    }
}
