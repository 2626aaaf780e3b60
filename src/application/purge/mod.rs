//! CDN-purge consumer.
//!
//! Derives the CDN path variants implied by each queued URL, unions them
//! across the batch, and submits one invalidation per batch. Parse failures
//! are isolated per message; a failed submission fails the whole batch so
//! the queue retries it as a unit.

mod paths;

pub use paths::VariantRules;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, histogram};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::domain::message::RevalidationMessage;

use super::outcome::{BatchOutcome, Disposition};
use super::queue::ReceivedMessage;
use super::worker::BatchConsumer;

const METRIC_PURGE_BATCH_MS: &str = "refolo_purge_batch_ms";
const METRIC_PURGE_SUBMITTED: &str = "refolo_purge_submitted_total";
const METRIC_PURGE_PATHS: &str = "refolo_purge_paths_total";
const METRIC_PURGE_NOOP: &str = "refolo_purge_noop_total";

/// One purge submission to the CDN control plane.
///
/// The caller reference is unique per attempt: the control plane treats a
/// resubmission carrying the same reference as a no-op instead of duplicate
/// work, and two concurrent batches must never collide and get merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationBatch {
    pub caller_reference: String,
    pub paths: BTreeSet<String>,
}

impl InvalidationBatch {
    pub fn new(paths: BTreeSet<String>) -> Self {
        Self {
            caller_reference: next_caller_reference(),
            paths,
        }
    }
}

/// Lifecycle reported by the control plane; the consumer never waits for
/// `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone)]
pub struct InvalidationReceipt {
    pub id: String,
    pub status: InvalidationStatus,
}

#[derive(Debug, Error)]
pub enum CdnError {
    #[error("cdn control plane throttled the request")]
    Throttled,
    #[error("cdn control plane unavailable (status {status})")]
    Unavailable { status: u16 },
    #[error("cdn request failed: {0}")]
    Transport(String),
    #[error("cdn rejected the invalidation: {message}")]
    Rejected { message: String },
}

#[async_trait]
pub trait CdnClient: Send + Sync {
    async fn create_invalidation(
        &self,
        batch: &InvalidationBatch,
    ) -> Result<InvalidationReceipt, CdnError>;
}

/// Whether a failed purge submission fails the whole batch (conservative:
/// the batch call is not safely splittable after the fact) or the consumer
/// submits one smaller purge per message and fails only the losers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeFailurePolicy {
    WholeBatch,
    PerMessage,
}

pub struct CdnPurgeConsumer {
    cdn: Option<Arc<dyn CdnClient>>,
    rules: VariantRules,
    policy: PurgeFailurePolicy,
}

impl CdnPurgeConsumer {
    pub fn new(
        cdn: Option<Arc<dyn CdnClient>>,
        rules: VariantRules,
        policy: PurgeFailurePolicy,
    ) -> Self {
        if cdn.is_none() {
            warn!("No CDN distribution configured; purges degrade to no-ops");
        }
        Self { cdn, rules, policy }
    }

    fn parse_batch(
        &self,
        messages: &[ReceivedMessage],
        outcome: &mut BatchOutcome,
    ) -> Vec<(Uuid, RevalidationMessage)> {
        let mut parsed = Vec::with_capacity(messages.len());
        for message in messages {
            match RevalidationMessage::parse(&message.body) {
                Ok(request) => parsed.push((message.id, request)),
                Err(err) => {
                    warn!(
                        message_id = %message.id,
                        receive_count = message.receive_count,
                        error = %err,
                        "Skipping unparsable purge message"
                    );
                    outcome.record_failure(message.id, Disposition::Permanent);
                }
            }
        }
        parsed
    }

    async fn submit(&self, cdn: &Arc<dyn CdnClient>, paths: BTreeSet<String>) -> Result<(), CdnError> {
        let batch = InvalidationBatch::new(paths);
        let path_count = batch.paths.len();
        let receipt = cdn.create_invalidation(&batch).await?;

        counter!(METRIC_PURGE_SUBMITTED).increment(1);
        counter!(METRIC_PURGE_PATHS).increment(path_count as u64);
        info!(
            invalidation_id = %receipt.id,
            status = ?receipt.status,
            caller_reference = %batch.caller_reference,
            paths = path_count,
            "Submitted CDN invalidation"
        );
        Ok(())
    }
}

#[async_trait]
impl BatchConsumer for CdnPurgeConsumer {
    fn name(&self) -> &'static str {
        "cdn-purge"
    }

    #[instrument(skip(self, messages), fields(batch = messages.len()))]
    async fn process_batch(&self, messages: &[ReceivedMessage]) -> BatchOutcome {
        let started_at = std::time::Instant::now();
        let mut outcome = BatchOutcome::success();

        let parsed = self.parse_batch(messages, &mut outcome);

        let Some(cdn) = &self.cdn else {
            // Degraded mode: nothing to purge against. The parsed messages
            // are acknowledged so they do not loop; parse failures stand.
            counter!(METRIC_PURGE_NOOP).increment(1);
            histogram!(METRIC_PURGE_BATCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
            return outcome;
        };

        match self.policy {
            PurgeFailurePolicy::WholeBatch => {
                let paths = self
                    .rules
                    .batch_variants(parsed.iter().map(|(_, request)| request.url.as_str()));
                if paths.is_empty() {
                    counter!(METRIC_PURGE_NOOP).increment(1);
                } else if let Err(err) = self.submit(cdn, paths).await {
                    warn!(error = %err, "CDN invalidation failed; redelivering whole batch");
                    outcome = BatchOutcome::fail_all(messages, Disposition::Retryable);
                }
            }
            PurgeFailurePolicy::PerMessage => {
                for (id, request) in &parsed {
                    let paths = self.rules.variants(&request.url);
                    if let Err(err) = self.submit(cdn, paths).await {
                        warn!(
                            message_id = %id,
                            url = %request.url,
                            error = %err,
                            "Per-message CDN invalidation failed"
                        );
                        outcome.record_failure(*id, Disposition::Retryable);
                    }
                }
                if parsed.is_empty() {
                    counter!(METRIC_PURGE_NOOP).increment(1);
                }
            }
        }

        histogram!(METRIC_PURGE_BATCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        outcome
    }
}

/// A reference unique per attempt: wall-clock milliseconds plus a random
/// suffix, so retries are distinguishable and concurrent batches never merge.
fn next_caller_reference() -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    let suffix = Uuid::new_v4().simple().to_string();
    format!("revalidation-{millis}-{}", &suffix[..8])
}
