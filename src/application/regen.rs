//! Regeneration consumer.
//!
//! Turns a queued `(host, url)` into a freshly rendered artifact and a
//! refreshed cache-state row. A message is acknowledged only after the
//! upsert succeeds; everything else redelivers.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::{counter, histogram};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};

use crate::domain::entry::{CacheEntry, FreshnessRules, derive_tag};
use crate::domain::message::RevalidationMessage;

use super::outcome::{BatchOutcome, Disposition};
use super::queue::ReceivedMessage;
use super::repos::CacheStateRepo;
use super::worker::BatchConsumer;

const METRIC_REGEN_BATCH_MS: &str = "refolo_regen_batch_ms";
const METRIC_REGEN_SUCCESS: &str = "refolo_regen_success_total";
const METRIC_REGEN_FAILURE: &str = "refolo_regen_failure_total";

/// Result of one origin regeneration call.
#[derive(Debug, Clone)]
pub struct RegeneratedArtifact {
    pub status: u16,
    pub bytes: u64,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("origin returned server error {status}")]
    OriginUnavailable { status: u16 },
    #[error("origin request failed: {0}")]
    Transport(String),
    #[error("origin rejected the request: {reason}")]
    Rejected { reason: String },
}

impl RenderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::OriginUnavailable { .. } | Self::Transport(_))
    }

    pub fn disposition(&self) -> Disposition {
        if self.is_retryable() {
            Disposition::Retryable
        } else {
            Disposition::Permanent
        }
    }
}

/// Regenerates the artifact addressed by a logical path on a given host.
#[async_trait]
pub trait ArtifactRenderer: Send + Sync {
    async fn regenerate(&self, host: &str, path: &str)
    -> Result<RegeneratedArtifact, RenderError>;
}

pub struct RegenerationConsumer {
    state: Arc<dyn CacheStateRepo>,
    renderer: Arc<dyn ArtifactRenderer>,
    freshness: FreshnessRules,
}

impl RegenerationConsumer {
    pub fn new(
        state: Arc<dyn CacheStateRepo>,
        renderer: Arc<dyn ArtifactRenderer>,
        freshness: FreshnessRules,
    ) -> Self {
        Self {
            state,
            renderer,
            freshness,
        }
    }

    async fn process_message(&self, message: &ReceivedMessage) -> Result<(), Disposition> {
        let request = match RevalidationMessage::parse(&message.body) {
            Ok(request) => request,
            Err(err) => {
                warn!(
                    message_id = %message.id,
                    receive_count = message.receive_count,
                    error = %err,
                    "Dropping unparsable regeneration message"
                );
                return Err(Disposition::Permanent);
            }
        };

        let artifact = self
            .renderer
            .regenerate(&request.host, &request.url)
            .await
            .map_err(|err| {
                warn!(
                    message_id = %message.id,
                    host = %request.host,
                    url = %request.url,
                    retryable = err.is_retryable(),
                    error = %err,
                    "Regeneration failed"
                );
                err.disposition()
            })?;

        let (revalidated_at, expire_at) = self
            .freshness
            .window_from(&request.url, OffsetDateTime::now_utc());
        let entry = CacheEntry::new(
            request.url.clone(),
            derive_tag(&request.url),
            revalidated_at,
            expire_at,
        )
        .map_err(|_| Disposition::Permanent)?;

        // The ack happens only after this write lands; a crash in between
        // causes a redelivery and a second, idempotent upsert.
        self.state.upsert(entry).await.map_err(|err| {
            warn!(
                message_id = %message.id,
                url = %request.url,
                error = %err,
                "Cache-state upsert failed after regeneration"
            );
            if err.is_retryable() {
                Disposition::Retryable
            } else {
                Disposition::Permanent
            }
        })?;

        info!(
            message_id = %message.id,
            host = %request.host,
            url = %request.url,
            status = artifact.status,
            bytes = artifact.bytes,
            "Regenerated artifact and refreshed cache state"
        );
        Ok(())
    }
}

#[async_trait]
impl BatchConsumer for RegenerationConsumer {
    fn name(&self) -> &'static str {
        "regeneration"
    }

    #[instrument(skip(self, messages), fields(batch = messages.len()))]
    async fn process_batch(&self, messages: &[ReceivedMessage]) -> BatchOutcome {
        let started_at = std::time::Instant::now();
        let mut outcome = BatchOutcome::success();

        for message in messages {
            match self.process_message(message).await {
                Ok(()) => counter!(METRIC_REGEN_SUCCESS).increment(1),
                Err(disposition) => {
                    counter!(METRIC_REGEN_FAILURE).increment(1);
                    outcome.record_failure(message.id, disposition);
                }
            }
        }

        histogram!(METRIC_REGEN_BATCH_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        outcome
    }
}
