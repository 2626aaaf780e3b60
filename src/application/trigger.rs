//! Revalidation trigger.
//!
//! The synchronous entry point of the pipeline: records the request in the
//! tag-indexed cache-state store and enqueues it for both consumers. The
//! caller sees success or failure for these two steps only; everything
//! downstream is asynchronous and observable only as eventual freshness.

use std::collections::BTreeSet;
use std::sync::Arc;

use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, instrument};

use crate::domain::entry::{CacheEntry, FreshnessRules, derive_tag, validate_tag};
use crate::domain::error::DomainError;
use crate::domain::message::RevalidationMessage;

use super::queue::{QueueError, RevalidationQueue};
use super::repos::{CacheStateRepo, RepoError};

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("cache-state write failed: {0}")]
    State(#[from] RepoError),
    /// The store write already happened and is not rolled back; the caller
    /// learns that the asynchronous leg was not scheduled.
    #[error("revalidation enqueue failed: {0}")]
    Enqueue(#[from] QueueError),
}

/// What a trigger call accepted and scheduled.
#[derive(Debug, Clone)]
pub struct RevalidationTicket {
    pub tag: String,
    pub paths: Vec<String>,
    pub enqueued: usize,
    pub requested_at: OffsetDateTime,
}

pub struct RevalidationTrigger {
    state: Arc<dyn CacheStateRepo>,
    queue: Arc<dyn RevalidationQueue>,
    freshness: FreshnessRules,
}

impl RevalidationTrigger {
    pub fn new(
        state: Arc<dyn CacheStateRepo>,
        queue: Arc<dyn RevalidationQueue>,
        freshness: FreshnessRules,
    ) -> Self {
        Self {
            state,
            queue,
            freshness,
        }
    }

    /// Revalidate a single path. The tag defaults to the path's leading
    /// segment when not supplied.
    #[instrument(skip(self))]
    pub async fn revalidate_path(
        &self,
        host: &str,
        path: &str,
        tag: Option<&str>,
    ) -> Result<RevalidationTicket, TriggerError> {
        let message = RevalidationMessage::new(host, path)?;
        let tag = match tag {
            Some(tag) => {
                validate_tag(tag)?;
                tag.to_string()
            }
            None => derive_tag(path),
        };

        let now = OffsetDateTime::now_utc();
        let (revalidated_at, expire_at) = self.freshness.window_from(path, now);
        self.state
            .upsert(CacheEntry::new(path, tag.clone(), revalidated_at, expire_at)?)
            .await?;

        self.queue.enqueue(&message).await?;
        info!(host, path, tag = %tag, "Revalidation accepted");

        Ok(RevalidationTicket {
            tag,
            paths: vec![path.to_string()],
            enqueued: 1,
            requested_at: now,
        })
    }

    /// Revalidate every non-expired path sharing a tag.
    ///
    /// Paths come from the by-tag index, so a path is covered as soon as a
    /// regeneration has recorded it at least once. Each path gets its own
    /// queue message; a failed enqueue surfaces after the earlier ones have
    /// already been accepted, which at-least-once delivery tolerates.
    #[instrument(skip(self))]
    pub async fn revalidate_tag(
        &self,
        host: &str,
        tag: &str,
    ) -> Result<RevalidationTicket, TriggerError> {
        validate_tag(tag)?;
        if host.is_empty() {
            return Err(DomainError::validation("host must not be empty").into());
        }

        let entries = self.state.query_by_tag(tag).await?;
        let paths: BTreeSet<String> = entries.into_iter().map(|entry| entry.path).collect();

        let now = OffsetDateTime::now_utc();
        let mut enqueued = 0;
        for path in &paths {
            let (revalidated_at, expire_at) = self.freshness.window_from(path, now);
            self.state
                .upsert(CacheEntry::new(
                    path.clone(),
                    tag.to_string(),
                    revalidated_at,
                    expire_at,
                )?)
                .await?;
            let message = RevalidationMessage::new(host, path.clone())?;
            self.queue.enqueue(&message).await?;
            enqueued += 1;
        }

        info!(host, tag, paths = paths.len(), "Tag revalidation accepted");
        Ok(RevalidationTicket {
            tag: tag.to_string(),
            paths: paths.into_iter().collect(),
            enqueued,
            requested_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::application::queue::{ConsumerGroup, ReceiptHandle, ReceivedMessage};
    use crate::infra::memory::{MemoryQueue, MemoryStateStore};

    use super::*;

    struct FailingQueue;

    #[async_trait]
    impl RevalidationQueue for FailingQueue {
        async fn enqueue(&self, _message: &RevalidationMessage) -> Result<(), QueueError> {
            Err(QueueError::from_persistence("queue offline"))
        }

        async fn receive_batch(
            &self,
            _group: ConsumerGroup,
            _max: usize,
        ) -> Result<Vec<ReceivedMessage>, QueueError> {
            Ok(Vec::new())
        }

        async fn acknowledge(&self, _receipts: &[ReceiptHandle]) -> Result<(), QueueError> {
            Ok(())
        }
    }

    fn trigger_with(
        state: Arc<MemoryStateStore>,
        queue: Arc<dyn RevalidationQueue>,
    ) -> RevalidationTrigger {
        RevalidationTrigger::new(state, queue, FreshnessRules::default())
    }

    #[tokio::test]
    async fn path_trigger_records_state_and_enqueues_for_both_groups() {
        let state = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryQueue::for_tests());
        let trigger = trigger_with(state.clone(), queue.clone());

        let ticket = trigger
            .revalidate_path("example.com", "/blog/post-1", None)
            .await
            .expect("accepted");

        assert_eq!(ticket.tag, "blog");
        assert_eq!(ticket.enqueued, 1);

        let entries = state.query_by_tag("blog").await.expect("query");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/blog/post-1");

        for group in ConsumerGroup::ALL {
            let batch = queue.receive_batch(group, 10).await.expect("receive");
            assert_eq!(batch.len(), 1, "group {group:?} should observe the message");
        }
    }

    #[tokio::test]
    async fn explicit_tag_overrides_derivation() {
        let state = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryQueue::for_tests());
        let trigger = trigger_with(state.clone(), queue);

        trigger
            .revalidate_path("example.com", "/landing", Some("campaign"))
            .await
            .expect("accepted");

        assert_eq!(state.query_by_tag("campaign").await.expect("query").len(), 1);
        assert!(state.query_by_tag("landing").await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn enqueue_failure_is_distinct_and_does_not_roll_back() {
        let state = Arc::new(MemoryStateStore::new());
        let trigger = trigger_with(state.clone(), Arc::new(FailingQueue));

        let err = trigger
            .revalidate_path("example.com", "/blog/post-1", None)
            .await
            .expect_err("enqueue must fail");
        assert!(matches!(err, TriggerError::Enqueue(_)));

        // The store write stands even though the async leg was not scheduled.
        assert_eq!(state.query_by_tag("blog").await.expect("query").len(), 1);
    }

    #[tokio::test]
    async fn tag_trigger_fans_out_across_known_paths() {
        let state = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryQueue::for_tests());
        let trigger = trigger_with(state.clone(), queue.clone());

        trigger
            .revalidate_path("example.com", "/blog/post-1", Some("blog"))
            .await
            .expect("accepted");
        trigger
            .revalidate_path("example.com", "/blog/post-2", Some("blog"))
            .await
            .expect("accepted");
        // Drain what the per-path triggers enqueued.
        for group in ConsumerGroup::ALL {
            let batch = queue.receive_batch(group, 10).await.expect("receive");
            let receipts: Vec<_> = batch.iter().map(|m| m.receipt).collect();
            queue.acknowledge(&receipts).await.expect("ack");
        }

        let ticket = trigger
            .revalidate_tag("example.com", "blog")
            .await
            .expect("accepted");
        assert_eq!(ticket.enqueued, 2);
        assert_eq!(ticket.paths.len(), 2);

        let batch = queue
            .receive_batch(ConsumerGroup::CdnPurge, 10)
            .await
            .expect("receive");
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn rejects_malformed_input_at_the_boundary() {
        let state = Arc::new(MemoryStateStore::new());
        let queue = Arc::new(MemoryQueue::for_tests());
        let trigger = trigger_with(state, queue);

        assert!(matches!(
            trigger.revalidate_path("example.com", "no-slash", None).await,
            Err(TriggerError::Domain(_))
        ));
        assert!(matches!(
            trigger.revalidate_tag("example.com", "").await,
            Err(TriggerError::Domain(_))
        ));
        assert!(matches!(
            trigger.revalidate_path("", "/x", None).await,
            Err(TriggerError::Domain(_))
        ));
    }
}
