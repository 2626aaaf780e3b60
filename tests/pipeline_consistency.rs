//! End-to-end pipeline behavior over the in-memory backends: one trigger
//! call must produce a refreshed cache-state row and exactly one CDN
//! invalidation covering every derived path variant, regardless of the
//! order and retry count of the two consumers.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use refolo::application::outcome::BatchOutcome;
use refolo::application::purge::{
    CdnClient, CdnError, CdnPurgeConsumer, InvalidationBatch, InvalidationReceipt,
    InvalidationStatus, PurgeFailurePolicy, VariantRules,
};
use refolo::application::queue::{ConsumerGroup, ReceivedMessage, RevalidationQueue};
use refolo::application::regen::{
    ArtifactRenderer, RegeneratedArtifact, RenderError, RegenerationConsumer,
};
use refolo::application::repos::CacheStateRepo;
use refolo::application::trigger::RevalidationTrigger;
use refolo::application::worker::BatchConsumer;
use refolo::domain::entry::FreshnessRules;
use refolo::infra::memory::{MemoryQueue, MemoryStateStore};

struct StaticRenderer;

#[async_trait]
impl ArtifactRenderer for StaticRenderer {
    async fn regenerate(
        &self,
        _host: &str,
        _path: &str,
    ) -> Result<RegeneratedArtifact, RenderError> {
        Ok(RegeneratedArtifact {
            status: 200,
            bytes: 2048,
        })
    }
}

struct FlakyCdn {
    failures_left: Mutex<u32>,
    batches: Mutex<Vec<InvalidationBatch>>,
}

impl FlakyCdn {
    fn new(failures: u32) -> Self {
        Self {
            failures_left: Mutex::new(failures),
            batches: Mutex::new(Vec::new()),
        }
    }

    fn submissions(&self) -> Vec<InvalidationBatch> {
        self.batches.lock().expect("batches lock").clone()
    }
}

#[async_trait]
impl CdnClient for FlakyCdn {
    async fn create_invalidation(
        &self,
        batch: &InvalidationBatch,
    ) -> Result<InvalidationReceipt, CdnError> {
        let mut failures = self.failures_left.lock().expect("failures lock");
        if *failures > 0 {
            *failures -= 1;
            return Err(CdnError::Unavailable { status: 503 });
        }
        self.batches.lock().expect("batches lock").push(batch.clone());
        Ok(InvalidationReceipt {
            id: "INV1".to_string(),
            status: InvalidationStatus::Pending,
        })
    }
}

struct Pipeline {
    state: Arc<MemoryStateStore>,
    queue: Arc<MemoryQueue>,
    trigger: RevalidationTrigger,
    regeneration: RegenerationConsumer,
    purge: CdnPurgeConsumer,
    cdn: Arc<FlakyCdn>,
}

fn pipeline(cdn_failures: u32) -> Pipeline {
    let state = Arc::new(MemoryStateStore::new());
    let queue = Arc::new(MemoryQueue::for_tests());
    let cdn = Arc::new(FlakyCdn::new(cdn_failures));
    let freshness = FreshnessRules::default();

    let trigger = RevalidationTrigger::new(state.clone(), queue.clone(), freshness.clone());
    let regeneration =
        RegenerationConsumer::new(state.clone(), Arc::new(StaticRenderer), freshness);
    let purge = CdnPurgeConsumer::new(
        Some(cdn.clone()),
        VariantRules::default(),
        PurgeFailurePolicy::WholeBatch,
    );

    Pipeline {
        state,
        queue,
        trigger,
        regeneration,
        purge,
        cdn,
    }
}

/// Lease one batch, run the consumer over it, acknowledge what succeeded.
async fn drain_once(
    queue: &Arc<MemoryQueue>,
    group: ConsumerGroup,
    consumer: &dyn BatchConsumer,
) -> (Vec<ReceivedMessage>, BatchOutcome) {
    let messages = queue.receive_batch(group, 5).await.expect("receive");
    let outcome = consumer.process_batch(&messages).await;
    let receipts = outcome.acknowledgable(&messages);
    queue.acknowledge(&receipts).await.expect("acknowledge");
    (messages, outcome)
}

#[tokio::test]
async fn trigger_to_both_consumers_end_to_end() {
    let pipeline = pipeline(0);

    let ticket = pipeline
        .trigger
        .revalidate_path("example.com", "/blog/post-1", None)
        .await
        .expect("trigger accepted");
    assert_eq!(ticket.tag, "blog");

    let (messages, outcome) = drain_once(
        &pipeline.queue,
        ConsumerGroup::Regeneration,
        &pipeline.regeneration,
    )
    .await;
    assert_eq!(messages.len(), 1);
    assert!(outcome.is_clean());

    let (messages, outcome) =
        drain_once(&pipeline.queue, ConsumerGroup::CdnPurge, &pipeline.purge).await;
    assert_eq!(messages.len(), 1);
    assert!(outcome.is_clean());

    // Cache state: one row per (path, tag), with a positive freshness window.
    let entries = pipeline
        .state
        .query_by_tag("blog")
        .await
        .expect("query by tag");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, "/blog/post-1");
    assert!(entries[0].expire_at > entries[0].revalidated_at);

    let by_path = pipeline
        .state
        .query_by_path("/blog/post-1")
        .await
        .expect("query by path");
    assert_eq!(by_path.len(), 1);

    // CDN: exactly one invalidation with all three variants.
    let submissions = pipeline.cdn.submissions();
    assert_eq!(submissions.len(), 1);
    let paths: Vec<&str> = submissions[0].paths.iter().map(String::as_str).collect();
    assert_eq!(
        paths,
        vec!["/_data/*/blog/post-1.json", "/blog/post-1", "/blog/post-1.frag"]
    );

    // Nothing left behind on either subscription.
    for group in ConsumerGroup::ALL {
        assert_eq!(pipeline.queue.len(group), 0);
    }
}

#[tokio::test]
async fn purge_failure_redelivers_and_eventually_succeeds() {
    let pipeline = pipeline(1);

    pipeline
        .trigger
        .revalidate_path("example.com", "/docs/setup", None)
        .await
        .expect("trigger accepted");

    // First purge attempt fails; the whole batch stays on the queue.
    let (messages, outcome) =
        drain_once(&pipeline.queue, ConsumerGroup::CdnPurge, &pipeline.purge).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(pipeline.queue.len(ConsumerGroup::CdnPurge), 1);

    // Redelivery succeeds with a fresh caller reference.
    let (messages, outcome) =
        drain_once(&pipeline.queue, ConsumerGroup::CdnPurge, &pipeline.purge).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].receive_count, 2);
    assert!(outcome.is_clean());
    assert_eq!(pipeline.queue.len(ConsumerGroup::CdnPurge), 0);
    assert_eq!(pipeline.cdn.submissions().len(), 1);
}

#[tokio::test]
async fn redelivered_regeneration_is_idempotent() {
    let pipeline = pipeline(0);

    pipeline
        .trigger
        .revalidate_path("example.com", "/blog/post-1", None)
        .await
        .expect("trigger accepted");

    // Process the same delivery twice without acknowledging the first:
    // zero visibility makes the message redeliver immediately.
    let messages = pipeline
        .queue
        .receive_batch(ConsumerGroup::Regeneration, 5)
        .await
        .expect("receive");
    pipeline.regeneration.process_batch(&messages).await;

    let (redelivered, outcome) = drain_once(
        &pipeline.queue,
        ConsumerGroup::Regeneration,
        &pipeline.regeneration,
    )
    .await;
    assert_eq!(redelivered.len(), 1);
    assert!(outcome.is_clean());

    // Upserts are keyed on (path, tag): still exactly one row.
    let entries = pipeline
        .state
        .query_by_tag("blog")
        .await
        .expect("query by tag");
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn tag_revalidation_purges_every_known_path() {
    let pipeline = pipeline(0);

    for path in ["/blog/post-1", "/blog/post-2"] {
        pipeline
            .trigger
            .revalidate_path("example.com", path, Some("blog"))
            .await
            .expect("trigger accepted");
    }
    // Settle the initial per-path messages.
    loop {
        let (messages, _) = drain_once(
            &pipeline.queue,
            ConsumerGroup::Regeneration,
            &pipeline.regeneration,
        )
        .await;
        if messages.is_empty() {
            break;
        }
    }
    loop {
        let (messages, _) =
            drain_once(&pipeline.queue, ConsumerGroup::CdnPurge, &pipeline.purge).await;
        if messages.is_empty() {
            break;
        }
    }
    let baseline_submissions = pipeline.cdn.submissions().len();

    let ticket = pipeline
        .trigger
        .revalidate_tag("example.com", "blog")
        .await
        .expect("tag trigger accepted");
    assert_eq!(ticket.enqueued, 2);

    let (messages, outcome) =
        drain_once(&pipeline.queue, ConsumerGroup::CdnPurge, &pipeline.purge).await;
    assert_eq!(messages.len(), 2);
    assert!(outcome.is_clean());

    let submissions = pipeline.cdn.submissions();
    assert_eq!(submissions.len(), baseline_submissions + 1);
    let batch = submissions.last().expect("latest batch");
    assert!(batch.paths.contains("/blog/post-1"));
    assert!(batch.paths.contains("/blog/post-2"));
    assert!(batch.paths.contains("/_data/*/blog/post-2.json"));
    assert_eq!(batch.paths.len(), 6);
}
