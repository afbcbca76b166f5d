//! Integration tests for notification routing and delivery.
//!
//! Tests cover:
//! - Key-to-template resolution
//! - Deduplication and unbound target groups
//! - Transactional enqueueing (commit, rollback, failed state commit)
//! - Worker ordering within a batch
//! - Retries and dead-lettering

use async_trait::async_trait;
use keystone_core::notify::{BackoffStrategy, DeliveryJob};
use keystone_core::prelude::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Fixtures
// ============================================================================

fn router() -> NotificationRouter {
    let catalog = Arc::new(
        SchemaCatalog::from_schemas([ResourceSchema::new("widget")
            .attribute(AttributeDef::new("title", AttributeType::String))])
        .unwrap(),
    );
    let table = BindingTable::builder()
        .validate_resources(catalog)
        .bind("widget.created", "owner")
        .bind("widget.created", "watcher")
        .bind_template("widget.archived", "owner", "archive/{resource}/{group}")
        .route("widget.created", ["owner", "watcher"])
        .build()
        .unwrap();
    NotificationRouter::new(Arc::new(table))
}

fn created() -> NotificationKey {
    NotificationKey::parse("widget.created").unwrap()
}

fn widget(id: &str) -> Record {
    Record::new("widget", id).with("title", "Sprocket")
}

fn owner_and_watchers(_: &Record, _: &NotificationKey) -> Vec<Target> {
    vec![
        Target::new("alice", "owner"),
        Target::new("bob", "watcher"),
        Target::new("carol", "watcher"),
        Target::new("bob", "watcher"),
    ]
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn fast_worker() -> WorkerConfig {
    WorkerConfig {
        lanes: 2,
        poll_interval: Duration::from_millis(5),
        shutdown_timeout: Duration::from_secs(5),
        ..WorkerConfig::default()
    }
}

// ============================================================================
// Routing
// ============================================================================

#[test]
fn test_created_key_resolves_default_template() {
    let router = router();
    let deliveries = router.resolve_deliveries(
        &created(),
        |_, _| vec![Target::new("alice", "owner")],
        &widget("w1"),
    );

    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].template, "owners/widget/created");
    assert_eq!(deliveries[0].target.recipient.as_str(), "alice");
    assert_eq!(deliveries[0].record.id, "w1");
}

#[test]
fn test_custom_template_and_dedupe() {
    let router = router();
    let archived = NotificationKey::parse("widget.archived").unwrap();
    let deliveries = router.resolve_deliveries(
        &archived,
        |_, _| vec![Target::new("alice", "owner"), Target::new("alice", "owner")],
        &widget("w1"),
    );
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].template, "archive/widget/owner");
}

#[test]
fn test_groups_ordered_and_deduplicated() {
    let router = router();
    let deliveries = router.resolve_deliveries(&created(), owner_and_watchers, &widget("w1"));
    let recipients: Vec<&str> = deliveries.iter().map(|d| d.target.recipient.as_str()).collect();
    assert_eq!(recipients, vec!["alice", "bob", "carol"]);
    assert_eq!(deliveries[1].template, "watchers/widget/created");
}

#[test]
fn test_unbound_group_is_skipped() {
    let router = router();
    let deliveries = router.resolve_deliveries(
        &created(),
        |_, _| vec![Target::new("dave", "auditor"), Target::new("alice", "owner")],
        &widget("w1"),
    );
    assert_eq!(deliveries.len(), 1);
}

// ============================================================================
// Transactions
// ============================================================================

#[test]
fn test_rollback_enqueues_nothing() {
    let router = router();
    let queue = NotificationQueue::in_memory();

    let mut tx = DeliveryTransaction::new();
    assert_eq!(router.route(&mut tx, &created(), owner_and_watchers, &widget("w1")), 3);
    assert_eq!(tx.rollback(), 3);

    assert_eq!(tokio_test::block_on(queue.len()).unwrap(), 0);
}

#[test]
fn test_dropped_transaction_enqueues_nothing() {
    let router = router();
    let queue = NotificationQueue::in_memory();
    {
        let mut tx = DeliveryTransaction::new();
        router.route(&mut tx, &created(), owner_and_watchers, &widget("w1"));
    }
    assert!(tokio_test::block_on(queue.is_empty()).unwrap());
}

#[tokio::test]
async fn test_commit_after_failed_state_change() {
    let router = router();
    let queue = NotificationQueue::in_memory();

    let mut tx = DeliveryTransaction::new();
    router.route(&mut tx, &created(), owner_and_watchers, &widget("w1"));
    let result = tx
        .commit_after(&queue, || async {
            Err::<(), _>(KeystoneError::internal("constraint violation"))
        })
        .await;

    assert!(matches!(result, Err(CommitError::Aborted(_))));
    assert_eq!(queue.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_commit_after_successful_state_change() {
    let router = router();
    let queue = NotificationQueue::in_memory();

    let mut tx = DeliveryTransaction::new();
    let batch = tx.batch_id();
    router.route(&mut tx, &created(), owner_and_watchers, &widget("w1"));
    let saved = tx
        .commit_after(&queue, || async { Ok("w1") })
        .await
        .unwrap();
    assert_eq!(saved, "w1");

    let mut sequences = Vec::new();
    while let Some(job) = queue.dequeue().await.unwrap() {
        assert_eq!(job.batch_id, batch);
        sequences.push(job.sequence);
    }
    assert_eq!(sequences, vec![0, 1, 2]);
}

// ============================================================================
// Worker
// ============================================================================

#[tokio::test]
async fn test_worker_preserves_batch_order() {
    let router = router();
    let queue = Arc::new(NotificationQueue::in_memory());
    let sink = Arc::new(keystone_core::notify::RecordingDeliverySink::new());

    for id in ["w1", "w2"] {
        let mut tx = DeliveryTransaction::new();
        router.route(&mut tx, &created(), owner_and_watchers, &widget(id));
        tx.commit(&queue).await.unwrap();
    }

    let handle = DeliveryWorker::new(fast_worker(), RetryPolicy::no_retry())
        .start(queue.clone(), sink.clone());
    wait_for(|| sink.len() == 6).await;
    assert!(handle.join().await);

    let deliveries = sink.deliveries();
    for id in ["w1", "w2"] {
        let recipients: Vec<&str> = deliveries
            .iter()
            .filter(|d| d.record.id == id)
            .map(|d| d.target.recipient.as_str())
            .collect();
        assert_eq!(recipients, vec!["alice", "bob", "carol"]);
    }
}

struct FlakySink {
    failures_left: AtomicU32,
    delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl DeliverySink for FlakySink {
    async fn deliver(&self, delivery: &Delivery) -> std::result::Result<(), DeliveryError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(DeliveryError::retryable("mail server unavailable"));
        }
        self.delivered.lock().push(delivery.target.recipient.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_worker_retries_then_succeeds() {
    let router = router();
    let queue = Arc::new(NotificationQueue::in_memory());
    let sink = Arc::new(FlakySink {
        failures_left: AtomicU32::new(2),
        delivered: Mutex::new(Vec::new()),
    });

    let mut tx = DeliveryTransaction::new();
    router.route(&mut tx, &created(), |_, _| vec![Target::new("alice", "owner")], &widget("w1"));
    tx.commit(&queue).await.unwrap();

    let handle = DeliveryWorker::new(
        fast_worker(),
        RetryPolicy::with_retries(3, BackoffStrategy::fixed(1)),
    )
    .start(queue.clone(), sink.clone());
    let stats = handle.stats().clone();
    wait_for(|| stats.succeeded() == 1).await;

    assert_eq!(stats.failed_attempts(), 2);
    assert_eq!(sink.delivered.lock().as_slice(), ["alice".to_string()]);
    assert!(handle.join().await);
}

struct DownSink;

#[async_trait]
impl DeliverySink for DownSink {
    async fn deliver(&self, _delivery: &Delivery) -> std::result::Result<(), DeliveryError> {
        Err(DeliveryError::retryable("connection refused"))
    }
}

#[tokio::test]
async fn test_worker_dead_letters_after_last_attempt() {
    let router = router();
    let queue = Arc::new(NotificationQueue::in_memory());

    let mut tx = DeliveryTransaction::new();
    router.route(&mut tx, &created(), |_, _| vec![Target::new("alice", "owner")], &widget("w1"));
    tx.commit(&queue).await.unwrap();

    let handle = DeliveryWorker::new(
        fast_worker(),
        RetryPolicy::with_retries(2, BackoffStrategy::fixed(1)),
    )
    .start(queue.clone(), Arc::new(DownSink));

    let stats = handle.stats().clone();
    wait_for(|| stats.dead_lettered() == 1).await;
    assert!(handle.join().await);

    let dead: Vec<DeliveryJob> = queue.drain_dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].last_error.as_deref(), Some("connection refused (retryable)"));
}

#[tokio::test]
async fn test_deliver_now_reports_failure() {
    let router = router();
    let err = router
        .deliver_now(&DownSink, &created(), owner_and_watchers, &widget("w1"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::DeliveryFailed);
}
