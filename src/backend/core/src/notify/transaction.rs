//! Commit-bound delivery enqueue.
//!
//! Deliveries routed during a state change are held by a
//! [`DeliveryTransaction`] and reach the queue only once that state change has
//! committed. A rollback, a failed commit or dropping the transaction discards
//! them.

use std::fmt;
use std::future::Future;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::delivery::{Delivery, DeliveryJob};
use super::queue::NotificationQueue;
use crate::error::{KeystoneError, Result};
use crate::telemetry::metrics::DeliveryMetrics;

/// Failure of [`DeliveryTransaction::commit_after`].
#[derive(Debug)]
pub enum CommitError<T> {
    /// Nothing happened: the deliveries could not be staged, or the state
    /// commit failed and the staged batch was discarded.
    Aborted(KeystoneError),
    /// The state change is durable but its deliveries are still staged under
    /// `batch_id`. Retry with [`NotificationQueue::publish`]; do not repeat
    /// the state change.
    Unpublished {
        value: T,
        batch_id: Uuid,
        error: KeystoneError,
    },
}

impl<T> CommitError<T> {
    pub fn error(&self) -> &KeystoneError {
        match self {
            Self::Aborted(error) | Self::Unpublished { error, .. } => error,
        }
    }

    /// Whether the state change went through.
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::Unpublished { .. })
    }
}

impl<T> fmt::Display for CommitError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted(error) => write!(f, "commit aborted: {}", error),
            Self::Unpublished { batch_id, error, .. } => {
                write!(f, "state committed, batch {} unpublished: {}", batch_id, error)
            }
        }
    }
}

impl<T: fmt::Debug> std::error::Error for CommitError<T> {}

/// Deliveries pending on one triggering transaction.
#[derive(Debug)]
pub struct DeliveryTransaction {
    batch_id: Uuid,
    pending: Vec<Delivery>,
    finished: bool,
}

impl DeliveryTransaction {
    pub fn new() -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            pending: Vec::new(),
            finished: false,
        }
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn push(&mut self, delivery: Delivery) {
        self.pending.push(delivery);
    }

    pub fn extend(&mut self, deliveries: impl IntoIterator<Item = Delivery>) {
        self.pending.extend(deliveries);
    }

    pub fn pending(&self) -> &[Delivery] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take_jobs(&mut self) -> Vec<DeliveryJob> {
        self.finished = true;
        let batch_id = self.batch_id;
        std::mem::take(&mut self.pending)
            .into_iter()
            .enumerate()
            .map(|(sequence, delivery)| DeliveryJob::new(batch_id, sequence as u32, delivery))
            .collect()
    }

    /// Enqueue every pending delivery as one batch, in push order.
    ///
    /// Call only after the triggering state change is durable.
    pub async fn commit(mut self, queue: &NotificationQueue) -> Result<usize> {
        let jobs = self.take_jobs();
        let count = jobs.len();
        if count == 0 {
            return Ok(0);
        }
        queue.enqueue_batch(jobs).await.map_err(|e| {
            error!(batch_id = %self.batch_id, count, error = %e, "Failed to enqueue committed deliveries");
            e
        })?;
        debug!(batch_id = %self.batch_id, count, "Committed deliveries");
        Ok(count)
    }

    /// Stage the deliveries, run the state commit, then publish them.
    ///
    /// Staging happens first so a full or unreachable queue aborts before the
    /// state changes. If `state_commit` fails the staged batch is discarded.
    /// If publishing fails after a successful commit, the committed value is
    /// returned inside [`CommitError::Unpublished`] and the batch stays
    /// staged.
    pub async fn commit_after<F, Fut, T>(
        mut self,
        queue: &NotificationQueue,
        state_commit: F,
    ) -> std::result::Result<T, CommitError<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let batch_id = self.batch_id;
        let jobs = self.take_jobs();
        let count = jobs.len();

        if count > 0 {
            if let Err(e) = queue.stage(batch_id, jobs).await {
                e.log();
                DeliveryMetrics::discarded(count);
                return Err(CommitError::Aborted(e));
            }
        }

        let value = match state_commit().await {
            Ok(value) => value,
            Err(e) => {
                if count > 0 {
                    if let Err(discard) = queue.discard(batch_id).await {
                        warn!(%batch_id, error = %discard, "Failed to discard staged deliveries");
                    }
                    DeliveryMetrics::discarded(count);
                }
                debug!(%batch_id, discarded = count, "State commit failed; deliveries discarded");
                return Err(CommitError::Aborted(e));
            }
        };

        if count == 0 {
            return Ok(value);
        }
        match queue.publish(batch_id).await {
            Ok(published) => {
                debug!(%batch_id, count = published, "Committed deliveries");
                Ok(value)
            }
            Err(e) => {
                error!(%batch_id, count, "State committed but deliveries were not published");
                e.log();
                Err(CommitError::Unpublished {
                    value,
                    batch_id,
                    error: e,
                })
            }
        }
    }

    /// Discard every pending delivery. Returns how many were dropped.
    pub fn rollback(mut self) -> usize {
        let discarded = self.take_jobs().len();
        if discarded > 0 {
            DeliveryMetrics::discarded(discarded);
        }
        debug!(batch_id = %self.batch_id, discarded, "Rolled back deliveries");
        discarded
    }
}

impl Default for DeliveryTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeliveryTransaction {
    fn drop(&mut self) {
        if !self.finished && !self.pending.is_empty() {
            DeliveryMetrics::discarded(self.pending.len());
            debug!(
                batch_id = %self.batch_id,
                discarded = self.pending.len(),
                "Delivery transaction dropped without commit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::notify::binding::{NotificationKey, Target};
    use crate::notify::queue::{InMemoryQueueBackend, QueueBackend, QueueConfig, QueueStats};
    use crate::schema::Record;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn delivery(recipient: &str) -> Delivery {
        Delivery {
            key: NotificationKey::parse("widget.created").unwrap(),
            target: Target::new(recipient, "owners"),
            template: "owners/widget/created".to_string(),
            record: Record::new("widget", "w1"),
        }
    }

    #[tokio::test]
    async fn test_commit_enqueues_in_order() {
        let queue = NotificationQueue::in_memory();
        let mut tx = DeliveryTransaction::new();
        tx.push(delivery("alice"));
        tx.push(delivery("bob"));
        let batch = tx.batch_id();

        assert_eq!(tx.commit(&queue).await.unwrap(), 2);

        let first = queue.dequeue().await.unwrap().unwrap();
        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.batch_id, batch);
        assert_eq!(first.delivery.target.recipient.as_str(), "alice");
        assert_eq!(second.sequence, 1);
    }

    #[tokio::test]
    async fn test_rollback_enqueues_nothing() {
        let queue = NotificationQueue::in_memory();
        let mut tx = DeliveryTransaction::new();
        tx.push(delivery("alice"));

        assert_eq!(tx.rollback(), 1);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_state_commit_enqueues_nothing() {
        let queue = NotificationQueue::in_memory();
        let mut tx = DeliveryTransaction::new();
        tx.push(delivery("alice"));

        let result = tx
            .commit_after(&queue, || async {
                Err::<(), _>(KeystoneError::internal("constraint violation"))
            })
            .await;
        let err = result.unwrap_err();
        assert!(!err.is_committed());
        assert_eq!(err.error().code(), ErrorCode::InternalError);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_full_queue_aborts_before_state_change() {
        let backend = Arc::new(InMemoryQueueBackend::new(1));
        let queue = NotificationQueue::new(backend.clone(), QueueConfig::default());
        queue
            .enqueue_batch(vec![DeliveryJob::new(Uuid::new_v4(), 0, delivery("carol"))])
            .await
            .unwrap();

        let mut tx = DeliveryTransaction::new();
        tx.push(delivery("alice"));
        let state_changed = AtomicBool::new(false);
        let result = tx
            .commit_after(&queue, || async {
                state_changed.store(true, Ordering::SeqCst);
                Ok::<_, KeystoneError>("w1")
            })
            .await;

        let err = result.unwrap_err();
        assert!(!err.is_committed());
        assert_eq!(err.error().code(), ErrorCode::QueueFull);
        assert!(!state_changed.load(Ordering::SeqCst));
        assert_eq!(queue.len().await.unwrap(), 1);
        assert_eq!(backend.staged().await, 0);
    }

    /// Accepts staged batches but cannot publish them.
    struct StuckBackend(InMemoryQueueBackend);

    #[async_trait]
    impl QueueBackend for StuckBackend {
        async fn enqueue_batch(&self, jobs: Vec<DeliveryJob>) -> Result<()> {
            self.0.enqueue_batch(jobs).await
        }

        async fn stage(&self, batch_id: Uuid, jobs: Vec<DeliveryJob>) -> Result<()> {
            self.0.stage(batch_id, jobs).await
        }

        async fn publish(&self, _batch_id: Uuid) -> Result<usize> {
            Err(KeystoneError::new(ErrorCode::QueueConnectionFailed, "queue unreachable"))
        }

        async fn discard(&self, batch_id: Uuid) -> Result<usize> {
            self.0.discard(batch_id).await
        }

        async fn dequeue(&self) -> Result<Option<DeliveryJob>> {
            self.0.dequeue().await
        }

        async fn stats(&self) -> Result<QueueStats> {
            self.0.stats().await
        }

        async fn len(&self) -> Result<usize> {
            self.0.len().await
        }
    }

    #[tokio::test]
    async fn test_unpublished_batch_keeps_committed_value() {
        let backend = Arc::new(StuckBackend(InMemoryQueueBackend::default()));
        let queue = NotificationQueue::new(backend.clone(), QueueConfig::default());
        let mut tx = DeliveryTransaction::new();
        tx.push(delivery("alice"));
        let batch = tx.batch_id();

        let err = tx
            .commit_after(&queue, || async { Ok::<_, KeystoneError>("w1") })
            .await
            .unwrap_err();

        assert!(err.is_committed());
        assert_eq!(err.error().code(), ErrorCode::QueueConnectionFailed);
        match err {
            CommitError::Unpublished { value, batch_id, .. } => {
                assert_eq!(value, "w1");
                assert_eq!(batch_id, batch);
            }
            CommitError::Aborted(_) => panic!("state change was committed"),
        }
        assert_eq!(backend.0.staged().await, 1);
        assert!(queue.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_successful_state_commit_enqueues() {
        let queue = NotificationQueue::in_memory();
        let mut tx = DeliveryTransaction::new();
        tx.push(delivery("alice"));

        let id = tx
            .commit_after(&queue, || async { Ok::<_, KeystoneError>("w1") })
            .await
            .unwrap();
        assert_eq!(id, "w1");
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drop_discards() {
        let queue = NotificationQueue::in_memory();
        {
            let mut tx = DeliveryTransaction::new();
            tx.push(delivery("alice"));
        }
        assert!(queue.is_empty().await.unwrap());
    }
}
