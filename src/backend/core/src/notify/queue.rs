//! Delivery queue with dead letter handling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, LazyLock};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::delivery::DeliveryJob;
use crate::error::{ErrorCode, ErrorContext, KeystoneError, Result};
use crate::telemetry::metrics::DeliveryMetrics;

/// Which queue backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    #[default]
    Memory,
    Redis,
}

/// Configuration for the delivery queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub backend: QueueBackendKind,
    /// Redis connection URL (redis backend only)
    pub redis_url: String,
    /// Redis list key (redis backend only)
    pub queue_key: String,
    /// Maximum queue size (0 = unlimited)
    pub max_size: usize,
    /// Whether to keep dead-lettered jobs
    pub enable_dead_letter: bool,
    /// Maximum items in the dead letter queue
    pub dead_letter_max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackendKind::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            queue_key: "keystone:deliveries".to_string(),
            max_size: 10_000,
            enable_dead_letter: true,
            dead_letter_max_size: 1_000,
        }
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Number of pending jobs
    pub pending: usize,
    /// Jobs enqueued since start
    pub enqueued: u64,
    /// Jobs handed to workers since start
    pub dequeued: u64,
    /// Number of dead letter jobs
    pub dead_letter: usize,
}

/// Bounded dead letter queue; the oldest job is evicted when full.
#[derive(Debug)]
pub struct DeadLetterQueue {
    jobs: VecDeque<DeliveryJob>,
    max_size: usize,
}

impl DeadLetterQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            jobs: VecDeque::new(),
            max_size,
        }
    }

    pub fn push(&mut self, job: DeliveryJob) {
        if self.max_size == 0 {
            return;
        }
        if self.jobs.len() >= self.max_size {
            self.jobs.pop_front();
        }
        self.jobs.push_back(job);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn drain(&mut self) -> Vec<DeliveryJob> {
        self.jobs.drain(..).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backends
// ═══════════════════════════════════════════════════════════════════════════════

/// Trait for queue backends.
///
/// Backends are FIFO. A batch is appended atomically: either every job of the
/// batch is queued or none is.
///
/// A batch can also be staged: held outside the FIFO, invisible to workers,
/// until it is published or discarded. Staging reserves room for the batch so
/// publishing it later never fails for capacity.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn enqueue_batch(&self, jobs: Vec<DeliveryJob>) -> Result<()>;

    async fn stage(&self, batch_id: Uuid, jobs: Vec<DeliveryJob>) -> Result<()>;

    /// Append a staged batch to the FIFO. Returns the number of jobs moved.
    async fn publish(&self, batch_id: Uuid) -> Result<usize>;

    /// Drop a staged batch. Returns the number of jobs dropped.
    async fn discard(&self, batch_id: Uuid) -> Result<usize>;

    /// Dequeue the oldest job, if any.
    async fn dequeue(&self) -> Result<Option<DeliveryJob>>;

    async fn stats(&self) -> Result<QueueStats>;

    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// In-memory queue backend for testing and development.
pub struct InMemoryQueueBackend {
    queue: Arc<RwLock<VecDeque<DeliveryJob>>>,
    staged: Arc<RwLock<HashMap<Uuid, Vec<DeliveryJob>>>>,
    stats: Arc<RwLock<QueueStats>>,
    max_size: usize,
}

impl InMemoryQueueBackend {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(RwLock::new(VecDeque::new())),
            staged: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(QueueStats::default())),
            max_size,
        }
    }

    /// Snapshot of the pending jobs, oldest first.
    pub async fn pending(&self) -> Vec<DeliveryJob> {
        self.queue.read().await.iter().cloned().collect()
    }

    /// Number of jobs held in staged batches.
    pub async fn staged(&self) -> usize {
        self.staged.read().await.values().map(Vec::len).sum()
    }

    fn reserve(&self, queued: usize, staged: usize, incoming: usize) -> Result<()> {
        if self.max_size > 0 && queued + staged + incoming > self.max_size {
            return Err(KeystoneError::new(
                ErrorCode::QueueFull,
                format!("Delivery queue is full ({} jobs)", self.max_size),
            ));
        }
        Ok(())
    }
}

impl Default for InMemoryQueueBackend {
    fn default() -> Self {
        Self::new(QueueConfig::default().max_size)
    }
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn enqueue_batch(&self, jobs: Vec<DeliveryJob>) -> Result<()> {
        let mut queue = self.queue.write().await;
        let staged = self.staged.read().await;
        self.reserve(queue.len(), staged.values().map(Vec::len).sum(), jobs.len())?;
        let mut stats = self.stats.write().await;
        stats.enqueued += jobs.len() as u64;
        queue.extend(jobs);
        stats.pending = queue.len();
        Ok(())
    }

    async fn stage(&self, batch_id: Uuid, jobs: Vec<DeliveryJob>) -> Result<()> {
        let queue = self.queue.read().await;
        let mut staged = self.staged.write().await;
        self.reserve(queue.len(), staged.values().map(Vec::len).sum(), jobs.len())?;
        staged.entry(batch_id).or_default().extend(jobs);
        Ok(())
    }

    async fn publish(&self, batch_id: Uuid) -> Result<usize> {
        let mut queue = self.queue.write().await;
        let jobs = self.staged.write().await.remove(&batch_id).unwrap_or_default();
        let count = jobs.len();
        let mut stats = self.stats.write().await;
        stats.enqueued += count as u64;
        queue.extend(jobs);
        stats.pending = queue.len();
        Ok(count)
    }

    async fn discard(&self, batch_id: Uuid) -> Result<usize> {
        let jobs = self.staged.write().await.remove(&batch_id).unwrap_or_default();
        Ok(jobs.len())
    }

    async fn dequeue(&self) -> Result<Option<DeliveryJob>> {
        let mut queue = self.queue.write().await;
        let mut stats = self.stats.write().await;
        let job = queue.pop_front();
        stats.pending = queue.len();
        if job.is_some() {
            stats.dequeued += 1;
        }
        Ok(job)
    }

    async fn stats(&self) -> Result<QueueStats> {
        Ok(self.stats.read().await.clone())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.queue.read().await.len())
    }
}

/// Moves a staged list onto the queue list in one step.
static PUBLISH_SCRIPT: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
        local items = redis.call('LRANGE', KEYS[1], 0, -1)
        if #items > 0 then
            redis.call('RPUSH', KEYS[2], unpack(items))
        end
        redis.call('DEL', KEYS[1])
        return #items
        ",
    )
});

/// Redis-backed queue using a list: `RPUSH` to enqueue, `BLPOP` to dequeue.
///
/// Staged batches live in their own list under `<queue_key>:staged:<batch>`.
pub struct RedisQueueBackend {
    client: redis::Client,
    queue_key: String,
}

impl RedisQueueBackend {
    pub fn new(client: redis::Client, queue_key: impl Into<String>) -> Self {
        Self {
            client,
            queue_key: queue_key.into(),
        }
    }

    pub fn open(url: &str, queue_key: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self::new(client, queue_key))
    }

    fn staged_key(&self, batch_id: Uuid) -> String {
        format!("{}:staged:{}", self.queue_key, batch_id)
    }

    async fn get_conn(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                KeystoneError::with_internal(
                    ErrorCode::QueueConnectionFailed,
                    "Failed to get Redis connection for delivery queue",
                    e.to_string(),
                )
            })
    }
}

#[async_trait]
impl QueueBackend for RedisQueueBackend {
    async fn enqueue_batch(&self, jobs: Vec<DeliveryJob>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let payloads = jobs
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut conn = self.get_conn().await?;
        redis::cmd("RPUSH")
            .arg(&self.queue_key)
            .arg(&payloads)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                KeystoneError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to enqueue deliveries to Redis",
                    e.to_string(),
                )
            })?;

        tracing::debug!(queue = %self.queue_key, count = jobs.len(), "Deliveries enqueued");
        Ok(())
    }

    async fn stage(&self, batch_id: Uuid, jobs: Vec<DeliveryJob>) -> Result<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let payloads = jobs
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut conn = self.get_conn().await?;
        redis::cmd("RPUSH")
            .arg(self.staged_key(batch_id))
            .arg(&payloads)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                KeystoneError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to stage deliveries in Redis",
                    e.to_string(),
                )
            })?;
        Ok(())
    }

    async fn publish(&self, batch_id: Uuid) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let moved: usize = PUBLISH_SCRIPT
            .key(self.staged_key(batch_id))
            .key(&self.queue_key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                KeystoneError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to publish staged deliveries in Redis",
                    e.to_string(),
                )
            })?;
        tracing::debug!(queue = %self.queue_key, %batch_id, count = moved, "Staged deliveries published");
        Ok(moved)
    }

    async fn discard(&self, batch_id: Uuid) -> Result<usize> {
        let key = self.staged_key(batch_id);
        let mut conn = self.get_conn().await?;
        let (dropped, _deleted): (usize, usize) = redis::pipe()
            .atomic()
            .cmd("LLEN")
            .arg(&key)
            .cmd("DEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                KeystoneError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to discard staged deliveries in Redis",
                    e.to_string(),
                )
            })?;
        Ok(dropped)
    }

    async fn dequeue(&self) -> Result<Option<DeliveryJob>> {
        let mut conn = self.get_conn().await?;

        // BLPOP with a short timeout so shutdown is noticed.
        let result: Option<(String, String)> = redis::cmd("BLPOP")
            .arg(&self.queue_key)
            .arg(1_u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                KeystoneError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to dequeue delivery from Redis",
                    e.to_string(),
                )
            })?;

        match result {
            Some((_key, value)) => {
                let job: DeliveryJob = serde_json::from_str(&value)
                    .context(format!("Corrupt delivery job in {}", self.queue_key))?;
                tracing::debug!(queue = %self.queue_key, job_id = %job.id, "Delivery dequeued");
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.len().await?,
            ..Default::default()
        })
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.get_conn().await?;
        let length: usize = redis::cmd("LLEN")
            .arg(&self.queue_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                KeystoneError::with_internal(
                    ErrorCode::QueueError,
                    "Failed to get Redis queue length",
                    e.to_string(),
                )
            })?;
        Ok(length)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Notification Queue
// ═══════════════════════════════════════════════════════════════════════════════

/// The delivery queue shared by transactions and workers.
pub struct NotificationQueue {
    backend: Arc<dyn QueueBackend>,
    dead_letter: Arc<RwLock<DeadLetterQueue>>,
    config: QueueConfig,
}

impl NotificationQueue {
    pub fn new(backend: Arc<dyn QueueBackend>, config: QueueConfig) -> Self {
        let dlq = DeadLetterQueue::new(config.dead_letter_max_size);
        Self {
            backend,
            dead_letter: Arc::new(RwLock::new(dlq)),
            config,
        }
    }

    /// Build the configured backend.
    pub fn from_config(config: QueueConfig) -> Result<Self> {
        let backend: Arc<dyn QueueBackend> = match config.backend {
            QueueBackendKind::Memory => Arc::new(InMemoryQueueBackend::new(config.max_size)),
            QueueBackendKind::Redis => Arc::new(RedisQueueBackend::open(
                &config.redis_url,
                config.queue_key.clone(),
            )?),
        };
        Ok(Self::new(backend, config))
    }

    /// Create a new in-memory queue (for testing).
    pub fn in_memory() -> Self {
        let config = QueueConfig::default();
        Self::new(Arc::new(InMemoryQueueBackend::new(config.max_size)), config)
    }

    pub async fn enqueue_batch(&self, jobs: Vec<DeliveryJob>) -> Result<()> {
        let count = jobs.len();
        self.backend.enqueue_batch(jobs).await?;
        DeliveryMetrics::enqueued(count);
        if let Ok(depth) = self.backend.len().await {
            DeliveryMetrics::queue_depth(depth);
        }
        Ok(())
    }

    /// Hold a batch back from workers until [`publish`](Self::publish).
    pub async fn stage(&self, batch_id: Uuid, jobs: Vec<DeliveryJob>) -> Result<()> {
        self.backend.stage(batch_id, jobs).await
    }

    /// Release a staged batch to workers.
    pub async fn publish(&self, batch_id: Uuid) -> Result<usize> {
        let count = self.backend.publish(batch_id).await?;
        DeliveryMetrics::enqueued(count);
        if let Ok(depth) = self.backend.len().await {
            DeliveryMetrics::queue_depth(depth);
        }
        Ok(count)
    }

    pub async fn discard(&self, batch_id: Uuid) -> Result<usize> {
        self.backend.discard(batch_id).await
    }

    pub async fn dequeue(&self) -> Result<Option<DeliveryJob>> {
        self.backend.dequeue().await
    }

    /// Move a job to the dead letter queue.
    pub async fn dead_letter(&self, job: DeliveryJob) {
        if self.config.enable_dead_letter {
            self.dead_letter.write().await.push(job);
        }
    }

    /// Remove and return every dead-lettered job.
    pub async fn drain_dead_letters(&self) -> Vec<DeliveryJob> {
        self.dead_letter.write().await.drain()
    }

    pub async fn len(&self) -> Result<usize> {
        self.backend.len().await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.backend.is_empty().await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let mut stats = self.backend.stats().await?;
        stats.dead_letter = self.dead_letter.read().await.len();
        Ok(stats)
    }
}
