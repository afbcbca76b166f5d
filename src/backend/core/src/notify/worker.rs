//! Delivery worker pool.
//!
//! A dispatcher task drains the queue and hands each job to one of several
//! lanes. Jobs of the same batch always land in the same lane and each lane
//! delivers sequentially, so deliveries from one transaction go out in
//! enqueue order. Ordering across batches is unspecified.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::delivery::{DeliveryJob, DeliverySink, RetryPolicy};
use super::queue::NotificationQueue;
use crate::telemetry::metrics::DeliveryMetrics;

/// Configuration for the delivery worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of ordering lanes (concurrent deliveries)
    pub lanes: usize,
    /// Jobs buffered per lane before the dispatcher waits
    pub lane_buffer: usize,
    /// Sleep between polls of an empty queue
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long `join` waits for lanes to drain
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Worker name/identifier
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lanes: 4,
            lane_buffer: 64,
            poll_interval: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(30),
            name: "keystone-delivery".to_string(),
        }
    }
}

/// Statistics for the delivery worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Jobs taken from the queue
    pub processed: Arc<AtomicU64>,
    /// Jobs delivered
    pub succeeded: Arc<AtomicU64>,
    /// Failed attempts, including ones that were retried
    pub failed_attempts: Arc<AtomicU64>,
    /// Jobs moved to the dead letter queue
    pub dead_lettered: Arc<AtomicU64>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed_attempts(&self) -> u64 {
        self.failed_attempts.load(Ordering::Relaxed)
    }

    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }
}

/// Handle for controlling a running worker.
///
/// Dropping the handle also stops the worker.
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    stats: WorkerStats,
    dispatcher: JoinHandle<()>,
    shutdown_timeout: Duration,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Shut down and wait for in-flight lanes to drain.
    ///
    /// Returns `false` if the shutdown timeout elapsed first.
    pub async fn join(self) -> bool {
        self.shutdown();
        tokio::time::timeout(self.shutdown_timeout, self.dispatcher)
            .await
            .is_ok()
    }
}

/// Delivers queued jobs through a [`DeliverySink`].
pub struct DeliveryWorker {
    config: WorkerConfig,
    retry: RetryPolicy,
    stats: WorkerStats,
}

impl DeliveryWorker {
    pub fn new(config: WorkerConfig, retry: RetryPolicy) -> Self {
        Self {
            config,
            retry,
            stats: WorkerStats::new(),
        }
    }

    /// Start the worker, returning a handle for control.
    pub fn start(self, queue: Arc<NotificationQueue>, sink: Arc<dyn DeliverySink>) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let config = self.config.clone();
        let lanes = config.lanes.max(1);

        let mut senders = Vec::with_capacity(lanes);
        let mut lane_tasks = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let (tx, rx) = mpsc::channel::<DeliveryJob>(config.lane_buffer.max(1));
            senders.push(tx);
            lane_tasks.push(tokio::spawn(run_lane(
                lane,
                rx,
                queue.clone(),
                sink.clone(),
                self.retry.clone(),
                stats.clone(),
            )));
        }

        let dispatcher = tokio::spawn(async move {
            tracing::info!(worker = %config.name, lanes, "Delivery worker started");

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                match queue.dequeue().await {
                    Ok(Some(job)) => {
                        let lane = (job.batch_id.as_u128() % lanes as u128) as usize;
                        if senders[lane].send(job).await.is_err() {
                            tracing::error!(worker = %config.name, lane, "Delivery lane closed");
                            break;
                        }
                    }
                    Ok(None) => {
                        tokio::select! {
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(config.poll_interval) => {}
                        }
                    }
                    Err(e) => {
                        tracing::warn!(worker = %config.name, "Failed to dequeue delivery");
                        e.log();
                        tokio::select! {
                            changed = shutdown_rx.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            _ = tokio::time::sleep(config.poll_interval) => {}
                        }
                    }
                }
            }

            tracing::info!(worker = %config.name, "Worker shutting down");
            // Closing the senders lets each lane finish what it holds.
            drop(senders);
            futures::future::join_all(lane_tasks).await;
            tracing::info!(worker = %config.name, "Worker stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            stats,
            dispatcher,
            shutdown_timeout: self.config.shutdown_timeout,
        }
    }
}

async fn run_lane(
    lane: usize,
    mut jobs: mpsc::Receiver<DeliveryJob>,
    queue: Arc<NotificationQueue>,
    sink: Arc<dyn DeliverySink>,
    retry: RetryPolicy,
    stats: WorkerStats,
) {
    while let Some(mut job) = jobs.recv().await {
        stats.processed.fetch_add(1, Ordering::Relaxed);
        let key = job.delivery.key.to_string();

        loop {
            job.attempts += 1;
            match sink.deliver(&job.delivery).await {
                Ok(()) => {
                    stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    DeliveryMetrics::completed(&key);
                    tracing::debug!(lane, job_id = %job.id, key = %key, "Delivered");
                    break;
                }
                Err(e) => {
                    stats.failed_attempts.fetch_add(1, Ordering::Relaxed);
                    DeliveryMetrics::failed(&key);
                    let retries = job.attempts - 1;
                    job.last_error = Some(e.to_string());

                    if retry.should_retry(retries, &e) {
                        let delay = retry.next_retry_delay(retries);
                        tracing::warn!(
                            lane,
                            job_id = %job.id,
                            key = %key,
                            attempt = job.attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Delivery failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    tracing::error!(
                        lane,
                        job_id = %job.id,
                        key = %key,
                        attempts = job.attempts,
                        error = %e,
                        "Delivery failed; moving to dead letter queue"
                    );
                    stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    DeliveryMetrics::dead_lettered(&key);
                    queue.dead_letter(job).await;
                    break;
                }
            }
        }
    }
}
