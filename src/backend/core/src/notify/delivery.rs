//! Delivery payloads, retry behaviour and the external delivery seam.
//!
//! This module provides:
//! - **Delivery**: one (target, template path, context record) tuple
//! - **DeliveryJob**: a delivery as it travels through the queue
//! - **DeliverySink**: the rendering/delivery collaborator
//! - **RetryPolicy**: retry behaviour with backoff strategies

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::binding::{NotificationKey, Target};
use crate::error::KeystoneError;
use crate::schema::Record;

// ═══════════════════════════════════════════════════════════════════════════════
// Delivery
// ═══════════════════════════════════════════════════════════════════════════════

/// A resolved notification for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub key: NotificationKey,
    pub target: Target,
    pub template: String,
    pub record: Record,
}

/// A delivery in the queue.
///
/// Jobs of one transaction share a `batch_id` and are numbered by `sequence`
/// in enqueue order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub sequence: u32,
    pub attempts: u32,
    pub delivery: Delivery,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl DeliveryJob {
    pub fn new(batch_id: Uuid, sequence: u32, delivery: Delivery) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            sequence,
            attempts: 0,
            delivery,
            enqueued_at: Utc::now(),
            last_error: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Delivery Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Error reported by a delivery sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryError {
    pub message: String,
    pub retryable: bool,
}

impl DeliveryError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if self.retryable {
            write!(f, " (retryable)")?;
        }
        Ok(())
    }
}

impl std::error::Error for DeliveryError {}

impl From<KeystoneError> for DeliveryError {
    fn from(error: KeystoneError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
        }
    }
}

/// The external collaborator that renders and sends a delivery.
#[async_trait]
pub trait DeliverySink: Send + Sync {
    async fn deliver(&self, delivery: &Delivery) -> std::result::Result<(), DeliveryError>;
}

/// Records deliveries in memory, in the order they arrive.
#[derive(Debug, Default)]
pub struct RecordingDeliverySink {
    delivered: Mutex<Vec<Delivery>>,
}

impl RecordingDeliverySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.delivered.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.delivered.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.delivered.lock().is_empty()
    }
}

#[async_trait]
impl DeliverySink for RecordingDeliverySink {
    async fn deliver(&self, delivery: &Delivery) -> std::result::Result<(), DeliveryError> {
        self.delivered.lock().push(delivery.clone());
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// Linear increase in delay (delay * attempt)
    Linear { initial_delay_ms: u64, increment_ms: u64 },
    /// Exponential increase in delay (initial * multiplier^attempt)
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Exponential with random jitter
    ExponentialWithJitter {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
        jitter_factor: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 500,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self {
            Self::Fixed { delay_ms } => *delay_ms,
            Self::Linear {
                initial_delay_ms,
                increment_ms,
            } => initial_delay_ms + (increment_ms * attempt as u64),
            Self::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let delay = (*initial_delay_ms as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_delay_ms as f64) as u64
            }
            Self::ExponentialWithJitter {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
                jitter_factor,
            } => {
                let base_delay = (*initial_delay_ms as f64) * multiplier.powi(attempt as i32);
                let capped_delay = base_delay.min(*max_delay_ms as f64);
                let jitter_range = capped_delay * jitter_factor;
                let jitter = (rand_simple() * 2.0 - 1.0) * jitter_range;
                (capped_delay + jitter).max(1.0) as u64
            }
        };

        Duration::from_millis(ms)
    }

    pub fn fixed(delay_ms: u64) -> Self {
        Self::Fixed { delay_ms }
    }

    pub fn exponential() -> Self {
        Self::default()
    }
}

/// Pseudo-random number in [0.0, 1.0] for jitter.
fn rand_simple() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u64(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    (hasher.finish() as f64) / (u64::MAX as f64)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// Retry behaviour for failed deliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0 = no retries)
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    /// Retry permanent errors too
    pub retry_on_any_error: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            retry_on_any_error: false,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    pub fn with_retries(max_attempts: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_attempts,
            backoff,
            ..Default::default()
        }
    }

    /// `retries` is the number of retries already made.
    pub fn should_retry(&self, retries: u32, error: &DeliveryError) -> bool {
        retries < self.max_attempts && (self.retry_on_any_error || error.retryable)
    }

    pub fn next_retry_delay(&self, retries: u32) -> Duration {
        self.backoff.delay_for_attempt(retries)
    }
}
