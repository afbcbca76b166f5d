//! Notification routing and delivery.
//!
//! This module provides:
//! - **Bindings**: `(resource.event, target group)` to template path
//! - **Router**: resolves targets into deliveries
//! - **Transactions**: enqueue bound to the triggering state commit
//! - **Queue**: FIFO backends with dead letter handling
//! - **Worker**: ordered, retrying delivery pool

pub mod binding;
pub mod delivery;
pub mod queue;
pub mod router;
pub mod transaction;
pub mod worker;

pub use binding::{
    BindingTable, BindingTableBuilder, NotificationBinding, NotificationKey, Target, TargetGroup,
    DEFAULT_TEMPLATE,
};
pub use delivery::{
    BackoffStrategy, Delivery, DeliveryError, DeliveryJob, DeliverySink, RecordingDeliverySink,
    RetryPolicy,
};
pub use queue::{
    InMemoryQueueBackend, NotificationQueue, QueueBackend, QueueBackendKind, QueueConfig,
    QueueStats, RedisQueueBackend,
};
pub use router::NotificationRouter;
pub use transaction::{CommitError, DeliveryTransaction};
pub use worker::{DeliveryWorker, WorkerConfig, WorkerHandle, WorkerStats};
