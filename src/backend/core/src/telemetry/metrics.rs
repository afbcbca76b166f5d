//! Metric names and recording helpers.
//!
//! The core only talks to the `metrics` facade. Installing a recorder or an
//! exporter is the embedding service's job; without one every call here is a
//! no-op.

use metrics::{counter, describe_counter, describe_gauge, gauge};

pub const DECISIONS_TOTAL: &str = "keystone_decisions_total";
pub const POLICY_RESOLUTIONS_TOTAL: &str = "keystone_policy_resolutions_total";
pub const PAYLOAD_REJECTIONS_TOTAL: &str = "keystone_payload_rejections_total";
pub const DELIVERIES_ENQUEUED_TOTAL: &str = "keystone_deliveries_enqueued_total";
pub const DELIVERIES_DISCARDED_TOTAL: &str = "keystone_deliveries_discarded_total";
pub const DELIVERIES_COMPLETED_TOTAL: &str = "keystone_deliveries_completed_total";
pub const DELIVERY_FAILURES_TOTAL: &str = "keystone_delivery_failures_total";
pub const DELIVERIES_DEAD_LETTERED_TOTAL: &str = "keystone_deliveries_dead_lettered_total";
pub const UNBOUND_TARGET_GROUPS_TOTAL: &str = "keystone_unbound_target_groups_total";
pub const QUEUE_DEPTH: &str = "keystone_queue_depth";

/// Register all metric descriptions.
pub fn describe_metrics() {
    describe_counter!(DECISIONS_TOTAL, "Capability gate decisions by outcome");
    describe_counter!(
        POLICY_RESOLUTIONS_TOTAL,
        "Policy resolutions by fallback step (exact, role_default, deny_all)"
    );
    describe_counter!(
        PAYLOAD_REJECTIONS_TOTAL,
        "Write payloads rejected for unpermitted attributes"
    );
    describe_counter!("keystone_errors_total", "Total number of errors by code");

    describe_counter!(DELIVERIES_ENQUEUED_TOTAL, "Delivery jobs enqueued on commit");
    describe_counter!(
        DELIVERIES_DISCARDED_TOTAL,
        "Routed deliveries discarded because their transaction rolled back"
    );
    describe_counter!(DELIVERIES_COMPLETED_TOTAL, "Deliveries handed to the sink");
    describe_counter!(DELIVERY_FAILURES_TOTAL, "Failed delivery attempts");
    describe_counter!(
        DELIVERIES_DEAD_LETTERED_TOTAL,
        "Deliveries moved to the dead letter queue"
    );
    describe_counter!(
        UNBOUND_TARGET_GROUPS_TOTAL,
        "Target groups returned by a resolver with no binding for the key"
    );
    describe_gauge!(QUEUE_DEPTH, "Pending delivery jobs");
}

/// Record one gate decision.
pub fn record_decision(resource_type: &str, verb: &str, decision: &str) {
    counter!(
        DECISIONS_TOTAL,
        "resource_type" => resource_type.to_string(),
        "verb" => verb.to_string(),
        "decision" => decision.to_string(),
    )
    .increment(1);
}

/// Record which fallback step produced a policy.
pub fn record_resolution(resolution: &'static str) {
    counter!(POLICY_RESOLUTIONS_TOTAL, "resolution" => resolution).increment(1);
}

/// Record a rejected write payload.
pub fn record_payload_rejection(resource_type: &str) {
    counter!(PAYLOAD_REJECTIONS_TOTAL, "resource_type" => resource_type.to_string()).increment(1);
}

/// Delivery lifecycle counters.
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn enqueued(count: usize) {
        counter!(DELIVERIES_ENQUEUED_TOTAL).increment(count as u64);
    }

    pub fn discarded(count: usize) {
        counter!(DELIVERIES_DISCARDED_TOTAL).increment(count as u64);
    }

    pub fn completed(key: &str) {
        counter!(DELIVERIES_COMPLETED_TOTAL, "key" => key.to_string()).increment(1);
    }

    pub fn failed(key: &str) {
        counter!(DELIVERY_FAILURES_TOTAL, "key" => key.to_string()).increment(1);
    }

    pub fn dead_lettered(key: &str) {
        counter!(DELIVERIES_DEAD_LETTERED_TOTAL, "key" => key.to_string()).increment(1);
    }

    pub fn unbound_group(key: &str, group: &str) {
        counter!(
            UNBOUND_TARGET_GROUPS_TOTAL,
            "key" => key.to_string(),
            "group" => group.to_string(),
        )
        .increment(1);
    }

    pub fn queue_depth(depth: usize) {
        gauge!(QUEUE_DEPTH).set(depth as f64);
    }
}
