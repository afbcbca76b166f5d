//! Routes notification events to deliveries.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::binding::{BindingTable, NotificationKey, Target, TargetGroup};
use super::delivery::{Delivery, DeliveryError, DeliverySink};
use super::transaction::DeliveryTransaction;
use crate::error::{ErrorCode, KeystoneError, Result};
use crate::schema::Record;
use crate::telemetry::metrics::DeliveryMetrics;

/// Resolves bindings for notification events.
///
/// The queued path ([`route`](Self::route)) and the synchronous path
/// ([`deliver_now`](Self::deliver_now)) share
/// [`resolve_deliveries`](Self::resolve_deliveries).
#[derive(Debug, Clone)]
pub struct NotificationRouter {
    bindings: Arc<BindingTable>,
}

impl NotificationRouter {
    pub fn new(bindings: Arc<BindingTable>) -> Self {
        Self { bindings }
    }

    pub fn bindings(&self) -> &Arc<BindingTable> {
        &self.bindings
    }

    /// One delivery per distinct (target, binding).
    ///
    /// Targets are grouped by target group, groups in name order and targets
    /// in the order the resolver returned them. A group with no binding is
    /// skipped and logged.
    pub fn resolve_deliveries<F>(&self, key: &NotificationKey, targets: F, record: &Record) -> Vec<Delivery>
    where
        F: FnOnce(&Record, &NotificationKey) -> Vec<Target>,
    {
        let mut grouped: BTreeMap<TargetGroup, Vec<Target>> = BTreeMap::new();
        for target in targets(record, key) {
            let group = grouped.entry(target.group.clone()).or_default();
            if !group.contains(&target) {
                group.push(target);
            }
        }

        let mut deliveries = Vec::new();
        for (group, targets) in grouped {
            let binding = match self.bindings.binding(key, &group) {
                Some(binding) => binding,
                None => {
                    warn!(key = %key, group = %group, "No binding for target group; skipping");
                    DeliveryMetrics::unbound_group(&key.to_string(), group.as_str());
                    continue;
                }
            };
            let template = binding.template_path();
            deliveries.extend(targets.into_iter().map(|target| Delivery {
                key: key.clone(),
                target,
                template: template.clone(),
                record: record.clone(),
            }));
        }

        debug!(key = %key, record_id = %record.id, deliveries = deliveries.len(), "Resolved deliveries");
        deliveries
    }

    /// Add the deliveries for an event to a pending transaction.
    ///
    /// Nothing reaches the queue until the transaction commits.
    pub fn route<F>(
        &self,
        tx: &mut DeliveryTransaction,
        key: &NotificationKey,
        targets: F,
        record: &Record,
    ) -> usize
    where
        F: FnOnce(&Record, &NotificationKey) -> Vec<Target>,
    {
        let deliveries = self.resolve_deliveries(key, targets, record);
        let count = deliveries.len();
        tx.extend(deliveries);
        count
    }

    /// Deliver synchronously, bypassing the queue.
    ///
    /// Deliveries go out in resolution order; the first failure stops the
    /// run and is returned.
    pub async fn deliver_now<F>(
        &self,
        sink: &dyn DeliverySink,
        key: &NotificationKey,
        targets: F,
        record: &Record,
    ) -> Result<usize>
    where
        F: FnOnce(&Record, &NotificationKey) -> Vec<Target>,
    {
        let deliveries = self.resolve_deliveries(key, targets, record);
        for delivery in &deliveries {
            sink.deliver(delivery).await.map_err(|e: DeliveryError| {
                DeliveryMetrics::failed(&key.to_string());
                KeystoneError::with_internal(
                    ErrorCode::DeliveryFailed,
                    "Notification delivery failed",
                    format!("{} to {}: {}", delivery.template, delivery.target.recipient, e),
                )
                .with_source(e)
            })?;
            DeliveryMetrics::completed(&key.to_string());
        }
        Ok(deliveries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::delivery::RecordingDeliverySink;

    fn router() -> NotificationRouter {
        let table = BindingTable::builder()
            .bind("widget.created", "owners")
            .bind("widget.created", "watchers")
            .build()
            .unwrap();
        NotificationRouter::new(Arc::new(table))
    }

    fn key() -> NotificationKey {
        NotificationKey::parse("widget.created").unwrap()
    }

    fn targets(_: &Record, _: &NotificationKey) -> Vec<Target> {
        vec![
            Target::new("carol", "watchers"),
            Target::new("alice", "owners"),
            Target::new("carol", "watchers"),
            Target::new("dave", "auditors"),
        ]
    }

    #[test]
    fn test_grouping_and_dedup() {
        let router = router();
        let record = Record::new("widget", "w1");
        let deliveries = router.resolve_deliveries(&key(), targets, &record);

        let summary: Vec<(&str, &str)> = deliveries
            .iter()
            .map(|d| (d.target.recipient.as_str(), d.template.as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("alice", "owners/widget/created"),
                ("carol", "watchers/widget/created"),
            ]
        );
    }

    #[test]
    fn test_route_defers_to_transaction() {
        let router = router();
        let record = Record::new("widget", "w1");
        let mut tx = DeliveryTransaction::new();
        assert_eq!(router.route(&mut tx, &key(), targets, &record), 2);
        assert_eq!(tx.len(), 2);
        tx.rollback();
    }

    #[tokio::test]
    async fn test_deliver_now_matches_queued_resolution() {
        let router = router();
        let record = Record::new("widget", "w1");
        let sink = RecordingDeliverySink::new();

        let sent = router.deliver_now(&sink, &key(), targets, &record).await.unwrap();
        assert_eq!(sent, 2);
        assert_eq!(sink.deliveries(), router.resolve_deliveries(&key(), targets, &record));
    }
}
