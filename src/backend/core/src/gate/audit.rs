//! Audit records emitted by the capability gate.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::policy::models::{PrincipalId, ResourceType, Verb};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Deny => write!(f, "deny"),
        }
    }
}

/// One authorization decision.
///
/// `reason` is for the audit trail only; callers get the uniform denial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub actor: Option<PrincipalId>,
    pub action: Verb,
    pub resource_type: ResourceType,
    pub resource_id: Option<String>,
    pub decision: Decision,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        actor: Option<PrincipalId>,
        action: Verb,
        resource_type: ResourceType,
        resource_id: Option<String>,
        decision: Decision,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor,
            action,
            resource_type,
            resource_id,
            decision,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sinks
// ═══════════════════════════════════════════════════════════════════════════════

/// Receives every audit record synchronously, before the decision is
/// returned to the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord);
}

impl<T: AuditSink + ?Sized> AuditSink for Arc<T> {
    fn record(&self, record: &AuditRecord) {
        (**self).record(record)
    }
}

/// Writes audit records to the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) {
        let actor = record
            .actor
            .as_ref()
            .map(|a| a.as_str())
            .unwrap_or("anonymous");
        match record.decision {
            Decision::Allow => info!(
                target: "audit",
                audit_id = %record.id,
                actor,
                action = %record.action,
                resource_type = %record.resource_type,
                resource_id = record.resource_id.as_deref(),
                decision = %record.decision,
                "Authorization decision"
            ),
            Decision::Deny => warn!(
                target: "audit",
                audit_id = %record.id,
                actor,
                action = %record.action,
                resource_type = %record.resource_type,
                resource_id = record.resource_id.as_deref(),
                decision = %record.decision,
                reason = record.reason.as_deref(),
                "Authorization decision"
            ),
        }
    }
}

/// Keeps audit records in memory. Used by tests and the CLI.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn last(&self) -> Option<AuditRecord> {
        self.records.lock().last().cloned()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) {
        self.records.lock().push(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_collects() {
        let sink = MemoryAuditSink::new();
        let record = AuditRecord::new(
            Some(PrincipalId::new("alice")),
            Verb::Show,
            ResourceType::new("widget"),
            Some("w1".to_string()),
            Decision::Deny,
        )
        .with_reason("outside scope");
        sink.record(&record);

        assert_eq!(sink.len(), 1);
        let stored = sink.last().unwrap();
        assert_eq!(stored.id, record.id);
        assert_eq!(stored.reason.as_deref(), Some("outside scope"));
    }

    #[test]
    fn test_record_serializes() {
        let record = AuditRecord::new(
            None,
            Verb::List,
            ResourceType::new("widget"),
            None,
            Decision::Allow,
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["decision"], "allow");
        assert_eq!(json["action"], "list");
        assert!(json["actor"].is_null());
    }

    #[test]
    fn test_arc_sink_forwards() {
        let sink = Arc::new(MemoryAuditSink::new());
        let shared: Arc<dyn AuditSink> = sink.clone();
        shared.record(&AuditRecord::new(
            None,
            Verb::List,
            ResourceType::new("widget"),
            None,
            Decision::Allow,
        ));
        assert_eq!(sink.len(), 1);
    }
}
