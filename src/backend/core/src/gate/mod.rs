//! Capability checks and their audit trail.

pub mod audit;
#[allow(clippy::module_inception)]
pub mod gate;

pub use audit::{AuditRecord, AuditSink, Decision, MemoryAuditSink, TracingAuditSink};
pub use gate::{CapabilityGate, Grant, RecordTarget};
