#![allow(clippy::result_large_err)]
//! # Keystone Core
//!
//! Declarative authorization and API-surface derivation.
//!
//! ## Architecture
//!
//! - **Policy Registry**: Immutable (role, resource type) policies with base inheritance
//! - **Scope Resolver**: Turns policies into composable record filters
//! - **Attribute Surface**: Per-action attribute lists derived from schema and policy
//! - **Capability Gate**: Verb checks with a mandatory audit record per decision
//! - **Notification Router**: Event-to-delivery routing with transactional enqueueing
//! - **Manifest**: TOML/YAML/JSON policy documents compiled at startup
//! - **Telemetry**: Structured logging and decision metrics

pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod manifest;
pub mod notify;
pub mod policy;
pub mod schema;
pub mod scope;
pub mod surface;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, KeystoneError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, EngineConfig};
    pub use crate::engine::{AccessEngine, ActionRequest, Authorization};
    pub use crate::error::{ErrorCode, KeystoneError, Result};
    pub use crate::gate::{
        AuditRecord, AuditSink, CapabilityGate, Decision, Grant, MemoryAuditSink, RecordTarget,
        TracingAuditSink,
    };
    pub use crate::manifest::{CompiledManifest, Manifest, ManifestFormat};
    pub use crate::notify::{
        BindingTable, CommitError, Delivery, DeliveryError, DeliverySink, DeliveryTransaction,
        DeliveryWorker, NotificationKey, NotificationQueue, NotificationRouter, RetryPolicy, Target,
        TargetGroup, WorkerConfig,
    };
    pub use crate::policy::{
        Action, CapabilitySet, Condition, EffectivePolicy, Policy, PolicyBuilder, PolicyRegistry,
        PredefinedRole, Principal, PrincipalId, Resolution, ResourceType, RoleId, TenantId, Verb,
    };
    pub use crate::schema::{AttributeDef, AttributeType, ParentRef, Record, ResourceSchema, SchemaCatalog};
    pub use crate::scope::{Dataset, Filter, NoRelations, RelationSource, Scope, ScopeResolver, ScopeRule};
    pub use crate::surface::{describe_resource, AttributeSurface, PayloadMode, ResourceDescription};
}
