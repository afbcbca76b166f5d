//! Policy declarations and resolution.
//!
//! This module provides:
//! - Identifiers, principals, verbs and capability sets
//! - Policy descriptors built by overlaying a base template
//! - Predefined role templates
//! - The immutable registry keyed by (role, resource type)

pub mod models;
#[allow(clippy::module_inception)]
pub mod policy;
pub mod registry;
pub mod roles;

pub use models::{
    Action, CapabilitySet, Principal, PrincipalId, ResourceType, RoleId, TenantId, Verb,
};
pub use policy::{AttributeOverride, Condition, Policy, PolicyBuilder, RecordCondition};
pub use registry::{
    EffectivePolicy, FallbackStep, PolicyRegistry, RegistryBuilder, Resolution, ResolvedPolicy,
    ANONYMOUS_ROLE,
};
pub use roles::PredefinedRole;
