//! The policy registry.
//!
//! Built once at startup from policy builders and immutable afterwards.
//! Lookups take `&self` and never lock, so the registry is shared through an
//! `Arc` by every request handler.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::models::{CapabilitySet, Principal, ResourceType, RoleId, Verb};
use super::policy::{Policy, PolicyBuilder};
use super::roles::PredefinedRole;
use crate::error::{ErrorCode, KeystoneError, Result};
use crate::schema::{ResourceSchema, SchemaCatalog};
use crate::telemetry::metrics;

/// Default name of the role used for requests without a principal.
pub const ANONYMOUS_ROLE: &str = "anonymous";

// ═══════════════════════════════════════════════════════════════════════════════
// Resolution
// ═══════════════════════════════════════════════════════════════════════════════

/// Which fallback step produced a resolved policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// A policy registered for exactly this (role, resource type).
    Exact,
    /// The role's base policy.
    RoleDefault,
    /// Nothing registered; fail closed.
    DenyAll,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::RoleDefault => "role_default",
            Self::DenyAll => "deny_all",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A policy resolved for one role and resource type.
#[derive(Debug, Clone)]
pub struct ResolvedPolicy {
    pub role: RoleId,
    pub resource_type: ResourceType,
    pub policy: Arc<Policy>,
    pub resolution: Resolution,
}

impl ResolvedPolicy {
    pub fn permits(&self, verb: &Verb) -> bool {
        self.policy.permits(verb)
    }
}

/// One step of the fallback list consulted by [`PolicyRegistry::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackStep {
    pub resolution: Resolution,
    /// Human-readable lookup key, e.g. `"(member, widget)"`.
    pub key: String,
    pub registered: bool,
}

/// The per-role policies that apply to one principal and resource type.
///
/// Grants are ordered by role name so every combination is deterministic.
#[derive(Debug, Clone)]
pub struct EffectivePolicy {
    pub actor: Option<Principal>,
    pub resource_type: ResourceType,
    pub grants: Vec<ResolvedPolicy>,
}

impl EffectivePolicy {
    /// Union of every role's capabilities.
    pub fn capabilities(&self) -> CapabilitySet {
        self.grants
            .iter()
            .fold(CapabilitySet::empty(), |acc, g| acc.union(g.policy.capabilities()))
    }

    pub fn permits(&self, verb: &Verb) -> bool {
        self.grants.iter().any(|g| g.permits(verb))
    }

    /// Grants whose policy permits the verb.
    pub fn granting(&self, verb: &Verb) -> impl Iterator<Item = &ResolvedPolicy> {
        let verb = verb.clone();
        self.grants.iter().filter(move |g| g.permits(&verb))
    }

    pub fn is_deny_all(&self) -> bool {
        self.grants.iter().all(|g| g.policy.is_deny_all())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Immutable mapping from (role, resource type) to policy descriptors.
#[derive(Debug, Clone)]
pub struct PolicyRegistry {
    catalog: Arc<SchemaCatalog>,
    bases: BTreeMap<RoleId, Arc<Policy>>,
    policies: BTreeMap<(RoleId, ResourceType), Arc<Policy>>,
    anonymous_role: RoleId,
}

impl PolicyRegistry {
    pub fn builder(catalog: Arc<SchemaCatalog>) -> RegistryBuilder {
        RegistryBuilder::new(catalog)
    }

    pub fn catalog(&self) -> &Arc<SchemaCatalog> {
        &self.catalog
    }

    pub fn schema(&self, resource_type: &ResourceType) -> Result<&Arc<ResourceSchema>> {
        self.catalog.require(resource_type)
    }

    pub fn anonymous_role(&self) -> &RoleId {
        &self.anonymous_role
    }

    /// Roles with a base policy or at least one resource policy.
    pub fn roles(&self) -> Vec<RoleId> {
        let mut roles: Vec<RoleId> = self
            .bases
            .keys()
            .cloned()
            .chain(self.policies.keys().map(|(role, _)| role.clone()))
            .collect();
        roles.sort();
        roles.dedup();
        roles
    }

    pub fn base(&self, role: &RoleId) -> Option<&Arc<Policy>> {
        self.bases.get(role)
    }

    pub fn policy(&self, role: &RoleId, resource_type: &ResourceType) -> Option<&Arc<Policy>> {
        self.policies.get(&(role.clone(), resource_type.clone()))
    }

    /// Resolve the effective policy for one role.
    ///
    /// Exact match, then the role default, then deny-all. An unknown resource
    /// type always resolves to deny-all.
    pub fn resolve(&self, role: &RoleId, resource_type: &ResourceType) -> ResolvedPolicy {
        let (policy, resolution) = if !self.catalog.contains(resource_type) {
            warn!(role = %role, resource_type = %resource_type, "Resolving policy for unknown resource type");
            (None, Resolution::DenyAll)
        } else if let Some(policy) = self.policy(role, resource_type) {
            (Some(policy.clone()), Resolution::Exact)
        } else if let Some(policy) = self.bases.get(role) {
            (Some(policy.clone()), Resolution::RoleDefault)
        } else {
            (None, Resolution::DenyAll)
        };

        let policy = policy.unwrap_or_else(|| {
            Arc::new(Policy::deny_all(role.clone(), resource_type.clone()))
        });

        debug!(
            role = %role,
            resource_type = %resource_type,
            resolution = %resolution,
            "Resolved policy"
        );
        metrics::record_resolution(resolution.as_str());

        ResolvedPolicy {
            role: role.clone(),
            resource_type: resource_type.clone(),
            policy,
            resolution,
        }
    }

    /// Resolve every role of the principal independently.
    ///
    /// A missing principal resolves through the anonymous role. A principal
    /// without roles gets no grants at all.
    pub fn resolve_principal(
        &self,
        principal: Option<&Principal>,
        resource_type: &ResourceType,
    ) -> EffectivePolicy {
        let grants = match principal {
            Some(p) => p
                .roles()
                .iter()
                .map(|role| self.resolve(role, resource_type))
                .collect(),
            None => vec![self.resolve(&self.anonymous_role, resource_type)],
        };

        EffectivePolicy {
            actor: principal.cloned(),
            resource_type: resource_type.clone(),
            grants,
        }
    }

    /// The lookups `resolve` performs, in order, and whether each is
    /// registered.
    pub fn fallback_chain(&self, role: &RoleId, resource_type: &ResourceType) -> Vec<FallbackStep> {
        let known = self.catalog.contains(resource_type);
        vec![
            FallbackStep {
                resolution: Resolution::Exact,
                key: format!("({}, {})", role, resource_type),
                registered: known && self.policy(role, resource_type).is_some(),
            },
            FallbackStep {
                resolution: Resolution::RoleDefault,
                key: format!("({}, *)", role),
                registered: known && self.bases.contains_key(role),
            },
            FallbackStep {
                resolution: Resolution::DenyAll,
                key: "deny-all".to_string(),
                registered: true,
            },
        ]
    }

    pub fn len(&self) -> usize {
        self.bases.len() + self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Collects policy declarations and validates them into a [`PolicyRegistry`].
///
/// Every configuration problem is reported by [`RegistryBuilder::build`].
#[derive(Debug)]
pub struct RegistryBuilder {
    catalog: Arc<SchemaCatalog>,
    bases: Vec<PolicyBuilder>,
    policies: Vec<PolicyBuilder>,
    anonymous_role: RoleId,
}

impl RegistryBuilder {
    pub fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self {
            catalog,
            bases: Vec::new(),
            policies: Vec::new(),
            anonymous_role: RoleId::new(ANONYMOUS_ROLE),
        }
    }

    /// Add a base or resource policy, depending on how it was started.
    pub fn register(mut self, policy: PolicyBuilder) -> Self {
        if policy.resource_type().is_some() {
            self.policies.push(policy);
        } else {
            self.bases.push(policy);
        }
        self
    }

    /// Register the built-in role templates as base policies.
    pub fn with_predefined_roles(mut self) -> Self {
        for role in PredefinedRole::all() {
            self = self.register(role.template());
        }
        self
    }

    pub fn anonymous_role(mut self, role: impl Into<RoleId>) -> Self {
        self.anonymous_role = role.into();
        self
    }

    pub fn build(self) -> Result<PolicyRegistry> {
        let bases = build_bases(self.bases)?;

        let mut policies = BTreeMap::new();
        for builder in self.policies {
            let resource_type = builder
                .resource_type()
                .cloned()
                .ok_or_else(|| KeystoneError::internal("resource policy without resource type"))?;
            let schema = self.catalog.require(&resource_type).map_err(|_| {
                KeystoneError::configuration(
                    ErrorCode::UnknownResource,
                    format!(
                        "Policy for role {} targets unknown resource type {}",
                        builder.role(),
                        resource_type
                    ),
                )
            })?;

            let parent = match builder.parent() {
                Some(parent) => Some(bases.get(parent).ok_or_else(|| unknown_parent(builder.role(), parent))?),
                None => bases.get(builder.role()),
            };

            let key = (builder.role().clone(), resource_type.clone());
            if policies.contains_key(&key) {
                return Err(KeystoneError::configuration(
                    ErrorCode::ConfigurationError,
                    format!("Policy ({}, {}) is registered twice", key.0, key.1),
                ));
            }

            let policy = builder.build(parent.map(|p| &**p))?;
            validate_against_schema(&policy, schema)?;
            policies.insert(key, Arc::new(policy));
        }

        info!(
            bases = bases.len(),
            policies = policies.len(),
            anonymous_role = %self.anonymous_role,
            "Policy registry built"
        );

        Ok(PolicyRegistry {
            catalog: self.catalog,
            bases,
            policies,
            anonymous_role: self.anonymous_role,
        })
    }
}

fn unknown_parent(role: &RoleId, parent: &RoleId) -> KeystoneError {
    KeystoneError::configuration(
        ErrorCode::UnknownParentPolicy,
        format!("Policy for role {} inherits unknown base policy {}", role, parent),
    )
}

/// Build base policies parents-first.
fn build_bases(builders: Vec<PolicyBuilder>) -> Result<BTreeMap<RoleId, Arc<Policy>>> {
    let mut graph: DiGraph<RoleId, ()> = DiGraph::new();
    let mut index: HashMap<RoleId, NodeIndex> = HashMap::new();
    let mut pending: HashMap<RoleId, PolicyBuilder> = HashMap::new();

    for builder in builders {
        let role = builder.role().clone();
        if pending.contains_key(&role) {
            return Err(KeystoneError::configuration(
                ErrorCode::ConfigurationError,
                format!("Base policy {} is registered twice", role),
            ));
        }
        index.insert(role.clone(), graph.add_node(role.clone()));
        pending.insert(role, builder);
    }

    for (role, builder) in &pending {
        if let Some(parent) = builder.parent() {
            let from = index.get(parent).ok_or_else(|| unknown_parent(role, parent))?;
            graph.add_edge(*from, index[role], ());
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        KeystoneError::configuration(
            ErrorCode::PolicyCycle,
            format!("Base policy inheritance cycle involving {}", graph[cycle.node_id()]),
        )
    })?;

    let mut built: BTreeMap<RoleId, Arc<Policy>> = BTreeMap::new();
    for node in order {
        let role = &graph[node];
        if let Some(builder) = pending.remove(role) {
            let parent = builder.parent().and_then(|p| built.get(p)).cloned();
            let policy = builder.build(parent.as_deref())?;
            built.insert(role.clone(), Arc::new(policy));
        }
    }
    Ok(built)
}

/// Every attribute and field a resource policy names must exist.
fn validate_against_schema(policy: &Policy, schema: &ResourceSchema) -> Result<()> {
    for (action, rule) in policy.overrides() {
        if let Some(name) = rule.names().iter().find(|n| !schema.has_attribute(n)) {
            return Err(KeystoneError::configuration(
                ErrorCode::UnknownAttribute,
                format!(
                    "Policy ({}, {}) overrides {} with unknown attribute {}",
                    policy.role(),
                    schema.name,
                    action,
                    name
                ),
            ));
        }
    }

    for rule in policy.scope().rules() {
        for field in rule.referenced_fields() {
            if field != "id" && !schema.has_attribute(field) {
                return Err(KeystoneError::configuration(
                    ErrorCode::UnknownAttribute,
                    format!(
                        "Scope {} of policy ({}, {}) reads unknown attribute {}",
                        rule,
                        policy.role(),
                        schema.name,
                        field
                    ),
                ));
            }
        }
    }

    for (verb, condition) in policy.conditions() {
        if let Some(field) = condition.field() {
            if field != "id" && !schema.has_attribute(field) {
                return Err(KeystoneError::configuration(
                    ErrorCode::UnknownAttribute,
                    format!(
                        "Condition on {} of policy ({}, {}) reads unknown attribute {}",
                        verb,
                        policy.role(),
                        schema.name,
                        field
                    ),
                ));
            }
        }
    }

    Ok(())
}
