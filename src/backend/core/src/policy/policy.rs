//! Policy descriptors and the overlay builder.
//!
//! A [`Policy`] answers, for one role and one resource type: which verbs are
//! permitted, which records are visible, which attributes each action may
//! touch, and which record conditions gate individual verbs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use super::models::{Action, CapabilitySet, Principal, ResourceType, RoleId, Verb};
use crate::error::{ErrorCode, KeystoneError, Result};
use crate::schema::Record;
use crate::scope::{Scope, ScopeCondition, ScopeRule};

// ═══════════════════════════════════════════════════════════════════════════════
// Attribute Overrides
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-action narrowing of the schema-derived attribute surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "attributes", rename_all = "snake_case")]
pub enum AttributeOverride {
    /// Only these attributes (still bounded by the schema).
    Allow(BTreeSet<String>),
    /// Everything the schema permits except these.
    Deny(BTreeSet<String>),
}

impl AttributeOverride {
    pub fn admits(&self, name: &str) -> bool {
        match self {
            Self::Allow(names) => names.contains(name),
            Self::Deny(names) => !names.contains(name),
        }
    }

    pub fn names(&self) -> &BTreeSet<String> {
        match self {
            Self::Allow(names) | Self::Deny(names) => names,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Record Conditions
// ═══════════════════════════════════════════════════════════════════════════════

/// A record-level predicate evaluated after the record is known to be in
/// scope. `Err` carries the denial reason surfaced to the caller.
pub trait RecordCondition: Send + Sync {
    fn check(&self, principal: Option<&Principal>, record: &Record) -> std::result::Result<(), String>;
}

impl<F> RecordCondition for F
where
    F: Fn(Option<&Principal>, &Record) -> std::result::Result<(), String> + Send + Sync,
{
    fn check(&self, principal: Option<&Principal>, record: &Record) -> std::result::Result<(), String> {
        self(principal, record)
    }
}

/// Condition attached to a verb.
#[derive(Clone)]
pub enum Condition {
    /// The record attribute must equal `value`.
    AttributeEquals {
        field: String,
        value: Value,
        reason: String,
    },
    Custom {
        name: String,
        check: Arc<dyn RecordCondition>,
    },
}

impl Condition {
    pub fn attribute_equals(
        field: impl Into<String>,
        value: impl Into<Value>,
        reason: impl Into<String>,
    ) -> Self {
        Self::AttributeEquals {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    pub fn custom<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(Option<&Principal>, &Record) -> std::result::Result<(), String>
            + Send
            + Sync
            + 'static,
    {
        Self::Custom {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// The record attribute a declarative condition reads.
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::AttributeEquals { field, .. } => Some(field),
            Self::Custom { .. } => None,
        }
    }

    pub fn evaluate(
        &self,
        principal: Option<&Principal>,
        record: &Record,
    ) -> std::result::Result<(), String> {
        match self {
            Self::AttributeEquals {
                field,
                value,
                reason,
            } => {
                if record.get(field).as_ref() == Some(value) {
                    Ok(())
                } else {
                    Err(reason.clone())
                }
            }
            Self::Custom { check, .. } => check.check(principal, record),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AttributeEquals { field, value, .. } => f
                .debug_struct("AttributeEquals")
                .field("field", field)
                .field("value", value)
                .finish(),
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// An immutable, fully-resolved policy descriptor.
///
/// Every field is settled at build time: values left unset on the builder
/// were copied from the parent.
#[derive(Debug, Clone)]
pub struct Policy {
    role: RoleId,
    resource_type: Option<ResourceType>,
    parent: Option<RoleId>,
    capabilities: CapabilitySet,
    scope: Scope,
    overrides: BTreeMap<Action, AttributeOverride>,
    conditions: BTreeMap<Verb, Condition>,
}

impl Policy {
    /// The fail-closed policy: no verbs, empty scope.
    pub fn deny_all(role: RoleId, resource_type: ResourceType) -> Self {
        Self {
            role,
            resource_type: Some(resource_type),
            parent: None,
            capabilities: CapabilitySet::empty(),
            scope: Scope::nothing(),
            overrides: BTreeMap::new(),
            conditions: BTreeMap::new(),
        }
    }

    pub fn role(&self) -> &RoleId {
        &self.role
    }

    /// `None` for role-level base policies.
    pub fn resource_type(&self) -> Option<&ResourceType> {
        self.resource_type.as_ref()
    }

    pub fn parent(&self) -> Option<&RoleId> {
        self.parent.as_ref()
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn permits(&self, verb: &Verb) -> bool {
        self.capabilities.contains(verb)
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn override_for(&self, action: Action) -> Option<&AttributeOverride> {
        self.overrides.get(&action)
    }

    pub fn overrides(&self) -> &BTreeMap<Action, AttributeOverride> {
        &self.overrides
    }

    pub fn condition_for(&self, verb: &Verb) -> Option<&Condition> {
        self.conditions.get(verb)
    }

    pub fn conditions(&self) -> &BTreeMap<Verb, Condition> {
        &self.conditions
    }

    pub fn is_deny_all(&self) -> bool {
        self.capabilities.is_empty()
            && self
                .scope
                .conditions()
                .iter()
                .all(|c| matches!(c, ScopeCondition::Rule(ScopeRule::None)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Builder
// ═══════════════════════════════════════════════════════════════════════════════

/// Builds a [`Policy`] by overlaying explicitly set fields onto a parent.
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    role: RoleId,
    resource_type: Option<ResourceType>,
    parent: Option<RoleId>,
    capabilities: Option<CapabilitySet>,
    scope: Option<Scope>,
    allow: BTreeMap<Action, BTreeSet<String>>,
    deny: BTreeMap<Action, BTreeSet<String>>,
    conditions: BTreeMap<Verb, Condition>,
}

impl PolicyBuilder {
    fn empty(role: RoleId, resource_type: Option<ResourceType>) -> Self {
        Self {
            role,
            resource_type,
            parent: None,
            capabilities: None,
            scope: None,
            allow: BTreeMap::new(),
            deny: BTreeMap::new(),
            conditions: BTreeMap::new(),
        }
    }

    /// A role-level base policy, used as the role's default for every
    /// resource type without a specific policy.
    pub fn base(role: impl Into<RoleId>) -> Self {
        Self::empty(role.into(), None)
    }

    /// A policy for one (role, resource type) pair.
    pub fn resource(role: impl Into<RoleId>, resource_type: impl Into<ResourceType>) -> Self {
        Self::empty(role.into(), Some(resource_type.into()))
    }

    /// Inherit unset fields from the named base policy.
    pub fn inherits(mut self, parent: impl Into<RoleId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    /// Add one verb. Starts from an empty set, not the parent's.
    pub fn grant(mut self, verb: Verb) -> Self {
        self.capabilities.get_or_insert_with(CapabilitySet::empty).grant(verb);
        self
    }

    pub fn scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn scope_rule(self, rule: ScopeRule) -> Self {
        self.scope(Scope::rule(rule))
    }

    pub fn allow<I, S>(mut self, action: Action, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allow
            .entry(action)
            .or_default()
            .extend(attributes.into_iter().map(Into::into));
        self
    }

    pub fn deny<I, S>(mut self, action: Action, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deny
            .entry(action)
            .or_default()
            .extend(attributes.into_iter().map(Into::into));
        self
    }

    pub fn condition(mut self, verb: Verb, condition: Condition) -> Self {
        self.conditions.insert(verb, condition);
        self
    }

    pub fn role(&self) -> &RoleId {
        &self.role
    }

    pub fn resource_type(&self) -> Option<&ResourceType> {
        self.resource_type.as_ref()
    }

    pub fn parent(&self) -> Option<&RoleId> {
        self.parent.as_ref()
    }

    fn describe(&self) -> String {
        match &self.resource_type {
            Some(rt) => format!("({}, {})", self.role, rt),
            None => format!("base {}", self.role),
        }
    }

    /// Settle every field, inheriting unset ones from `parent`.
    pub fn build(self, parent: Option<&Policy>) -> Result<Policy> {
        for action in self.allow.keys() {
            if self.deny.contains_key(action) {
                return Err(KeystoneError::configuration(
                    ErrorCode::ConflictingAttributeOverride,
                    format!(
                        "Policy {} declares both an allow-list and a deny-list for {}",
                        self.describe(),
                        action
                    ),
                )
                .with_context("action", action));
            }
        }

        let scope = match (self.scope.clone(), parent) {
            (Some(scope), _) => scope,
            (None, Some(parent)) => parent.scope.clone(),
            (None, None) => {
                return Err(KeystoneError::configuration(
                    ErrorCode::MissingScope,
                    format!("Policy {} has no scope", self.describe()),
                ));
            }
        };

        let capabilities = self
            .capabilities
            .or_else(|| parent.map(|p| p.capabilities.clone()))
            .unwrap_or_default();

        let mut overrides = parent.map(|p| p.overrides.clone()).unwrap_or_default();
        for (action, names) in self.allow {
            overrides.insert(action, AttributeOverride::Allow(names));
        }
        for (action, names) in self.deny {
            overrides.insert(action, AttributeOverride::Deny(names));
        }

        let mut conditions = parent.map(|p| p.conditions.clone()).unwrap_or_default();
        conditions.extend(self.conditions);

        Ok(Policy {
            role: self.role,
            resource_type: self.resource_type,
            parent: self.parent,
            capabilities,
            scope,
            overrides,
            conditions,
        })
    }
}
