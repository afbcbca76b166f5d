//! Scope declarations.
//!
//! Every policy carries exactly one [`Scope`]: an intersection of one or more
//! conditions, each of which turns the acting principal into a [`Filter`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::filter::{Filter, JoinRelation};
use crate::policy::models::Principal;
use crate::schema::ResourceSchema;

/// Inputs available to a scope condition.
#[derive(Debug, Clone, Copy)]
pub struct ScopeContext<'a> {
    pub principal: Option<&'a Principal>,
    pub schema: &'a ResourceSchema,
}

impl<'a> ScopeContext<'a> {
    pub fn new(principal: Option<&'a Principal>, schema: &'a ResourceSchema) -> Self {
        Self { principal, schema }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Declarative Rules
// ═══════════════════════════════════════════════════════════════════════════════

fn id_field() -> String {
    "id".to_string()
}

/// A serializable scope condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScopeRule {
    /// The whole collection.
    All,
    /// The empty set.
    None,
    /// Records whose scoping parent is the principal.
    Owned,
    /// Records whose `attribute` names one of the principal's tenants.
    Tenant { attribute: String },
    AttributeEq { field: String, value: Value },
    AttributeIn { field: String, values: Vec<Value> },
    /// Records whose `field` is produced by the join
    /// `SELECT select FROM relation WHERE column = principal.id`.
    Joined {
        #[serde(default = "id_field")]
        field: String,
        relation: String,
        select: String,
        column: String,
    },
}

impl ScopeRule {
    pub fn filter(&self, ctx: &ScopeContext<'_>) -> Filter {
        match self {
            Self::All => Filter::All,
            Self::None => Filter::Nothing,
            Self::Owned => match (ctx.principal, ctx.schema.scoping_ref()) {
                (Some(principal), Some(parent)) => {
                    Filter::eq(parent.attribute.as_str(), principal.id().as_str())
                }
                _ => Filter::Nothing,
            },
            Self::Tenant { attribute } => match ctx.principal {
                Some(principal) => Filter::one_of(
                    attribute.as_str(),
                    principal
                        .tenants()
                        .iter()
                        .map(|t| Value::from(t.as_str()))
                        .collect(),
                ),
                None => Filter::Nothing,
            },
            Self::AttributeEq { field, value } => Filter::eq(field.as_str(), value.clone()),
            Self::AttributeIn { field, values } => Filter::one_of(field.as_str(), values.clone()),
            Self::Joined {
                field,
                relation,
                select,
                column,
            } => match ctx.principal {
                Some(principal) => Filter::in_relation(
                    field.as_str(),
                    JoinRelation {
                        relation: relation.clone(),
                        select: select.clone(),
                        column: column.clone(),
                        value: Value::from(principal.id().as_str()),
                    },
                ),
                None => Filter::Nothing,
            },
        }
    }

    /// Attribute names the rule reads from the resource, for validation.
    pub fn referenced_fields(&self) -> Vec<&str> {
        match self {
            Self::Tenant { attribute } => vec![attribute.as_str()],
            Self::AttributeEq { field, .. }
            | Self::AttributeIn { field, .. }
            | Self::Joined { field, .. } => vec![field.as_str()],
            Self::All | Self::None | Self::Owned => Vec::new(),
        }
    }
}

impl fmt::Display for ScopeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::None => write!(f, "none"),
            Self::Owned => write!(f, "owned"),
            Self::Tenant { attribute } => write!(f, "tenant({})", attribute),
            Self::AttributeEq { field, value } => write!(f, "{} = {}", field, value),
            Self::AttributeIn { field, values } => write!(f, "{} in {:?}", field, values),
            Self::Joined {
                field,
                relation,
                select,
                column,
            } => write!(f, "{} in {}.{} by {}", field, relation, select, column),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Code-defined Conditions
// ═══════════════════════════════════════════════════════════════════════════════

/// A scope condition written in code.
pub trait ScopeFn: Send + Sync {
    fn filter(&self, ctx: &ScopeContext<'_>) -> Filter;
}

impl<F> ScopeFn for F
where
    F: Fn(&ScopeContext<'_>) -> Filter + Send + Sync,
{
    fn filter(&self, ctx: &ScopeContext<'_>) -> Filter {
        self(ctx)
    }
}

#[derive(Clone)]
pub enum ScopeCondition {
    Rule(ScopeRule),
    Custom { name: String, func: Arc<dyn ScopeFn> },
}

impl ScopeCondition {
    fn filter(&self, ctx: &ScopeContext<'_>) -> Filter {
        match self {
            Self::Rule(rule) => rule.filter(ctx),
            Self::Custom { func, .. } => func.filter(ctx),
        }
    }
}

impl fmt::Debug for ScopeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule(rule) => f.debug_tuple("Rule").field(rule).finish(),
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
        }
    }
}

impl fmt::Display for ScopeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rule(rule) => write!(f, "{}", rule),
            Self::Custom { name, .. } => write!(f, "custom({})", name),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scope
// ═══════════════════════════════════════════════════════════════════════════════

/// The visibility function of a policy.
///
/// Always holds at least one condition. Conditions compose by intersection
/// only, so adding one can never widen the visible set.
#[derive(Debug, Clone)]
pub struct Scope {
    conditions: Vec<ScopeCondition>,
}

impl Scope {
    pub fn rule(rule: ScopeRule) -> Self {
        Self {
            conditions: vec![ScopeCondition::Rule(rule)],
        }
    }

    pub fn custom<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&ScopeContext<'_>) -> Filter + Send + Sync + 'static,
    {
        Self {
            conditions: vec![ScopeCondition::Custom {
                name: name.into(),
                func: Arc::new(func),
            }],
        }
    }

    pub fn all() -> Self {
        Self::rule(ScopeRule::All)
    }

    pub fn nothing() -> Self {
        Self::rule(ScopeRule::None)
    }

    pub fn owned() -> Self {
        Self::rule(ScopeRule::Owned)
    }

    /// Intersect with another scope.
    pub fn and(mut self, other: Scope) -> Self {
        self.conditions.extend(other.conditions);
        self
    }

    /// Build a scope from declared rules. `None` when the list is empty.
    pub fn from_rules(rules: impl IntoIterator<Item = ScopeRule>) -> Option<Self> {
        let conditions: Vec<_> = rules.into_iter().map(ScopeCondition::Rule).collect();
        if conditions.is_empty() {
            None
        } else {
            Some(Self { conditions })
        }
    }

    pub fn conditions(&self) -> &[ScopeCondition] {
        &self.conditions
    }

    /// Declarative rules of this scope. Custom conditions are skipped.
    pub fn rules(&self) -> impl Iterator<Item = &ScopeRule> {
        self.conditions.iter().filter_map(|c| match c {
            ScopeCondition::Rule(rule) => Some(rule),
            ScopeCondition::Custom { .. } => None,
        })
    }

    pub fn filter(&self, ctx: &ScopeContext<'_>) -> Filter {
        Filter::all(self.conditions.iter().map(|c| c.filter(ctx)))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.conditions.iter().map(|c| c.to_string()).collect();
        f.write_str(&parts.join(" and "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeDef, AttributeType, ParentRef};

    fn schema() -> ResourceSchema {
        ResourceSchema::new("widget")
            .attribute(AttributeDef::new("owner_id", AttributeType::Reference))
            .attribute(AttributeDef::new("org_id", AttributeType::Reference))
            .parent(ParentRef::new("owner", "owner_id", "principal"))
            .parent(ParentRef::new("org", "org_id", "organization"))
            .scoped_by("owner")
    }

    #[test]
    fn test_owned_uses_scoping_parent() {
        let schema = schema();
        let alice = Principal::new("alice");
        let ctx = ScopeContext::new(Some(&alice), &schema);
        assert_eq!(Scope::owned().filter(&ctx), Filter::eq("owner_id", "alice"));
    }

    #[test]
    fn test_anonymous_owned_is_nothing() {
        let schema = schema();
        let ctx = ScopeContext::new(None, &schema);
        assert!(Scope::owned().filter(&ctx).is_nothing());
    }

    #[test]
    fn test_tenant_rule() {
        let schema = schema();
        let alice = Principal::new("alice").with_tenant("acme");
        let ctx = ScopeContext::new(Some(&alice), &schema);
        let rule = ScopeRule::Tenant {
            attribute: "org_id".to_string(),
        };
        assert_eq!(
            rule.filter(&ctx),
            Filter::one_of("org_id", vec![Value::from("acme")])
        );

        let loner = Principal::new("bob");
        let ctx = ScopeContext::new(Some(&loner), &schema);
        assert!(rule.filter(&ctx).is_nothing());
    }

    #[test]
    fn test_conditions_intersect() {
        let schema = schema();
        let alice = Principal::new("alice");
        let ctx = ScopeContext::new(Some(&alice), &schema);

        let scope = Scope::all().and(Scope::custom("published", |_| Filter::eq("published", true)));
        assert_eq!(scope.filter(&ctx), Filter::eq("published", true));

        let scope = Scope::owned().and(Scope::nothing());
        assert!(scope.filter(&ctx).is_nothing());
    }

    #[test]
    fn test_from_rules_requires_one() {
        assert!(Scope::from_rules(Vec::new()).is_none());
        assert!(Scope::from_rules(vec![ScopeRule::All]).is_some());
    }

    #[test]
    fn test_rule_deserialize() {
        let rule: ScopeRule = serde_json::from_str(
            r#"{"kind": "joined", "relation": "memberships", "select": "team_id", "column": "user_id", "field": "team_id"}"#,
        )
        .unwrap();
        assert_eq!(rule.referenced_fields(), vec!["team_id"]);
        let rule: ScopeRule = serde_json::from_str(r#"{"kind": "owned"}"#).unwrap();
        assert_eq!(rule, ScopeRule::Owned);
    }
}
