//! Turns resolved policies into filter descriptions.

use std::sync::Arc;
use tracing::debug;

use super::filter::Filter;
use super::rule::ScopeContext;
use crate::policy::models::{Principal, ResourceType, Verb};
use crate::policy::registry::{EffectivePolicy, PolicyRegistry};

/// Computes the records a principal may address.
#[derive(Debug, Clone)]
pub struct ScopeResolver {
    registry: Arc<PolicyRegistry>,
}

impl ScopeResolver {
    pub fn new(registry: Arc<PolicyRegistry>) -> Self {
        Self { registry }
    }

    /// Every record the principal can see: the union of the scopes of the
    /// roles that grant `list` or `show`.
    pub fn scope(&self, principal: Option<&Principal>, resource_type: &ResourceType) -> Filter {
        let effective = self.registry.resolve_principal(principal, resource_type);
        self.filter_for(&effective, None)
    }

    /// Records addressable with one verb: the union of the scopes of the
    /// roles that grant it.
    pub fn scope_for(
        &self,
        principal: Option<&Principal>,
        resource_type: &ResourceType,
        verb: &Verb,
    ) -> Filter {
        let effective = self.registry.resolve_principal(principal, resource_type);
        self.filter_for(&effective, Some(verb))
    }

    /// Filter for an already-resolved effective policy.
    pub fn filter_for(&self, effective: &EffectivePolicy, verb: Option<&Verb>) -> Filter {
        let schema = match self.registry.catalog().get(&effective.resource_type) {
            Some(schema) => schema,
            None => return Filter::Nothing,
        };
        let ctx = ScopeContext::new(effective.actor.as_ref(), schema);

        let filter = Filter::any(
            effective
                .grants
                .iter()
                .filter(|g| match verb {
                    Some(verb) => g.permits(verb),
                    None => g.permits(&Verb::List) || g.permits(&Verb::Show),
                })
                .map(|g| g.policy.scope().filter(&ctx)),
        );

        debug!(
            resource_type = %effective.resource_type,
            verb = verb.map(|v| v.as_str()).unwrap_or("*"),
            filter = ?filter,
            "Resolved scope"
        );
        filter
    }
}
