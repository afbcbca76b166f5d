//! The capability gate.
//!
//! Decides whether a verb may be performed, and writes an audit record for
//! every decision before returning it.

use std::sync::Arc;
use tracing::debug;

use super::audit::{AuditRecord, AuditSink, Decision};
use crate::error::{ErrorCode, KeystoneError, Result};
use crate::policy::models::{Principal, RoleId, Verb};
use crate::policy::registry::{EffectivePolicy, ResolvedPolicy};
use crate::schema::{Record, SchemaCatalog};
use crate::scope::{RelationSource, ScopeContext};
use crate::telemetry::metrics;

/// What the gate is asked about.
#[derive(Debug, Clone, Copy)]
pub enum RecordTarget<'a> {
    /// A collection-level action (list, create).
    Collection,
    /// A record id the storage layer could not find.
    Missing(&'a str),
    Found(&'a Record),
    /// A record handed over for a different requested id.
    Mismatched {
        requested: &'a str,
        record: &'a Record,
    },
}

impl<'a> RecordTarget<'a> {
    pub fn id(&self) -> Option<&'a str> {
        match *self {
            Self::Collection => None,
            Self::Missing(id) => Some(id),
            Self::Found(record) => Some(record.id.as_str()),
            Self::Mismatched { requested, .. } => Some(requested),
        }
    }
}

/// A successful gate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// The first role, in sorted order, whose policy admitted the action.
    pub role: RoleId,
    pub verb: Verb,
}

/// Internal outcome before it is audited.
enum Outcome {
    Allow(RoleId),
    Deny { error: KeystoneError, reason: String },
}

fn deny(error: KeystoneError, reason: impl Into<String>) -> Outcome {
    Outcome::Deny {
        error,
        reason: reason.into(),
    }
}

/// Authorizes single actions against resolved policies.
#[derive(Clone)]
pub struct CapabilityGate {
    catalog: Arc<SchemaCatalog>,
    sink: Arc<dyn AuditSink>,
}

impl CapabilityGate {
    pub fn new(catalog: Arc<SchemaCatalog>, sink: Arc<dyn AuditSink>) -> Self {
        Self { catalog, sink }
    }

    /// Check a verb against every role of the principal.
    ///
    /// Collection-level verbs only need capability membership. Record-level
    /// verbs also need the record to be inside the scope of a role that grants
    /// the verb. Out-of-scope records, missing records and ungranted
    /// record-level verbs all produce the same `RecordNotFound` error. A
    /// record condition that fails on an in-scope record produces
    /// `Forbidden`.
    pub fn check(
        &self,
        effective: &EffectivePolicy,
        verb: &Verb,
        target: RecordTarget<'_>,
        relations: &dyn RelationSource,
    ) -> Result<Grant> {
        let outcome = self.evaluate(effective, verb, target, relations);

        let actor = effective.actor.as_ref().map(|p| p.id().clone());
        let resource_id = target.id().map(str::to_string);
        let rt = effective.resource_type.clone();

        match outcome {
            Outcome::Allow(role) => {
                self.sink.record(&AuditRecord::new(
                    actor,
                    verb.clone(),
                    rt,
                    resource_id,
                    Decision::Allow,
                ));
                metrics::record_decision(effective.resource_type.as_str(), verb.as_str(), "allow");
                debug!(role = %role, verb = %verb, resource_type = %effective.resource_type, "Gate allowed");
                Ok(Grant {
                    role,
                    verb: verb.clone(),
                })
            }
            Outcome::Deny { error, reason } => {
                self.sink.record(
                    &AuditRecord::new(actor, verb.clone(), rt, resource_id, Decision::Deny)
                        .with_reason(reason),
                );
                metrics::record_decision(effective.resource_type.as_str(), verb.as_str(), "deny");
                Err(error)
            }
        }
    }

    /// Check one resolved policy, as if the principal held a single role.
    pub fn check_policy(
        &self,
        resolved: &ResolvedPolicy,
        principal: Option<&Principal>,
        verb: &Verb,
        target: RecordTarget<'_>,
        relations: &dyn RelationSource,
    ) -> Result<Grant> {
        let effective = EffectivePolicy {
            actor: principal.cloned(),
            resource_type: resolved.resource_type.clone(),
            grants: vec![resolved.clone()],
        };
        self.check(&effective, verb, target, relations)
    }

    fn evaluate(
        &self,
        effective: &EffectivePolicy,
        verb: &Verb,
        target: RecordTarget<'_>,
        relations: &dyn RelationSource,
    ) -> Outcome {
        let rt = effective.resource_type.as_str();

        if verb.is_collection() {
            return match effective.granting(verb).next() {
                Some(grant) => Outcome::Allow(grant.role.clone()),
                None => deny(KeystoneError::denied(rt, verb.as_str()), "verb not granted"),
            };
        }

        let record = match target {
            RecordTarget::Collection => {
                return deny(
                    KeystoneError::new(
                        ErrorCode::InvalidInput,
                        format!("{} on {} requires a record id", verb, rt),
                    ),
                    "record-level verb without a record",
                );
            }
            RecordTarget::Missing(id) => {
                return deny(KeystoneError::not_found(rt, id), "record does not exist");
            }
            RecordTarget::Mismatched { requested, record } => {
                return deny(
                    KeystoneError::new(
                        ErrorCode::InvalidInput,
                        format!("Record {} does not match requested id {}", record.id, requested),
                    ),
                    "record id mismatch",
                );
            }
            RecordTarget::Found(record) => record,
        };

        if record.resource_type != effective.resource_type {
            return deny(
                KeystoneError::new(
                    ErrorCode::InvalidInput,
                    format!("Record {} is a {}, not a {}", record.id, record.resource_type, rt),
                ),
                "resource type mismatch",
            );
        }

        let not_found = || KeystoneError::not_found(rt, record.id.as_str());

        if !effective.permits(verb) {
            return deny(not_found(), "verb not granted");
        }

        let schema = match self.catalog.get(&effective.resource_type) {
            Some(schema) => schema,
            None => return deny(not_found(), "unknown resource type"),
        };
        let ctx = ScopeContext::new(effective.actor.as_ref(), schema);

        let mut condition_failure: Option<String> = None;
        for grant in effective.granting(verb) {
            if !grant.policy.scope().filter(&ctx).matches(record, relations) {
                continue;
            }
            match grant.policy.condition_for(verb) {
                None => return Outcome::Allow(grant.role.clone()),
                Some(condition) => match condition.evaluate(effective.actor.as_ref(), record) {
                    Ok(()) => return Outcome::Allow(grant.role.clone()),
                    Err(reason) => {
                        condition_failure.get_or_insert(reason);
                    }
                },
            }
        }

        match condition_failure {
            Some(reason) => deny(KeystoneError::forbidden(reason.clone()), reason),
            None => deny(not_found(), "outside scope"),
        }
    }
}

impl std::fmt::Debug for CapabilityGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityGate")
            .field("resource_types", &self.catalog.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::audit::MemoryAuditSink;
    use crate::policy::{Condition, PolicyBuilder, PolicyRegistry, ResourceType};
    use crate::schema::{AttributeDef, AttributeType, ParentRef, ResourceSchema};
    use crate::scope::{NoRelations, Scope};

    struct Fixture {
        registry: PolicyRegistry,
        gate: CapabilityGate,
        sink: Arc<MemoryAuditSink>,
    }

    fn fixture() -> Fixture {
        let widget = ResourceSchema::new("widget")
            .attribute(AttributeDef::new("owner_id", AttributeType::Reference))
            .attribute(AttributeDef::new("active", AttributeType::Boolean))
            .parent(ParentRef::new("owner", "owner_id", "principal"));
        let catalog = Arc::new(SchemaCatalog::from_schemas([widget]).unwrap());
        let registry = PolicyRegistry::builder(catalog.clone())
            .with_predefined_roles()
            .register(
                PolicyBuilder::resource("member", "widget").condition(
                    Verb::Update,
                    Condition::attribute_equals("active", true, "widget is archived"),
                ),
            )
            .register(
                PolicyBuilder::resource("curator", "widget")
                    .grant(Verb::Update)
                    .scope(Scope::all()),
            )
            .build()
            .unwrap();
        let sink = Arc::new(MemoryAuditSink::new());
        let gate = CapabilityGate::new(catalog, sink.clone());
        Fixture {
            registry,
            gate,
            sink,
        }
    }

    fn effective(f: &Fixture, principal: Option<&Principal>) -> EffectivePolicy {
        f.registry
            .resolve_principal(principal, &ResourceType::new("widget"))
    }

    fn widget(id: &str, owner: &str, active: bool) -> Record {
        Record::new("widget", id)
            .with("owner_id", owner)
            .with("active", active)
    }

    #[test]
    fn test_collection_verb_checks_capability_only() {
        let f = fixture();
        let alice = Principal::new("alice").with_role("viewer");
        let e = effective(&f, Some(&alice));

        let grant = f
            .gate
            .check(&e, &Verb::List, RecordTarget::Collection, &NoRelations)
            .unwrap();
        assert_eq!(grant.role.as_str(), "viewer");

        let err = f
            .gate
            .check(&e, &Verb::Create, RecordTarget::Collection, &NoRelations)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthorizationDenied);
    }

    #[test]
    fn test_out_of_scope_matches_missing() {
        let f = fixture();
        let alice = Principal::new("alice").with_role("member");
        let e = effective(&f, Some(&alice));
        let bobs = widget("w2", "bob", true);

        for verb in [Verb::Show, Verb::Update, Verb::Destroy] {
            let hidden = f
                .gate
                .check(&e, &verb, RecordTarget::Found(&bobs), &NoRelations)
                .unwrap_err();
            let missing = f
                .gate
                .check(&e, &verb, RecordTarget::Missing("w2"), &NoRelations)
                .unwrap_err();
            assert_eq!(hidden.code(), ErrorCode::RecordNotFound);
            assert_eq!(hidden.code(), missing.code());
            assert_eq!(hidden.user_message(), missing.user_message());
            assert_eq!(hidden.http_status(), missing.http_status());
        }
    }

    #[test]
    fn test_in_scope_allowed() {
        let f = fixture();
        let alice = Principal::new("alice").with_role("member");
        let e = effective(&f, Some(&alice));
        let own = widget("w1", "alice", true);

        assert!(f
            .gate
            .check(&e, &Verb::Show, RecordTarget::Found(&own), &NoRelations)
            .is_ok());
        assert!(f
            .gate
            .check(&e, &Verb::Update, RecordTarget::Found(&own), &NoRelations)
            .is_ok());
    }

    #[test]
    fn test_condition_yields_forbidden() {
        let f = fixture();
        let alice = Principal::new("alice").with_role("member");
        let e = effective(&f, Some(&alice));
        let archived = widget("w1", "alice", false);

        let err = f
            .gate
            .check(&e, &Verb::Update, RecordTarget::Found(&archived), &NoRelations)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Forbidden);
        assert_eq!(err.user_message(), "widget is archived");
    }

    #[test]
    fn test_second_role_can_satisfy() {
        let f = fixture();
        let alice = Principal::new("alice").with_role("member").with_role("curator");
        let e = effective(&f, Some(&alice));
        let archived = widget("w1", "alice", false);

        let grant = f
            .gate
            .check(&e, &Verb::Update, RecordTarget::Found(&archived), &NoRelations)
            .unwrap();
        assert_eq!(grant.role.as_str(), "curator");
    }

    #[test]
    fn test_every_check_is_audited() {
        let f = fixture();
        let alice = Principal::new("alice").with_role("member");
        let e = effective(&f, Some(&alice));
        let own = widget("w1", "alice", true);

        let _ = f.gate.check(&e, &Verb::Show, RecordTarget::Found(&own), &NoRelations);
        let _ = f.gate.check(&e, &Verb::Destroy, RecordTarget::Found(&own), &NoRelations);

        let records = f.sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].decision, Decision::Allow);
        assert_eq!(records[1].decision, Decision::Deny);
        assert_eq!(records[1].reason.as_deref(), Some("verb not granted"));
        assert_eq!(records[1].resource_id.as_deref(), Some("w1"));
        assert_eq!(records[1].actor.as_ref().map(|a| a.as_str()), Some("alice"));
    }

    #[test]
    fn test_unaddressed_record_verbs_are_audited() {
        let f = fixture();
        let alice = Principal::new("alice").with_role("member");
        let e = effective(&f, Some(&alice));
        let own = widget("w1", "alice", true);

        let err = f
            .gate
            .check(&e, &Verb::Show, RecordTarget::Collection, &NoRelations)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);

        let err = f
            .gate
            .check(
                &e,
                &Verb::Show,
                RecordTarget::Mismatched {
                    requested: "w7",
                    record: &own,
                },
                &NoRelations,
            )
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInput);

        let records = f.sink.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.decision == Decision::Deny));
        assert_eq!(records[1].resource_id.as_deref(), Some("w7"));
        assert_eq!(records[1].reason.as_deref(), Some("record id mismatch"));
    }

    #[test]
    fn test_anonymous_denied() {
        let f = fixture();
        let e = effective(&f, None);
        let err = f
            .gate
            .check(&e, &Verb::List, RecordTarget::Collection, &NoRelations)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthorizationDenied);
        assert!(f.sink.last().unwrap().actor.is_none());
    }

    #[test]
    fn test_check_single_policy() {
        let f = fixture();
        let resolved = f
            .registry
            .resolve(&RoleId::new("admin"), &ResourceType::new("widget"));
        let record = widget("w9", "bob", true);
        let grant = f
            .gate
            .check_policy(&resolved, None, &Verb::Destroy, RecordTarget::Found(&record), &NoRelations)
            .unwrap();
        assert_eq!(grant.role.as_str(), "admin");
    }
}
