//! Integration tests for policy resolution, scoping, gating and surfaces.
//!
//! Tests cover:
//! - Fallback resolution (exact, role default, deny-all)
//! - Join-table scoping
//! - Indistinguishable out-of-scope and missing records
//! - Record conditions
//! - Multi-role principals
//! - Attribute surfaces and payload filtering
//! - Registration-time configuration errors

use keystone_core::prelude::*;
use serde_json::json;
use std::sync::Arc;

// ============================================================================
// Fixtures
// ============================================================================

fn catalog() -> Arc<SchemaCatalog> {
    let widget = ResourceSchema::new("widget")
        .attribute(AttributeDef::new("title", AttributeType::String))
        .attribute(AttributeDef::new("status", AttributeType::String))
        .attribute(AttributeDef::new("owner_id", AttributeType::Reference).immutable())
        .attribute(AttributeDef::new("created_at", AttributeType::Timestamp).read_only())
        .attribute(AttributeDef::new("secret", AttributeType::String).hidden())
        .parent(ParentRef::new("owner", "owner_id", "principal"));

    let project = ResourceSchema::new("project")
        .attribute(AttributeDef::new("name", AttributeType::String))
        .attribute(AttributeDef::new("budget", AttributeType::Float));

    Arc::new(SchemaCatalog::from_schemas([widget, project]).unwrap())
}

fn registry() -> Arc<PolicyRegistry> {
    let registry = PolicyRegistry::builder(catalog())
        .with_predefined_roles()
        .register(
            PolicyBuilder::resource("member", "widget")
                .deny(Action::Update, ["status"])
                .condition(
                    Verb::Destroy,
                    Condition::attribute_equals("status", "draft", "only drafts can be deleted"),
                )
                .grant(Verb::List)
                .grant(Verb::Show)
                .grant(Verb::Update)
                .grant(Verb::Destroy),
        )
        .register(
            PolicyBuilder::resource("member", "project")
                .capabilities(CapabilitySet::read_only())
                .scope_rule(ScopeRule::Joined {
                    field: "id".to_string(),
                    relation: "memberships".to_string(),
                    select: "project_id".to_string(),
                    column: "user_id".to_string(),
                })
                .deny(Action::Read, ["budget"]),
        )
        .build()
        .unwrap();
    Arc::new(registry)
}

fn gate(registry: &PolicyRegistry) -> (CapabilityGate, Arc<MemoryAuditSink>) {
    let sink = Arc::new(MemoryAuditSink::new());
    (CapabilityGate::new(registry.catalog().clone(), sink.clone()), sink)
}

fn alice() -> Principal {
    Principal::new("alice").with_role("member")
}

fn widget() -> ResourceType {
    ResourceType::new("widget")
}

// ============================================================================
// Resolution
// ============================================================================

#[test]
fn test_resolution_fallback_chain() {
    let registry = registry();

    let exact = registry.resolve(&RoleId::new("member"), &widget());
    assert_eq!(exact.resolution, Resolution::Exact);

    let default = registry.resolve(&RoleId::new("viewer"), &widget());
    assert_eq!(default.resolution, Resolution::RoleDefault);
    assert!(default.permits(&Verb::Show));

    let unknown_role = registry.resolve(&RoleId::new("contractor"), &widget());
    assert_eq!(unknown_role.resolution, Resolution::DenyAll);
    assert!(Verb::crud().iter().all(|v| !unknown_role.permits(v)));

    let unknown_type = registry.resolve(&RoleId::new("admin"), &ResourceType::new("gadget"));
    assert_eq!(unknown_type.resolution, Resolution::DenyAll);
}

#[test]
fn test_resource_policy_inherits_role_base() {
    let registry = registry();
    let member = registry.resolve(&RoleId::new("member"), &widget());
    // Scope comes from the member template.
    assert_eq!(member.policy.scope().to_string(), "owned");
    assert!(!member.permits(&Verb::Create));
}

// ============================================================================
// Scoping
// ============================================================================

#[test]
fn test_join_table_membership_scope() {
    let registry = registry();
    let resolver = ScopeResolver::new(registry.clone());
    let project = ResourceType::new("project");

    let data = Dataset::new()
        .with_record(Record::new("project", "p1").with("name", "Apollo"))
        .with_record(Record::new("project", "p2").with("name", "Gemini"))
        .with_record(Record::new("project", "p3").with("name", "Mercury"))
        .with_row("memberships", [("user_id", json!("alice")), ("project_id", json!("p1"))])
        .with_row("memberships", [("user_id", json!("alice")), ("project_id", json!("p3"))])
        .with_row("memberships", [("user_id", json!("bob")), ("project_id", json!("p2"))]);

    let filter = resolver.scope(Some(&alice()), &project);
    assert_eq!(data.select_ids(&project, &filter), vec!["p1", "p3"]);

    let (gate, _) = gate(&registry);
    let effective = registry.resolve_principal(Some(&alice()), &project);
    let p2 = data.find(&project, "p2").unwrap();
    let err = gate
        .check(&effective, &Verb::Show, RecordTarget::Found(p2), &data)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RecordNotFound);
}

#[test]
fn test_anonymous_scope_is_empty() {
    let registry = registry();
    let resolver = ScopeResolver::new(registry);
    assert!(resolver.scope(None, &widget()).is_nothing());
}

#[test]
fn test_principal_without_roles_gets_nothing() {
    let registry = registry();
    let resolver = ScopeResolver::new(registry.clone());
    let nobody = Principal::new("nobody");

    assert!(resolver.scope(Some(&nobody), &widget()).is_nothing());
    assert!(registry.resolve_principal(Some(&nobody), &widget()).grants.is_empty());
}

// ============================================================================
// Gate
// ============================================================================

#[test]
fn test_out_of_scope_matches_missing() {
    let registry = registry();
    let (gate, sink) = gate(&registry);
    let effective = registry.resolve_principal(Some(&alice()), &widget());

    let foreign = Record::new("widget", "w9").with("owner_id", "bob");
    let out_of_scope = gate
        .check(&effective, &Verb::Show, RecordTarget::Found(&foreign), &NoRelations)
        .unwrap_err();
    let missing = gate
        .check(&effective, &Verb::Show, RecordTarget::Missing("w9"), &NoRelations)
        .unwrap_err();

    assert_eq!(out_of_scope.code(), missing.code());
    assert_eq!(out_of_scope.user_message(), missing.user_message());
    assert_eq!(out_of_scope.http_status(), 404);

    let records = sink.records();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.decision == Decision::Deny));
    assert_eq!(records[0].resource_id.as_deref(), Some("w9"));
}

#[test]
fn test_condition_failure_is_forbidden() {
    let registry = registry();
    let (gate, _) = gate(&registry);
    let effective = registry.resolve_principal(Some(&alice()), &widget());

    let published = Record::new("widget", "w1")
        .with("owner_id", "alice")
        .with("status", "published");
    let err = gate
        .check(&effective, &Verb::Destroy, RecordTarget::Found(&published), &NoRelations)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Forbidden);

    let draft = Record::new("widget", "w2").with("owner_id", "alice").with("status", "draft");
    assert!(gate
        .check(&effective, &Verb::Destroy, RecordTarget::Found(&draft), &NoRelations)
        .is_ok());
}

#[test]
fn test_collection_verb_checks_capability_only() {
    let registry = registry();
    let (gate, sink) = gate(&registry);
    let effective = registry.resolve_principal(Some(&alice()), &widget());

    assert!(gate
        .check(&effective, &Verb::List, RecordTarget::Collection, &NoRelations)
        .is_ok());
    let err = gate
        .check(&effective, &Verb::Create, RecordTarget::Collection, &NoRelations)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuthorizationDenied);

    let last = sink.last().unwrap();
    assert_eq!(last.action, Verb::Create);
    assert_eq!(last.decision, Decision::Deny);
    assert_eq!(last.actor.as_ref().map(|a| a.as_str()), Some("alice"));
}

#[test]
fn test_multi_role_union() {
    let registry = registry();
    let (gate, _) = gate(&registry);
    let principal = Principal::new("alice").with_role("member").with_role("viewer");
    let effective = registry.resolve_principal(Some(&principal), &widget());

    let foreign = Record::new("widget", "w9").with("owner_id", "bob").with("status", "draft");

    // Viewer sees everything, so show succeeds through viewer.
    let grant = gate
        .check(&effective, &Verb::Show, RecordTarget::Found(&foreign), &NoRelations)
        .unwrap();
    assert_eq!(grant.role.as_str(), "viewer");

    // Update is only granted by member, whose scope excludes the record.
    let err = gate
        .check(&effective, &Verb::Update, RecordTarget::Found(&foreign), &NoRelations)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::RecordNotFound);

    let resolver = ScopeResolver::new(registry.clone());
    assert!(resolver.scope(Some(&principal), &widget()).is_all());
    assert!(!resolver
        .scope_for(Some(&principal), &widget(), &Verb::Update)
        .is_all());
}

// ============================================================================
// Attribute Surfaces
// ============================================================================

#[test]
fn test_update_surface_excludes_immutable_and_denied() {
    let registry = registry();
    let schema = registry.schema(&widget()).unwrap();
    let member = registry.resolve(&RoleId::new("member"), &widget());

    let update = AttributeSurface::compute(schema, &member.policy, Action::Update);
    assert_eq!(update.attributes(), &["title".to_string()]);

    let read = AttributeSurface::compute(schema, &member.policy, Action::Read);
    assert!(read.permits("created_at"));
    assert!(!read.permits("secret"));
}

#[test]
fn test_hidden_attribute_wins_over_allow_list() {
    let registry = PolicyRegistry::builder(catalog())
        .register(
            PolicyBuilder::resource("auditor", "widget")
                .capabilities(CapabilitySet::read_only())
                .scope(Scope::all())
                .allow(Action::Read, ["title", "secret"]),
        )
        .build()
        .unwrap();
    let schema = registry.schema(&widget()).unwrap();
    let auditor = registry.resolve(&RoleId::new("auditor"), &widget());

    let read = AttributeSurface::compute(schema, &auditor.policy, Action::Read);
    assert_eq!(read.attributes(), &["title".to_string()]);
}

#[test]
fn test_payload_rejection_lists_offenders() {
    let registry = registry();
    let schema = registry.schema(&widget()).unwrap();
    let member = registry.resolve(&RoleId::new("member"), &widget());
    let update = AttributeSurface::compute(schema, &member.policy, Action::Update);

    let payload = json!({"title": "t", "status": "x", "owner_id": "bob"});
    let err = update
        .filter_payload(payload.as_object().unwrap(), PayloadMode::Reject)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnpermittedAttributes);
    assert_eq!(err.details().attributes, vec!["owner_id", "status"]);

    let stripped = update
        .filter_payload(payload.as_object().unwrap(), PayloadMode::Strip)
        .unwrap();
    assert_eq!(stripped.len(), 1);
}

#[test]
fn test_describe_contract() {
    let registry = registry();
    let description = describe_resource(&registry, &widget(), &RoleId::new("member")).unwrap();
    assert_eq!(description.resolution, Resolution::Exact);
    assert!(description.attributes.iter().all(|a| a.name != "secret"));

    let owner = description
        .attributes
        .iter()
        .find(|a| a.name == "owner_id")
        .unwrap();
    assert!(owner.readable);
    assert!(!owner.creatable);
    assert!(!owner.updatable);
}

// ============================================================================
// Configuration Errors
// ============================================================================

#[test]
fn test_allow_and_deny_on_same_action() {
    let err = PolicyRegistry::builder(catalog())
        .register(
            PolicyBuilder::resource("editor", "widget")
                .scope(Scope::all())
                .allow(Action::Update, ["title"])
                .deny(Action::Update, ["status"]),
        )
        .build()
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConflictingAttributeOverride);
    assert!(err.code().is_configuration());
}

#[test]
fn test_unknown_override_attribute() {
    let err = PolicyRegistry::builder(catalog())
        .register(
            PolicyBuilder::resource("editor", "widget")
                .scope(Scope::all())
                .deny(Action::Read, ["colour"]),
        )
        .build()
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::UnknownAttribute);
}

#[test]
fn test_missing_scope() {
    let err = PolicyRegistry::builder(catalog())
        .register(PolicyBuilder::resource("editor", "widget").capabilities(CapabilitySet::full()))
        .build()
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::MissingScope);
}

#[test]
fn test_inheritance_cycle() {
    let err = PolicyRegistry::builder(catalog())
        .register(PolicyBuilder::base("a").inherits("b").scope(Scope::all()))
        .register(PolicyBuilder::base("b").inherits("a").scope(Scope::all()))
        .build()
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PolicyCycle);
}
