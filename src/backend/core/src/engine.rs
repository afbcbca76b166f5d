//! The access engine.
//!
//! Ties the compiled registry to the scope resolver, capability gate,
//! attribute surfaces and notification router behind one request-level
//! entry point.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::config::EngineConfig;
use crate::error::{ErrorCode, ErrorDetails, KeystoneError, Result};
use crate::gate::{AuditSink, CapabilityGate, Grant, RecordTarget};
use crate::manifest::{CompiledManifest, Manifest};
use crate::notify::NotificationRouter;
use crate::policy::{Action, EffectivePolicy, Principal, PolicyRegistry, ResourceType, RoleId, Verb};
use crate::schema::Record;
use crate::scope::{Filter, RelationSource, ScopeContext, ScopeResolver};
use crate::surface::{describe_resource, AttributeSurface, PayloadMode, ResourceDescription};

/// One action a principal is attempting.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub principal: Option<Principal>,
    pub verb: Verb,
    pub resource_type: ResourceType,
    /// Required for record-level verbs.
    pub target_id: Option<String>,
    /// Write payload for create and update.
    pub payload: Option<Map<String, Value>>,
}

impl ActionRequest {
    pub fn new(principal: Option<Principal>, verb: impl Into<Verb>, resource_type: impl Into<ResourceType>) -> Self {
        Self {
            principal,
            verb: verb.into(),
            resource_type: resource_type.into(),
            target_id: None,
            payload: None,
        }
    }

    pub fn with_target(mut self, id: impl Into<String>) -> Self {
        self.target_id = Some(id.into());
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A permitted action.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub grant: Grant,
    /// Records addressable with the verb.
    pub scope: Filter,
    /// Attribute surface of the verb, if it reads or writes attributes.
    ///
    /// For `list` this is the widest column set across the granting roles;
    /// rows are narrowed per record by [`AccessEngine::project_list`].
    pub surface: Option<AttributeSurface>,
    /// The write payload after validation against the surface.
    pub payload: Option<Map<String, Value>>,
}

/// Request-level authorization over a compiled manifest.
#[derive(Clone)]
pub struct AccessEngine {
    registry: Arc<PolicyRegistry>,
    scopes: ScopeResolver,
    gate: CapabilityGate,
    router: NotificationRouter,
    payload_mode: PayloadMode,
}

impl AccessEngine {
    pub fn new(compiled: &CompiledManifest, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            registry: compiled.registry.clone(),
            scopes: ScopeResolver::new(compiled.registry.clone()),
            gate: CapabilityGate::new(compiled.catalog.clone(), sink),
            router: NotificationRouter::new(compiled.bindings.clone()),
            payload_mode: PayloadMode::default(),
        }
    }

    /// Load and compile the configured manifest.
    ///
    /// The configured anonymous role applies unless the manifest names one.
    pub fn from_config(config: &EngineConfig, sink: Arc<dyn AuditSink>) -> Result<Self> {
        let path = config.manifest.as_ref().ok_or_else(|| {
            KeystoneError::configuration(
                ErrorCode::InvalidConfiguration,
                "engine.manifest is not set",
            )
            .with_details(
                ErrorDetails::new().with_suggestion("set KEYSTONE__ENGINE__MANIFEST or [engine] manifest"),
            )
        })?;
        let mut manifest = Manifest::load(path)?;
        manifest
            .anonymous_role
            .get_or_insert_with(|| config.anonymous_role.clone());

        let compiled = manifest.compile()?;
        Ok(Self::new(&compiled, sink).with_payload_mode(config.payload_mode))
    }

    pub fn with_payload_mode(mut self, mode: PayloadMode) -> Self {
        self.payload_mode = mode;
        self
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn scopes(&self) -> &ScopeResolver {
        &self.scopes
    }

    pub fn router(&self) -> &NotificationRouter {
        &self.router
    }

    /// Authorize a request.
    ///
    /// `record` is the stored record named by `target_id`, or `None` if the
    /// storage layer could not find it. Collection verbs ignore it.
    #[instrument(skip_all, fields(verb = %request.verb, resource_type = %request.resource_type))]
    pub fn authorize(
        &self,
        request: &ActionRequest,
        record: Option<&Record>,
        relations: &dyn RelationSource,
    ) -> Result<Authorization> {
        let verb = &request.verb;
        let target = match (verb.is_collection(), request.target_id.as_deref(), record) {
            (true, _, _) | (false, None, _) => RecordTarget::Collection,
            (false, Some(id), Some(record)) if record.id != id => RecordTarget::Mismatched {
                requested: id,
                record,
            },
            (false, Some(_), Some(record)) => RecordTarget::Found(record),
            (false, Some(id), None) => RecordTarget::Missing(id),
        };

        let effective = self
            .registry
            .resolve_principal(request.principal.as_ref(), &request.resource_type);
        let grant = self.gate.check(&effective, verb, target, relations)?;
        let scope = self.scopes.filter_for(&effective, Some(verb));

        let surface = verb
            .surface_action()
            .map(|action| -> Result<AttributeSurface> {
                let schema = self.registry.schema(&request.resource_type)?;
                Ok(if verb.is_collection() {
                    AttributeSurface::union_of(
                        schema,
                        effective.granting(verb).map(|g| g.policy.as_ref()),
                        action,
                    )
                } else {
                    AttributeSurface::union_of(
                        schema,
                        effective
                            .grants
                            .iter()
                            .filter(|g| g.role == grant.role)
                            .map(|g| g.policy.as_ref()),
                        action,
                    )
                })
            })
            .transpose()?;

        let payload = match (&request.payload, &surface) {
            (Some(payload), Some(surface)) if matches!(verb, Verb::Create | Verb::Update) => {
                Some(surface.filter_payload(payload, self.payload_mode)?)
            }
            (Some(_), _) => {
                return Err(KeystoneError::new(
                    ErrorCode::InvalidInput,
                    format!("{} on {} does not take a payload", verb, request.resource_type),
                ));
            }
            (None, _) => None,
        };

        debug!(role = %grant.role, "Request authorized");
        Ok(Authorization {
            grant,
            scope,
            surface,
            payload,
        })
    }

    /// Records the principal can see through any role.
    pub fn scope(&self, principal: Option<&Principal>, resource_type: &ResourceType) -> Filter {
        self.scopes.scope(principal, resource_type)
    }

    /// Remove every attribute the principal cannot read from a shown record.
    ///
    /// Only roles that grant `show` and whose scope contains the record
    /// contribute to the read surface. A record outside every such scope
    /// projects to no attributes.
    pub fn project(
        &self,
        principal: Option<&Principal>,
        record: &Record,
        relations: &dyn RelationSource,
    ) -> Result<Record> {
        let effective = self
            .registry
            .resolve_principal(principal, &record.resource_type);
        self.project_with(&effective, &Verb::Show, record, relations)
    }

    /// Project each row of a list result through the roles that grant
    /// `list` and whose scope contains that row.
    pub fn project_list<'r>(
        &self,
        principal: Option<&Principal>,
        resource_type: &ResourceType,
        records: impl IntoIterator<Item = &'r Record>,
        relations: &dyn RelationSource,
    ) -> Result<Vec<Record>> {
        let effective = self.registry.resolve_principal(principal, resource_type);
        records
            .into_iter()
            .map(|record| self.project_with(&effective, &Verb::List, record, relations))
            .collect()
    }

    fn project_with(
        &self,
        effective: &EffectivePolicy,
        verb: &Verb,
        record: &Record,
        relations: &dyn RelationSource,
    ) -> Result<Record> {
        let schema = self.registry.schema(&record.resource_type)?;
        let ctx = ScopeContext::new(effective.actor.as_ref(), schema);
        let surface = AttributeSurface::union_of(
            schema,
            effective
                .granting(verb)
                .filter(|g| g.policy.scope().filter(&ctx).matches(record, relations))
                .map(|g| g.policy.as_ref()),
            Action::Read,
        );
        Ok(surface.project(record))
    }

    pub fn describe(&self, resource_type: &ResourceType, role: &RoleId) -> Result<ResourceDescription> {
        describe_resource(&self.registry, resource_type, role)
    }
}

impl std::fmt::Debug for AccessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessEngine")
            .field("policies", &self.registry.len())
            .field("payload_mode", &self.payload_mode)
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
