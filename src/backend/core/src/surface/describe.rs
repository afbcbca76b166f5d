//! Per-role API contracts for the schema-serialization layer.

use serde::Serialize;

use super::attributes::AttributeSurface;
use crate::error::Result;
use crate::policy::models::{Action, ResourceType, RoleId, Verb};
use crate::policy::registry::{PolicyRegistry, Resolution};
use crate::schema::AttributeType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttributeType,
    pub readable: bool,
    pub creatable: bool,
    pub updatable: bool,
}

/// What one role may do with one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceDescription {
    pub resource_type: ResourceType,
    pub role: RoleId,
    pub resolution: Resolution,
    pub attributes: Vec<AttributeDescription>,
    pub actions: Vec<Verb>,
}

/// Describe the contract a role sees for a resource type.
///
/// Hidden attributes are omitted entirely. Surfaces of actions the role
/// cannot perform are reported as not permitted.
pub fn describe_resource(
    registry: &PolicyRegistry,
    resource_type: &ResourceType,
    role: &RoleId,
) -> Result<ResourceDescription> {
    let schema = registry.schema(resource_type)?;
    let resolved = registry.resolve(role, resource_type);
    let policy = &resolved.policy;

    let surface = |action: Action, verbs: &[Verb]| {
        if verbs.iter().any(|v| policy.permits(v)) {
            AttributeSurface::compute(schema, policy, action)
        } else {
            AttributeSurface::empty(resource_type.clone(), action)
        }
    };
    let read = surface(Action::Read, &[Verb::List, Verb::Show]);
    let create = surface(Action::Create, &[Verb::Create]);
    let update = surface(Action::Update, &[Verb::Update]);

    let attributes = schema
        .attributes
        .iter()
        .filter(|attr| !attr.hidden)
        .map(|attr| AttributeDescription {
            name: attr.name.clone(),
            kind: attr.kind,
            readable: read.permits(&attr.name),
            creatable: create.permits(&attr.name),
            updatable: update.permits(&attr.name),
        })
        .collect();

    Ok(ResourceDescription {
        resource_type: resource_type.clone(),
        role: role.clone(),
        resolution: resolved.resolution,
        attributes,
        actions: policy.capabilities().iter().cloned().collect(),
    })
}
