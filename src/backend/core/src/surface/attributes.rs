//! Per-action attribute surfaces.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{KeystoneError, Result};
use crate::policy::models::{Action, ResourceType};
use crate::policy::Policy;
use crate::schema::{Record, ResourceSchema};
use crate::telemetry::metrics;

/// How a write payload with unpermitted attributes is handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadMode {
    /// Fail with the list of offending attributes.
    #[default]
    Reject,
    /// Drop offending attributes silently.
    Strip,
}

/// The attributes one action may read or write, in schema order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeSurface {
    pub resource_type: ResourceType,
    pub action: Action,
    attributes: Vec<String>,
}

impl AttributeSurface {
    /// Schema visibility for the action, narrowed by the policy override.
    ///
    /// Hidden attributes never pass, whatever the override says, and
    /// immutable attributes never reach the update surface.
    pub fn compute(schema: &ResourceSchema, policy: &Policy, action: Action) -> Self {
        Self::union_of(schema, [policy], action)
    }

    /// Attributes permitted by any of the policies.
    pub fn union_of<'a>(
        schema: &ResourceSchema,
        policies: impl IntoIterator<Item = &'a Policy>,
        action: Action,
    ) -> Self {
        let policies: Vec<&Policy> = policies.into_iter().collect();
        let attributes = schema
            .attributes
            .iter()
            .filter(|attr| attr.visible_for(action))
            .filter(|attr| {
                policies.iter().any(|policy| {
                    policy
                        .override_for(action)
                        .map_or(true, |rule| rule.admits(&attr.name))
                })
            })
            .map(|attr| attr.name.clone())
            .collect();

        Self {
            resource_type: schema.name.clone(),
            action,
            attributes,
        }
    }

    pub fn empty(resource_type: ResourceType, action: Action) -> Self {
        Self {
            resource_type,
            action,
            attributes: Vec::new(),
        }
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn permits(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a == name)
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Validate a write payload against the surface.
    ///
    /// In `Reject` mode any unpermitted attribute fails the whole payload and
    /// the error lists every offender, sorted. In `Strip` mode they are
    /// dropped.
    pub fn filter_payload(&self, payload: &Map<String, Value>, mode: PayloadMode) -> Result<Map<String, Value>> {
        let mut rejected: Vec<String> = payload
            .keys()
            .filter(|name| !self.permits(name))
            .cloned()
            .collect();

        if rejected.is_empty() {
            return Ok(payload.clone());
        }
        rejected.sort();

        match mode {
            PayloadMode::Reject => {
                metrics::record_payload_rejection(self.resource_type.as_str());
                Err(KeystoneError::unpermitted_attributes(
                    self.resource_type.as_str(),
                    rejected,
                ))
            }
            PayloadMode::Strip => {
                debug!(
                    resource_type = %self.resource_type,
                    action = %self.action,
                    stripped = ?rejected,
                    "Stripped unpermitted attributes"
                );
                Ok(payload
                    .iter()
                    .filter(|(name, _)| self.permits(name))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect())
            }
        }
    }

    /// Copy of the record with unreadable attributes removed.
    pub fn project(&self, record: &Record) -> Record {
        Record {
            resource_type: record.resource_type.clone(),
            id: record.id.clone(),
            attributes: record
                .attributes
                .iter()
                .filter(|(name, _)| self.permits(name))
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect(),
        }
    }
}
