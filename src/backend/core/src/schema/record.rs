//! Records handed to the core by the storage collaborator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::policy::models::ResourceType;

/// A concrete resource instance.
///
/// The id is also reachable as the `"id"` attribute so that scope filters can
/// address it like any other field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub resource_type: ResourceType,
    pub id: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Record {
    pub fn new(resource_type: impl Into<ResourceType>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
            attributes: Map::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Attribute value by name. `"id"` is always the record id, even if the
    /// attribute map carries its own `"id"` entry.
    pub fn get(&self, name: &str) -> Option<Value> {
        if name == "id" {
            return Some(Value::String(self.id.clone()));
        }
        self.attributes.get(name).cloned()
    }
}
