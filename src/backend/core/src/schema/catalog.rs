//! Registry of resource schemas.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use super::model::ResourceSchema;
use crate::error::{ErrorCode, KeystoneError, Result};
use crate::policy::models::ResourceType;

/// All registered resource schemas, immutable once built.
#[derive(Debug, Clone, Default)]
pub struct SchemaCatalog {
    schemas: BTreeMap<ResourceType, Arc<ResourceSchema>>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog, validating every schema.
    pub fn from_schemas(schemas: impl IntoIterator<Item = ResourceSchema>) -> Result<Self> {
        let mut catalog = Self::new();
        for schema in schemas {
            catalog.register(schema)?;
        }
        Ok(catalog)
    }

    /// Register a schema. Registering the same resource type twice is an error.
    pub fn register(&mut self, schema: ResourceSchema) -> Result<()> {
        let schema = schema.normalize()?;
        if self.schemas.contains_key(&schema.name) {
            return Err(KeystoneError::configuration(
                ErrorCode::InvalidSchema,
                format!("Resource {} registered twice", schema.name),
            ));
        }
        debug!(
            resource_type = %schema.name,
            attributes = schema.attributes.len(),
            "Registered resource schema"
        );
        self.schemas.insert(schema.name.clone(), Arc::new(schema));
        Ok(())
    }

    pub fn get(&self, resource_type: &ResourceType) -> Option<&Arc<ResourceSchema>> {
        self.schemas.get(resource_type)
    }

    /// Like [`get`](Self::get) but an unknown type is an error.
    pub fn require(&self, resource_type: &ResourceType) -> Result<&Arc<ResourceSchema>> {
        self.get(resource_type).ok_or_else(|| {
            KeystoneError::configuration(
                ErrorCode::UnknownResource,
                format!("Unknown resource type: {}", resource_type),
            )
        })
    }

    pub fn contains(&self, resource_type: &ResourceType) -> bool {
        self.schemas.contains_key(resource_type)
    }

    pub fn resource_types(&self) -> impl Iterator<Item = &ResourceType> {
        self.schemas.keys()
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
