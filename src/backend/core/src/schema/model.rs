//! Attribute and resource schema declarations.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{ErrorCode, KeystoneError, Result};
use crate::policy::models::{Action, ResourceType};

/// Declared value type of an attribute, surfaced in API contracts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    #[default]
    String,
    Integer,
    Float,
    Boolean,
    Timestamp,
    Reference,
    Json,
}

/// One attribute of a resource schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDef {
    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: AttributeType,

    #[serde(default = "yes")]
    pub readable: bool,

    #[serde(default = "yes")]
    pub creatable: bool,

    #[serde(default = "yes")]
    pub updatable: bool,

    /// Permanently hidden. No policy can expose it.
    #[serde(default)]
    pub hidden: bool,

    /// Writable on create only; never part of an update surface.
    #[serde(default)]
    pub immutable: bool,
}

fn yes() -> bool {
    true
}

impl AttributeDef {
    /// A readable, creatable and updatable attribute.
    pub fn new(name: impl Into<String>, kind: AttributeType) -> Self {
        Self {
            name: name.into(),
            kind,
            readable: true,
            creatable: true,
            updatable: true,
            hidden: false,
            immutable: false,
        }
    }

    /// Output only (server-assigned).
    pub fn read_only(mut self) -> Self {
        self.creatable = false;
        self.updatable = false;
        self
    }

    /// Accepted on writes but never returned.
    pub fn write_only(mut self) -> Self {
        self.readable = false;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    /// Schema-level visibility for an action, before any policy override.
    pub fn visible_for(&self, action: Action) -> bool {
        if self.hidden {
            return false;
        }
        match action {
            Action::Read => self.readable,
            Action::Create => self.creatable,
            Action::Update => self.updatable && !self.immutable,
        }
    }
}

/// A reference from this resource to a parent resource.
///
/// All parent references are co-equal; the schema names which one drives
/// ownership scoping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub name: String,
    /// Attribute holding the parent id.
    pub attribute: String,
    /// Parent resource type (or `"principal"` for principal ownership).
    pub resource: String,
}

impl ParentRef {
    pub fn new(
        name: impl Into<String>,
        attribute: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            attribute: attribute.into(),
            resource: resource.into(),
        }
    }
}

/// Ordered attribute declarations plus parent references for one resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub name: ResourceType,

    #[serde(default)]
    pub attributes: Vec<AttributeDef>,

    #[serde(default)]
    pub parents: Vec<ParentRef>,

    /// Name of the parent reference used for ownership scoping.
    #[serde(default)]
    pub scoping_parent: Option<String>,
}

impl ResourceSchema {
    pub fn new(name: impl Into<ResourceType>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            parents: Vec::new(),
            scoping_parent: None,
        }
    }

    pub fn attribute(mut self, attribute: AttributeDef) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn parent(mut self, parent: ParentRef) -> Self {
        self.parents.push(parent);
        self
    }

    pub fn scoped_by(mut self, parent: impl Into<String>) -> Self {
        self.scoping_parent = Some(parent.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// The parent reference that drives scoping, if any.
    pub fn scoping_ref(&self) -> Option<&ParentRef> {
        let name = self.scoping_parent.as_deref()?;
        self.parents.iter().find(|p| p.name == name)
    }

    /// Validate the declaration and settle the scoping reference.
    ///
    /// A single parent reference is picked as the scoping reference
    /// implicitly. With several, one must be named explicitly.
    pub fn normalize(mut self) -> Result<Self> {
        let invalid = |msg: String| KeystoneError::configuration(ErrorCode::InvalidSchema, msg);

        if self.name.as_str().is_empty() {
            return Err(invalid("Resource schema has an empty name".to_string()));
        }

        let mut seen = HashSet::new();
        for attribute in &self.attributes {
            if !seen.insert(attribute.name.as_str()) {
                return Err(invalid(format!(
                    "Resource {} declares attribute {} twice",
                    self.name, attribute.name
                )));
            }
        }

        let mut parent_names = HashSet::new();
        for parent in &self.parents {
            if !parent_names.insert(parent.name.as_str()) {
                return Err(invalid(format!(
                    "Resource {} declares parent {} twice",
                    self.name, parent.name
                )));
            }
            if !self.has_attribute(&parent.attribute) {
                return Err(invalid(format!(
                    "Parent {} of {} references unknown attribute {}",
                    parent.name, self.name, parent.attribute
                )));
            }
        }

        let scoping = self.scoping_parent.clone();
        match (scoping, self.parents.len()) {
            (Some(name), _) if !parent_names.contains(name.as_str()) => {
                return Err(invalid(format!(
                    "Resource {} is scoped by unknown parent {}",
                    self.name, name
                )));
            }
            (None, 1) => {
                self.scoping_parent = Some(self.parents[0].name.clone());
            }
            (None, n) if n > 1 => {
                return Err(invalid(format!(
                    "Resource {} has {} parents; scoping_parent must name one",
                    self.name, n
                )));
            }
            _ => {}
        }

        Ok(self)
    }
}
