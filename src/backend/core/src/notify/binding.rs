//! Notification keys, target groups and the binding table.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::info;

use crate::error::{ErrorCode, KeystoneError, Result};
use crate::policy::models::{PrincipalId, ResourceType};
use crate::schema::SchemaCatalog;

/// `<resource>.<event>`, both lowercase identifiers.
static KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z][a-z0-9_]*)\.([a-z][a-z0-9_]*)$").expect("Invalid notification key regex")
});

/// Template used when a binding does not name its own.
pub const DEFAULT_TEMPLATE: &str = "{plural}/{resource}/{event}";

// ═══════════════════════════════════════════════════════════════════════════════
// Keys and Groups
// ═══════════════════════════════════════════════════════════════════════════════

/// A notification key such as `widget.created`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NotificationKey {
    resource: String,
    event: String,
}

impl NotificationKey {
    pub fn parse(key: &str) -> Result<Self> {
        let captures = KEY_REGEX.captures(key).ok_or_else(|| {
            KeystoneError::configuration(
                ErrorCode::InvalidNotificationKey,
                format!(
                    "Invalid notification key {:?}: expected <resource>.<event> in lowercase",
                    key
                ),
            )
        })?;
        Ok(Self {
            resource: captures[1].to_string(),
            event: captures[2].to_string(),
        })
    }

    pub fn new(resource: &str, event: &str) -> Result<Self> {
        Self::parse(&format!("{}.{}", resource, event))
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn resource_type(&self) -> ResourceType {
        ResourceType::new(self.resource.as_str())
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

impl fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.event)
    }
}

impl TryFrom<String> for NotificationKey {
    type Error = KeystoneError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<NotificationKey> for String {
    fn from(key: NotificationKey) -> Self {
        key.to_string()
    }
}

/// A symbolic recipient group such as `owners` or `watchers`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetGroup(String);

impl TargetGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Plural form used as the first template path segment.
    ///
    /// Names ending in `ss` take `es`; other names already ending in `s`
    /// are taken to be plural and kept as they are.
    pub fn plural(&self) -> String {
        let name = self.0.as_str();
        if name.ends_with("ss") {
            return format!("{}es", name);
        }
        if name.ends_with('s') {
            return name.to_string();
        }
        if let Some(stem) = name.strip_suffix('y') {
            let consonant = stem
                .chars()
                .last()
                .map_or(false, |c| !matches!(c, 'a' | 'e' | 'i' | 'o' | 'u'));
            if consonant {
                return format!("{}ies", stem);
            }
        }
        if ["sh", "ch", "x", "z"].iter().any(|suffix| name.ends_with(suffix)) {
            return format!("{}es", name);
        }
        format!("{}s", name)
    }
}

impl fmt::Display for TargetGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TargetGroup {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A concrete recipient, tagged with the group it was resolved for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Target {
    pub recipient: PrincipalId,
    pub group: TargetGroup,
}

impl Target {
    pub fn new(recipient: impl Into<PrincipalId>, group: impl Into<TargetGroup>) -> Self {
        Self {
            recipient: recipient.into(),
            group: group.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Bindings
// ═══════════════════════════════════════════════════════════════════════════════

/// Binds a (key, target group) pair to a template path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationBinding {
    pub key: NotificationKey,
    pub group: TargetGroup,
    /// Template with `{plural}`, `{group}`, `{resource}` and `{event}`
    /// placeholders. Defaults to [`DEFAULT_TEMPLATE`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

impl NotificationBinding {
    pub fn new(key: NotificationKey, group: TargetGroup) -> Self {
        Self {
            key,
            group,
            template: None,
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// The rendered template path, e.g. `owners/widget/created`.
    pub fn template_path(&self) -> String {
        self.template
            .as_deref()
            .unwrap_or(DEFAULT_TEMPLATE)
            .replace("{plural}", &self.group.plural())
            .replace("{group}", self.group.as_str())
            .replace("{resource}", self.key.resource())
            .replace("{event}", self.key.event())
    }
}

/// Immutable table of notification bindings and declared routes.
#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    bindings: BTreeMap<(NotificationKey, TargetGroup), NotificationBinding>,
    routes: BTreeMap<NotificationKey, BTreeSet<TargetGroup>>,
}

impl BindingTable {
    pub fn builder() -> BindingTableBuilder {
        BindingTableBuilder::default()
    }

    pub fn binding(&self, key: &NotificationKey, group: &TargetGroup) -> Option<&NotificationBinding> {
        self.bindings.get(&(key.clone(), group.clone()))
    }

    pub fn template_path(&self, key: &NotificationKey, group: &TargetGroup) -> Option<String> {
        self.binding(key, group).map(NotificationBinding::template_path)
    }

    /// Target groups declared for a key.
    pub fn routes_for(&self, key: &NotificationKey) -> Option<&BTreeSet<TargetGroup>> {
        self.routes.get(key)
    }

    pub fn routes(&self) -> impl Iterator<Item = (&NotificationKey, &BTreeSet<TargetGroup>)> {
        self.routes.iter()
    }

    /// Bindings in (key, group) order.
    pub fn bindings(&self) -> impl Iterator<Item = &NotificationBinding> {
        self.bindings.values()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Collects bindings and routes; every problem surfaces from `build`.
#[derive(Debug, Default)]
pub struct BindingTableBuilder {
    bindings: Vec<(String, String, Option<String>)>,
    routes: Vec<(String, Vec<String>)>,
    catalog: Option<Arc<SchemaCatalog>>,
}

impl BindingTableBuilder {
    pub fn bind(mut self, key: impl Into<String>, group: impl Into<String>) -> Self {
        self.bindings.push((key.into(), group.into(), None));
        self
    }

    pub fn bind_template(
        mut self,
        key: impl Into<String>,
        group: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        self.bindings.push((key.into(), group.into(), Some(template.into())));
        self
    }

    /// Declare the target groups a key notifies. Each needs a binding.
    pub fn route<I, S>(mut self, key: impl Into<String>, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes
            .push((key.into(), groups.into_iter().map(Into::into).collect()));
        self
    }

    /// Check every key's resource segment against the catalog.
    pub fn validate_resources(mut self, catalog: Arc<SchemaCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn build(self) -> Result<BindingTable> {
        let mut table = BindingTable::default();

        for (key, group, template) in self.bindings {
            let key = NotificationKey::parse(&key)?;
            let group = TargetGroup::new(group);
            if group.as_str().is_empty() {
                return Err(KeystoneError::configuration(
                    ErrorCode::InvalidConfiguration,
                    format!("Binding for {} has an empty target group", key),
                ));
            }
            if let Some(catalog) = &self.catalog {
                if !catalog.contains(&key.resource_type()) {
                    return Err(KeystoneError::configuration(
                        ErrorCode::UnknownResource,
                        format!("Notification key {} names unknown resource type", key),
                    ));
                }
            }

            let mut binding = NotificationBinding::new(key.clone(), group.clone());
            binding.template = template;
            if table.bindings.insert((key.clone(), group.clone()), binding).is_some() {
                return Err(KeystoneError::configuration(
                    ErrorCode::DuplicateBinding,
                    format!("Duplicate binding for {} and target group {}", key, group),
                ));
            }
        }

        for (key, groups) in self.routes {
            let key = NotificationKey::parse(&key)?;
            let declared = table.routes.entry(key.clone()).or_default();
            for group in groups {
                let group = TargetGroup::new(group);
                if !table.bindings.contains_key(&(key.clone(), group.clone())) {
                    return Err(KeystoneError::configuration(
                        ErrorCode::MissingBinding,
                        format!("Notification {} has no binding for target group {}", key, group),
                    ));
                }
                declared.insert(group);
            }
        }

        info!(
            bindings = table.bindings.len(),
            routes = table.routes.len(),
            "Notification binding table built"
        );
        Ok(table)
    }
}
