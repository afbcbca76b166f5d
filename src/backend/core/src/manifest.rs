//! Declarative policy manifests.
//!
//! A manifest declares resource schemas, role base policies, per-resource
//! policies and notification bindings in one TOML, YAML or JSON document.
//! Compiling it produces the immutable catalog, registry and binding table;
//! every configuration error surfaces during compilation.
//!
//! ```toml
//! [[resources]]
//! name = "widget"
//! attributes = [{ name = "title" }, { name = "owner_id", type = "reference" }]
//! parents = [{ name = "owner", attribute = "owner_id", resource = "principal" }]
//!
//! [[roles]]
//! name = "member"
//! template = "member"
//!
//! [[policies]]
//! role = "member"
//! resource = "widget"
//! deny = { update = ["owner_id"] }
//!
//! [[notifications.bindings]]
//! key = "widget.created"
//! group = "owner"
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ErrorCode, ErrorContext, ErrorDetails, KeystoneError, Result};
use crate::notify::BindingTable;
use crate::policy::{
    Action, CapabilitySet, Condition, PolicyBuilder, PolicyRegistry, PredefinedRole, Verb,
};
use crate::schema::{ResourceSchema, SchemaCatalog};
use crate::scope::{Scope, ScopeRule};

// ═══════════════════════════════════════════════════════════════════════════════
// Document
// ═══════════════════════════════════════════════════════════════════════════════

/// Source format of a manifest document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Toml,
    Yaml,
    Json,
}

impl ManifestFormat {
    /// Pick the format from a file extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match extension.as_deref() {
            Some("toml") => Ok(Self::Toml),
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("json") => Ok(Self::Json),
            _ => Err(KeystoneError::configuration(
                ErrorCode::InvalidConfiguration,
                format!(
                    "Unsupported manifest format for {} (expected .toml, .yaml, .yml or .json)",
                    path.display()
                ),
            )),
        }
    }
}

/// The top-level manifest document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Role used for requests without a principal.
    #[serde(default)]
    pub anonymous_role: Option<String>,

    /// Register the built-in anonymous, viewer, member and admin templates.
    #[serde(default)]
    pub predefined_roles: bool,

    #[serde(default)]
    pub resources: Vec<ResourceSchema>,

    /// Role base policies.
    #[serde(default)]
    pub roles: Vec<RoleEntry>,

    /// Per-resource policies.
    #[serde(default)]
    pub policies: Vec<PolicyEntry>,

    #[serde(default)]
    pub notifications: NotificationSection,
}

/// Fields shared by base and resource policies. Unset fields inherit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyBody {
    /// Base policy to inherit from.
    #[serde(default)]
    pub inherits: Option<String>,

    /// Verb names; `read`, `write` and `manage` are shorthands.
    #[serde(default)]
    pub capabilities: Option<Vec<String>>,

    /// Scope rules, intersected.
    #[serde(default)]
    pub scope: Option<Vec<ScopeRule>>,

    #[serde(default)]
    pub allow: BTreeMap<Action, Vec<String>>,

    #[serde(default)]
    pub deny: BTreeMap<Action, Vec<String>>,

    #[serde(default)]
    pub conditions: Vec<ConditionEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleEntry {
    pub name: String,

    /// Predefined template the base starts from.
    #[serde(default)]
    pub template: Option<String>,

    #[serde(flatten)]
    pub body: PolicyBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub role: String,
    pub resource: String,

    #[serde(flatten)]
    pub body: PolicyBody,
}

/// Record condition gating one verb: `field` must equal `equals`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionEntry {
    pub verb: Verb,
    pub field: String,
    pub equals: Value,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSection {
    #[serde(default)]
    pub bindings: Vec<BindingEntry>,

    #[serde(default)]
    pub routes: Vec<RouteEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingEntry {
    pub key: String,
    pub group: String,
    /// Overrides the default `{plural}/{resource}/{event}` template path.
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEntry {
    pub key: String,
    pub groups: Vec<String>,
}

/// The immutable output of [`Manifest::compile`].
#[derive(Debug, Clone)]
pub struct CompiledManifest {
    pub catalog: Arc<SchemaCatalog>,
    pub registry: Arc<PolicyRegistry>,
    pub bindings: Arc<BindingTable>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Parsing
// ═══════════════════════════════════════════════════════════════════════════════

impl Manifest {
    pub fn from_toml(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_yaml(source: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(source)?)
    }

    pub fn from_json(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    pub fn parse(source: &str, format: ManifestFormat) -> Result<Self> {
        match format {
            ManifestFormat::Toml => Self::from_toml(source),
            ManifestFormat::Yaml => Self::from_yaml(source),
            ManifestFormat::Json => Self::from_json(source),
        }
    }

    /// Read and parse a manifest file, choosing the format by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let format = ManifestFormat::from_path(path)?;
        let source = std::fs::read_to_string(path)
            .with_error_code(ErrorCode::InvalidConfiguration)
            .map_err(|e| e.with_context("path", path.display().to_string()))?;
        debug!(path = %path.display(), ?format, "Loading manifest");
        Self::parse(&source, format)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Compilation
    // ─────────────────────────────────────────────────────────────────────────

    /// Validate the manifest and build the catalog, registry and bindings.
    ///
    /// Failures are logged before they are returned.
    pub fn compile(&self) -> Result<CompiledManifest> {
        self.build().inspect_err(KeystoneError::log)
    }

    fn build(&self) -> Result<CompiledManifest> {
        let catalog = Arc::new(SchemaCatalog::from_schemas(self.resources.iter().cloned())?);

        let mut registry = PolicyRegistry::builder(catalog.clone());
        if let Some(role) = &self.anonymous_role {
            registry = registry.anonymous_role(role.as_str());
        }
        if self.predefined_roles {
            registry = registry.with_predefined_roles();
        }

        for role in &self.roles {
            let builder = match &role.template {
                Some(template) => PredefinedRole::parse(template)
                    .ok_or_else(|| {
                        KeystoneError::configuration(
                            ErrorCode::ConfigurationError,
                            format!("Role {} uses unknown template {}", role.name, template),
                        )
                        .with_details(ErrorDetails::new().with_suggestion(format!(
                            "use one of: {}",
                            PredefinedRole::all()
                                .iter()
                                .map(PredefinedRole::id)
                                .collect::<Vec<_>>()
                                .join(", ")
                        )))
                    })?
                    .template_for(role.name.as_str()),
                None => PolicyBuilder::base(role.name.as_str()),
            };
            registry = registry.register(role.body.apply(builder));
        }

        for policy in &self.policies {
            let builder = PolicyBuilder::resource(policy.role.as_str(), policy.resource.as_str());
            registry = registry.register(policy.body.apply(builder));
        }

        let registry = Arc::new(registry.build()?);

        let mut bindings = BindingTable::builder().validate_resources(catalog.clone());
        for binding in &self.notifications.bindings {
            bindings = match &binding.template {
                Some(template) => {
                    bindings.bind_template(binding.key.as_str(), binding.group.as_str(), template.as_str())
                }
                None => bindings.bind(binding.key.as_str(), binding.group.as_str()),
            };
        }
        for route in &self.notifications.routes {
            bindings = bindings.route(route.key.as_str(), route.groups.iter().map(String::as_str));
        }
        let bindings = Arc::new(bindings.build()?);

        info!(
            resources = catalog.len(),
            policies = registry.len(),
            bindings = bindings.len(),
            "Manifest compiled"
        );

        Ok(CompiledManifest {
            catalog,
            registry,
            bindings,
        })
    }
}

impl PolicyBody {
    /// Overlay the declared fields onto `builder`.
    fn apply(&self, mut builder: PolicyBuilder) -> PolicyBuilder {
        if let Some(parent) = &self.inherits {
            builder = builder.inherits(parent.as_str());
        }
        if let Some(names) = &self.capabilities {
            builder = builder.capabilities(CapabilitySet::from_names(names));
        }
        if let Some(scope) = self.scope.clone().and_then(Scope::from_rules) {
            builder = builder.scope(scope);
        }
        for (action, names) in &self.allow {
            builder = builder.allow(*action, names.iter().cloned());
        }
        for (action, names) in &self.deny {
            builder = builder.deny(*action, names.iter().cloned());
        }
        for entry in &self.conditions {
            let reason = entry
                .reason
                .clone()
                .unwrap_or_else(|| format!("{} must be {}", entry.field, entry.equals));
            builder = builder.condition(
                entry.verb.clone(),
                Condition::attribute_equals(entry.field.as_str(), entry.equals.clone(), reason),
            );
        }
        builder
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Resolution, ResourceType, RoleId};
    use std::io::Write;

    const WIDGETS: &str = r#"
anonymous_role = "guest"

[[resources]]
name = "widget"
scoping_parent = "owner"
attributes = [
    { name = "title" },
    { name = "status" },
    { name = "owner_id", type = "reference", immutable = true },
    { name = "secret", hidden = true },
]
parents = [{ name = "owner", attribute = "owner_id", resource = "principal" }]

[[roles]]
name = "guest"
template = "anonymous"

[[roles]]
name = "member"
template = "member"

[[roles]]
name = "reviewer"
capabilities = ["read", "approve"]
scope = [{ kind = "all" }]

[[policies]]
role = "member"
resource = "widget"
deny = { update = ["status"] }

[[policies]]
role = "reviewer"
resource = "widget"
conditions = [{ verb = "approve", field = "status", equals = "submitted" }]

[[notifications.bindings]]
key = "widget.created"
group = "owner"

[[notifications.routes]]
key = "widget.created"
groups = ["owner"]
"#;

    #[test]
    fn test_compile_toml() {
        let compiled = Manifest::from_toml(WIDGETS).unwrap().compile().unwrap();
        let widget = ResourceType::new("widget");

        assert_eq!(compiled.registry.anonymous_role().as_str(), "guest");
        let member = compiled.registry.resolve(&RoleId::new("member"), &widget);
        assert_eq!(member.resolution, Resolution::Exact);
        assert!(member.permits(&Verb::Update));
        assert!(!member.policy.override_for(Action::Update).unwrap().admits("status"));

        let reviewer = compiled.registry.resolve(&RoleId::new("reviewer"), &widget);
        assert!(reviewer.permits(&Verb::parse("approve")));
        assert!(reviewer.policy.condition_for(&Verb::parse("approve")).is_some());

        assert_eq!(compiled.bindings.len(), 1);
    }

    #[test]
    fn test_unknown_template() {
        let manifest = Manifest::from_toml(
            r#"
[[roles]]
name = "owner"
template = "superuser"
"#,
        )
        .unwrap();
        let err = manifest.compile().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
        let suggestion = err.details().suggested_action.as_deref().unwrap();
        assert!(suggestion.contains("member"));
    }

    #[test]
    fn test_missing_manifest_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("absent.toml");
        let err = Manifest::load(&path).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
        assert_eq!(
            err.details().context["path"],
            serde_json::json!(path.display().to_string())
        );
    }

    #[test]
    fn test_conflicting_overrides_rejected() {
        let mut manifest = Manifest::from_toml(WIDGETS).unwrap();
        manifest.policies[0]
            .body
            .allow
            .insert(Action::Update, vec!["title".to_string()]);
        let err = manifest.compile().unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConflictingAttributeOverride);
    }

    #[test]
    fn test_policy_for_unknown_resource() {
        let mut manifest = Manifest::from_toml(WIDGETS).unwrap();
        manifest.policies[0].resource = "gadget".to_string();
        let err = manifest.compile().unwrap_err();
        assert_eq!(err.code(), ErrorCode::UnknownResource);
    }

    #[test]
    fn test_route_without_binding() {
        let mut manifest = Manifest::from_toml(WIDGETS).unwrap();
        manifest.notifications.routes[0].groups.push("admin".to_string());
        let err = manifest.compile().unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingBinding);
    }

    #[test]
    fn test_load_by_extension() {
        let yaml = r#"
resources:
  - name: note
    attributes:
      - name: body
roles:
  - name: viewer
    template: viewer
"#;
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let compiled = Manifest::load(file.path()).unwrap().compile().unwrap();
        let resolved = compiled
            .registry
            .resolve(&RoleId::new("viewer"), &ResourceType::new("note"));
        assert_eq!(resolved.resolution, Resolution::RoleDefault);
        assert!(resolved.permits(&Verb::Show));
    }

    #[test]
    fn test_json_manifest() {
        let json = r#"{
            "predefined_roles": true,
            "resources": [{ "name": "note", "attributes": [{ "name": "body" }] }]
        }"#;
        let compiled = Manifest::from_json(json).unwrap().compile().unwrap();
        assert_eq!(compiled.registry.roles().len(), 4);
    }

    #[test]
    fn test_unsupported_extension() {
        let err = ManifestFormat::from_path(Path::new("policy.ini")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }
}
