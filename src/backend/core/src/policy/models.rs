//! Authorization data models: identifiers, principals, verbs and capability sets.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════════

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Strongly-typed principal identifier.
    PrincipalId
);
string_id!(
    /// Strongly-typed role identifier.
    RoleId
);
string_id!(
    /// Strongly-typed tenant (organization) identifier.
    TenantId
);
string_id!(
    /// Name of a registered resource type, e.g. `"widget"`.
    ResourceType
);

// ═══════════════════════════════════════════════════════════════════════════════
// Principal
// ═══════════════════════════════════════════════════════════════════════════════

/// The authenticated actor attempting an action.
///
/// Built once per request and never mutated afterwards. A request without a
/// principal is anonymous and is represented as `Option<&Principal>::None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    id: PrincipalId,
    roles: BTreeSet<RoleId>,
    tenants: BTreeSet<TenantId>,
}

impl Principal {
    pub fn new(id: impl Into<PrincipalId>) -> Self {
        Self {
            id: id.into(),
            roles: BTreeSet::new(),
            tenants: BTreeSet::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<RoleId>) -> Self {
        self.roles.insert(role.into());
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<TenantId>) -> Self {
        self.tenants.insert(tenant.into());
        self
    }

    pub fn id(&self) -> &PrincipalId {
        &self.id
    }

    /// Roles in deterministic (sorted) order.
    pub fn roles(&self) -> &BTreeSet<RoleId> {
        &self.roles
    }

    pub fn tenants(&self) -> &BTreeSet<TenantId> {
        &self.tenants
    }

    pub fn has_role(&self, role: &RoleId) -> bool {
        self.roles.contains(role)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Verbs and Actions
// ═══════════════════════════════════════════════════════════════════════════════

/// An action verb a policy may grant.
///
/// `List` and `Create` address the collection; every other verb, including
/// custom ones such as `approve`, addresses a single existing record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Verb {
    List,
    Show,
    Create,
    Update,
    Destroy,
    Custom(String),
}

impl Verb {
    /// Parse a verb name. Unknown names become custom verbs.
    pub fn parse(s: &str) -> Self {
        match s {
            "list" | "index" => Self::List,
            "show" => Self::Show,
            "create" => Self::Create,
            "update" => Self::Update,
            "destroy" | "delete" => Self::Destroy,
            other => Self::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::List => "list",
            Self::Show => "show",
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::Custom(name) => name,
        }
    }

    /// Whether the verb addresses the collection rather than one record.
    pub fn is_collection(&self) -> bool {
        matches!(self, Self::List | Self::Create)
    }

    /// The attribute surface this verb reads or writes, if any.
    pub fn surface_action(&self) -> Option<Action> {
        match self {
            Self::List | Self::Show => Some(Action::Read),
            Self::Create => Some(Action::Create),
            Self::Update => Some(Action::Update),
            Self::Destroy | Self::Custom(_) => None,
        }
    }

    /// The four CRUD verbs plus list.
    pub fn crud() -> [Verb; 5] {
        [Self::List, Self::Show, Self::Create, Self::Update, Self::Destroy]
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Verb {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<&str> for Verb {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl From<Verb> for String {
    fn from(verb: Verb) -> Self {
        verb.as_str().to_string()
    }
}

/// Attribute surface kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Create,
    Update,
}

impl Action {
    pub fn all() -> [Action; 3] {
        [Self::Read, Self::Create, Self::Update]
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Capability Set
// ═══════════════════════════════════════════════════════════════════════════════

/// The set of verbs a policy permits.
///
/// There are no wildcards: every permitted verb is enumerated, so an empty set
/// grants nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Verb>);

impl CapabilitySet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of(verbs: impl IntoIterator<Item = Verb>) -> Self {
        Self(verbs.into_iter().collect())
    }

    /// `list` + `show`.
    pub fn read_only() -> Self {
        Self::of([Verb::List, Verb::Show])
    }

    /// Every CRUD verb.
    pub fn full() -> Self {
        Self::of(Verb::crud())
    }

    /// Expand a capability name. `read` and `manage` are shorthands.
    pub fn expand(name: &str) -> Vec<Verb> {
        match name {
            "read" => vec![Verb::List, Verb::Show],
            "write" => vec![Verb::Create, Verb::Update],
            "manage" => Verb::crud().to_vec(),
            other => vec![Verb::parse(other)],
        }
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        Self(names.iter().flat_map(|n| Self::expand(n.as_ref())).collect())
    }

    pub fn grant(&mut self, verb: Verb) {
        self.0.insert(verb);
    }

    pub fn contains(&self, verb: &Verb) -> bool {
        self.0.contains(verb)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Verb> {
        self.0.iter()
    }

    /// Union, used to combine the policies of several roles.
    pub fn union(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.union(&other.0).cloned().collect())
    }
}

impl FromIterator<Verb> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Verb>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
