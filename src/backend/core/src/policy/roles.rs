//! Predefined base policy templates.
//!
//! Keystone ships with four role templates that can be registered as role
//! defaults and then overlaid per resource type:
//!
//! | Role       | Capabilities                  | Scope      |
//! |------------|-------------------------------|------------|
//! | Anonymous  | nothing                       | none       |
//! | Viewer     | list, show                    | all        |
//! | Member     | list, show, create, update    | owned      |
//! | Admin      | list, show, create, update, destroy | all  |

use super::models::{CapabilitySet, RoleId, Verb};
use super::policy::PolicyBuilder;
use crate::scope::Scope;

/// Predefined role templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredefinedRole {
    Anonymous,
    Viewer,
    Member,
    Admin,
}

impl PredefinedRole {
    /// Get the role identifier string.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Viewer => "viewer",
            Self::Member => "member",
            Self::Admin => "admin",
        }
    }

    /// Get the description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Anonymous => "Unauthenticated access; nothing unless configured",
            Self::Viewer => "Read-only access to every record",
            Self::Member => "Read, create and update records the member owns",
            Self::Admin => "Full access to every record",
        }
    }

    pub fn capabilities(&self) -> CapabilitySet {
        match self {
            Self::Anonymous => CapabilitySet::empty(),
            Self::Viewer => CapabilitySet::read_only(),
            Self::Member => CapabilitySet::of([Verb::List, Verb::Show, Verb::Create, Verb::Update]),
            Self::Admin => CapabilitySet::full(),
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            Self::Anonymous => Scope::nothing(),
            Self::Viewer | Self::Admin => Scope::all(),
            Self::Member => Scope::owned(),
        }
    }

    /// A base policy builder for this template.
    pub fn template(&self) -> PolicyBuilder {
        PolicyBuilder::base(self.id())
            .capabilities(self.capabilities())
            .scope(self.scope())
    }

    /// The same template registered under another role name.
    pub fn template_for(&self, role: impl Into<RoleId>) -> PolicyBuilder {
        PolicyBuilder::base(role)
            .capabilities(self.capabilities())
            .scope(self.scope())
    }

    pub fn parse(id: &str) -> Option<Self> {
        Self::all().into_iter().find(|r| r.id() == id)
    }

    /// Return all predefined roles.
    pub fn all() -> Vec<PredefinedRole> {
        vec![Self::Anonymous, Self::Viewer, Self::Member, Self::Admin]
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
