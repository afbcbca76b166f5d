//! Record visibility.
//!
//! Scopes turn a principal into an abstract [`Filter`] for the external query
//! layer. The core never queries storage itself; single-record checks use a
//! [`RelationSource`] for join membership.

pub mod dataset;
pub mod filter;
pub mod resolver;
pub mod rule;

pub use dataset::Dataset;
pub use filter::{Filter, JoinRelation, NoRelations, RelationSource};
pub use resolver::ScopeResolver;
pub use rule::{Scope, ScopeCondition, ScopeContext, ScopeFn, ScopeRule};
