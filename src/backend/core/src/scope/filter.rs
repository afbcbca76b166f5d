//! Abstract filter descriptions.
//!
//! A [`Filter`] narrows a resource collection. It is handed to the external
//! query layer as data; the core only evaluates it against a single record
//! (for record-level checks) or against in-memory fixtures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::Record;

/// Existential subquery: the set of `select` values from rows of `relation`
/// whose `column` equals `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRelation {
    pub relation: String,
    pub select: String,
    pub column: String,
    pub value: Value,
}

/// Answers join-relation subqueries for single-record membership checks.
///
/// Implemented by the query layer that owns the join tables.
pub trait RelationSource {
    fn select(&self, join: &JoinRelation) -> Vec<Value>;
}

/// A relation source with no rows. Every join condition is empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRelations;

impl RelationSource for NoRelations {
    fn select(&self, _join: &JoinRelation) -> Vec<Value> {
        Vec::new()
    }
}

/// Boolean combination of field conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// Every record.
    All,
    /// No record.
    Nothing,
    /// `field = value`
    Eq { field: String, value: Value },
    /// `field IN (values)`
    In { field: String, values: Vec<Value> },
    /// `field IN (SELECT join.select FROM join.relation WHERE join.column = join.value)`
    InRelation { field: String, join: JoinRelation },
    And { filters: Vec<Filter> },
    Or { filters: Vec<Filter> },
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn one_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        if values.is_empty() {
            return Self::Nothing;
        }
        Self::In {
            field: field.into(),
            values,
        }
    }

    pub fn in_relation(field: impl Into<String>, join: JoinRelation) -> Self {
        Self::InRelation {
            field: field.into(),
            join,
        }
    }

    /// Intersection of all filters.
    ///
    /// The result never admits a record that any operand rejects. `All`
    /// operands are dropped and a `Nothing` operand collapses the result.
    pub fn all(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut parts = Vec::new();
        for filter in filters {
            match filter {
                Self::All => {}
                Self::Nothing => return Self::Nothing,
                Self::And { filters } => parts.extend(filters),
                other => parts.push(other),
            }
        }
        match parts.len() {
            0 => Self::All,
            1 => parts.remove(0),
            _ => Self::And { filters: parts },
        }
    }

    /// Union of all filters. An empty union is `Nothing`.
    pub fn any(filters: impl IntoIterator<Item = Filter>) -> Self {
        let mut parts = Vec::new();
        for filter in filters {
            match filter {
                Self::Nothing => {}
                Self::All => return Self::All,
                Self::Or { filters } => parts.extend(filters),
                other => parts.push(other),
            }
        }
        match parts.len() {
            0 => Self::Nothing,
            1 => parts.remove(0),
            _ => Self::Or { filters: parts },
        }
    }

    /// Narrow this filter by another.
    pub fn and(self, other: Filter) -> Self {
        Self::all([self, other])
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Self::Nothing)
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }

    /// Evaluate against one record.
    pub fn matches(&self, record: &Record, relations: &dyn RelationSource) -> bool {
        match self {
            Self::All => true,
            Self::Nothing => false,
            Self::Eq { field, value } => record.get(field).as_ref() == Some(value),
            Self::In { field, values } => record
                .get(field)
                .map_or(false, |actual| values.contains(&actual)),
            Self::InRelation { field, join } => match record.get(field) {
                Some(actual) => relations.select(join).contains(&actual),
                None => false,
            },
            Self::And { filters } => filters.iter().all(|f| f.matches(record, relations)),
            Self::Or { filters } => filters.iter().any(|f| f.matches(record, relations)),
        }
    }
}
