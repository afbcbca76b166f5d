//! In-memory fixture data for evaluating filters without storage.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::filter::{Filter, JoinRelation, RelationSource};
use crate::policy::models::ResourceType;
use crate::schema::Record;

/// Records grouped by resource type, plus rows of join relations.
#[derive(Debug, Clone, Default)]
pub struct Dataset {
    records: BTreeMap<ResourceType, Vec<Record>>,
    relations: BTreeMap<String, Vec<Map<String, Value>>>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(mut self, record: Record) -> Self {
        self.insert(record);
        self
    }

    pub fn insert(&mut self, record: Record) {
        self.records
            .entry(record.resource_type.clone())
            .or_default()
            .push(record);
    }

    /// Add a row to a join relation.
    pub fn with_row<I, K, V>(mut self, relation: impl Into<String>, row: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let row = row.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self.relations.entry(relation.into()).or_default().push(row);
        self
    }

    pub fn find(&self, resource_type: &ResourceType, id: &str) -> Option<&Record> {
        self.records
            .get(resource_type)?
            .iter()
            .find(|record| record.id == id)
    }

    /// Records of a type admitted by the filter, in insertion order.
    pub fn select(&self, resource_type: &ResourceType, filter: &Filter) -> Vec<&Record> {
        self.records
            .get(resource_type)
            .map(|records| {
                records
                    .iter()
                    .filter(|record| filter.matches(record, self))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ids admitted by the filter.
    pub fn select_ids(&self, resource_type: &ResourceType, filter: &Filter) -> Vec<String> {
        self.select(resource_type, filter)
            .into_iter()
            .map(|record| record.id.clone())
            .collect()
    }
}

impl RelationSource for Dataset {
    fn select(&self, join: &JoinRelation) -> Vec<Value> {
        self.relations
            .get(&join.relation)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.get(&join.column) == Some(&join.value))
                    .filter_map(|row| row.get(&join.select).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}
