//! Declarative queries.

use crate::error::{Error, Result};
use crate::key::Identifier;
use pimdb_codec::Value;
use std::collections::BTreeMap;

/// Comparison applied to one property.
///
/// Only equality is supported; richer comparators can be added but
/// must keep working as residual filters over loaded entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparator {
    /// Property value equals the given value.
    Equals(Value),
}

impl Comparator {
    /// Evaluates the comparison against a (possibly absent) property.
    ///
    /// Absent properties never match.
    #[must_use]
    pub fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Comparator::Equals(expected) => value == Some(expected),
        }
    }
}

/// A declarative query over one or more entity types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    /// Entity types to match.
    pub types: Vec<String>,
    /// Resource instances to query; empty means "wherever loaded".
    pub resources: Vec<String>,
    /// Restrict to these identifiers.
    pub ids: Vec<Identifier>,
    /// Property name to comparator.
    pub property_filter: BTreeMap<String, Comparator>,
    /// Turns the result into a tree keyed by this property.
    pub parent_property: Option<String>,
    /// Keep the result updated as new revisions commit.
    pub live: bool,
    /// Properties the caller wants; empty means all.
    pub requested_properties: Vec<String>,
}

impl Query {
    /// Starts a query for one entity type.
    #[must_use]
    pub fn of_type(entity_type: impl Into<String>) -> Self {
        Self {
            types: vec![entity_type.into()],
            ..Self::default()
        }
    }

    /// Restricts to a resource instance.
    #[must_use]
    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(resource.into());
        self
    }

    /// Restricts to an identifier.
    #[must_use]
    pub fn id(mut self, id: Identifier) -> Self {
        self.ids.push(id);
        self
    }

    /// Adds an equality filter on a property.
    #[must_use]
    pub fn filter_eq(mut self, property: impl Into<String>, value: Value) -> Self {
        self.property_filter
            .insert(property.into(), Comparator::Equals(value));
        self
    }

    /// Requests a tree shaped by the given parent property.
    #[must_use]
    pub fn parent_property(mut self, property: impl Into<String>) -> Self {
        self.parent_property = Some(property.into());
        self
    }

    /// Requests live updates.
    #[must_use]
    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Requests a subset of properties.
    #[must_use]
    pub fn request_property(mut self, property: impl Into<String>) -> Self {
        self.requested_properties.push(property.into());
        self
    }

    /// True if the query names this type.
    #[must_use]
    pub fn matches_type(&self, entity_type: &str) -> bool {
        self.types.iter().any(|t| t == entity_type)
    }

    /// Encodes the query for the synchronize-request wire payload.
    pub fn to_value(&self) -> Value {
        let filter: Vec<(Value, Value)> = self
            .property_filter
            .iter()
            .map(|(name, Comparator::Equals(value))| {
                (Value::Text(name.clone()), value.clone())
            })
            .collect();
        Value::map(vec![
            (
                Value::Text("types".into()),
                Value::Array(self.types.iter().map(|t| Value::Text(t.clone())).collect()),
            ),
            (
                Value::Text("ids".into()),
                Value::Array(
                    self.ids
                        .iter()
                        .map(|id| Value::Bytes(id.as_bytes().to_vec()))
                        .collect(),
                ),
            ),
            (Value::Text("filter".into()), Value::map(filter)),
        ])
    }

    /// Decodes a synchronize-request wire payload.
    ///
    /// # Errors
    ///
    /// Malformed payloads are protocol errors.
    pub fn from_value(value: &Value) -> Result<Self> {
        let mut query = Query::default();
        if let Some(types) = value.get("types").and_then(Value::as_array) {
            for t in types {
                query.types.push(
                    t.as_text()
                        .ok_or_else(|| Error::protocol("query type is not text"))?
                        .to_string(),
                );
            }
        }
        if let Some(ids) = value.get("ids").and_then(Value::as_array) {
            for id in ids {
                let bytes = id
                    .as_bytes()
                    .ok_or_else(|| Error::protocol("query id is not bytes"))?;
                query.ids.push(Identifier::from_internal_bytes(bytes)?);
            }
        }
        if let Some(filter) = value.get("filter").and_then(Value::as_map) {
            for (name, val) in filter {
                let name = name
                    .as_text()
                    .ok_or_else(|| Error::protocol("filter key is not text"))?;
                query
                    .property_filter
                    .insert(name.to_string(), Comparator::Equals(val.clone()));
            }
        }
        Ok(query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_matching() {
        let cmp = Comparator::Equals(Value::Text("test1".into()));
        assert!(cmp.matches(Some(&Value::Text("test1".into()))));
        assert!(!cmp.matches(Some(&Value::Text("other".into()))));
        assert!(!cmp.matches(None));
    }

    #[test]
    fn builder_accumulates() {
        let id = Identifier::generate();
        let query = Query::of_type("mail")
            .resource("r1")
            .id(id)
            .filter_eq("uid", Value::Text("u".into()))
            .live(true);
        assert!(query.matches_type("mail"));
        assert!(!query.matches_type("folder"));
        assert_eq!(query.resources, vec!["r1"]);
        assert_eq!(query.ids, vec![id]);
        assert!(query.live);
    }

    #[test]
    fn wire_roundtrip() {
        let query = Query::of_type("mail")
            .id(Identifier::generate())
            .filter_eq("folder", Value::Text("inbox".into()));
        let decoded = Query::from_value(&query.to_value()).unwrap();
        assert_eq!(decoded.types, query.types);
        assert_eq!(decoded.ids, query.ids);
        assert_eq!(decoded.property_filter, query.property_filter);
    }
}
