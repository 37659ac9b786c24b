//! Per-type adaptors: the capability set the core knows about a type.
//!
//! The engine is schema-agnostic; everything type-specific lives in a
//! small declarative capability record held in a registry keyed by
//! type name.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// Capabilities declared for one entity type.
#[derive(Debug, Clone)]
pub struct TypeAdaptor {
    type_name: String,
    declared_properties: Vec<String>,
    indexed_properties: Vec<String>,
    comparable_properties: Vec<String>,
}

impl TypeAdaptor {
    /// Declares a type with its property surface.
    ///
    /// `indexed` properties get a secondary index; `comparable`
    /// properties are what the synchronizer diffs to decide whether a
    /// remote fetch actually changed anything. Both must be subsets of
    /// `declared`.
    #[must_use]
    pub fn new(
        type_name: impl Into<String>,
        declared: &[&str],
        indexed: &[&str],
        comparable: &[&str],
    ) -> Self {
        let declared_properties: Vec<String> = declared.iter().map(ToString::to_string).collect();
        debug_assert!(indexed
            .iter()
            .all(|p| declared_properties.iter().any(|d| d == p)));
        debug_assert!(comparable
            .iter()
            .all(|p| declared_properties.iter().any(|d| d == p)));
        Self {
            type_name: type_name.into(),
            declared_properties,
            indexed_properties: indexed.iter().map(ToString::to_string).collect(),
            comparable_properties: comparable.iter().map(ToString::to_string).collect(),
        }
    }

    /// The type name.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// All declared property names.
    #[must_use]
    pub fn declared_properties(&self) -> &[String] {
        &self.declared_properties
    }

    /// Properties maintained in secondary indexes.
    #[must_use]
    pub fn indexed_properties(&self) -> &[String] {
        &self.indexed_properties
    }

    /// Properties the synchronizer compares for change detection.
    #[must_use]
    pub fn comparable_properties(&self) -> &[String] {
        &self.comparable_properties
    }

    /// True if the property participates in a secondary index.
    #[must_use]
    pub fn is_indexed(&self, property: &str) -> bool {
        self.indexed_properties.iter().any(|p| p == property)
    }
}

/// Registry of adaptors by type name.
#[derive(Debug, Default)]
pub struct AdaptorRegistry {
    adaptors: HashMap<String, Arc<TypeAdaptor>>,
}

impl AdaptorRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adaptor, replacing any previous one for the type.
    pub fn register(&mut self, adaptor: TypeAdaptor) {
        self.adaptors
            .insert(adaptor.type_name().to_string(), Arc::new(adaptor));
    }

    /// Looks up the adaptor for a type.
    ///
    /// # Errors
    ///
    /// Unknown types are a misconfiguration: commands for them cannot
    /// be processed.
    pub fn get(&self, type_name: &str) -> Result<Arc<TypeAdaptor>> {
        self.adaptors
            .get(type_name)
            .cloned()
            .ok_or_else(|| Error::unknown_type(type_name))
    }

    /// All registered type names, sorted.
    #[must_use]
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adaptors.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let mut registry = AdaptorRegistry::new();
        registry.register(TypeAdaptor::new(
            "mail",
            &["uid", "subject", "sender", "folder"],
            &["uid", "folder"],
            &["uid", "subject", "sender"],
        ));

        let adaptor = registry.get("mail").unwrap();
        assert!(adaptor.is_indexed("uid"));
        assert!(!adaptor.is_indexed("subject"));
        assert!(registry.get("event").is_err());
    }

    #[test]
    fn type_names_sorted() {
        let mut registry = AdaptorRegistry::new();
        registry.register(TypeAdaptor::new("mail", &[], &[], &[]));
        registry.register(TypeAdaptor::new("folder", &["name"], &[], &["name"]));
        assert_eq!(registry.type_names(), vec!["folder", "mail"]);
    }
}
