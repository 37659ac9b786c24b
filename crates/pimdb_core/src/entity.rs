//! Entity buffers and metadata.

use crate::error::{Error, Result};
use crate::key::{Identifier, Revision};
use pimdb_codec::{decode, encode, Value};
use std::collections::BTreeMap;

/// What a committed revision did to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// First revision of the entity.
    Creation,
    /// A later revision of an existing entity.
    Modification,
    /// Terminal revision; no higher revision of the same id may exist.
    Removal,
}

impl Operation {
    /// Numeric code used in buffers.
    #[must_use]
    pub fn to_code(self) -> i64 {
        match self {
            Operation::Creation => 1,
            Operation::Modification => 2,
            Operation::Removal => 3,
        }
    }

    /// Parses the numeric code.
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Operation::Creation),
            2 => Some(Operation::Modification),
            3 => Some(Operation::Removal),
            _ => None,
        }
    }
}

/// Bookkeeping attached to every entity version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Revision this version was committed at.
    pub revision: Revision,
    /// What this version did.
    pub operation: Operation,
    /// Whether the write-back consumer has replayed this version to
    /// the remote source, or the version originated there.
    pub replayed_to_source: bool,
    /// Whether all preprocessors ran for this version.
    pub processed: bool,
}

impl Metadata {
    /// Creates metadata for a freshly committed version.
    #[must_use]
    pub fn new(revision: Revision, operation: Operation) -> Self {
        Self {
            revision,
            operation,
            replayed_to_source: false,
            processed: false,
        }
    }
}

/// One version of a user-visible entity.
///
/// The engine treats the property map as opaque values; only the
/// type's adaptor knows which properties exist and what they mean.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    /// The entity type name ("mail", "folder", ...).
    pub entity_type: String,
    /// Stable local primary key.
    pub id: Identifier,
    /// Version bookkeeping.
    pub metadata: Metadata,
    /// The property map.
    pub properties: BTreeMap<String, Value>,
}

impl Entity {
    /// Creates an entity version.
    #[must_use]
    pub fn new(
        entity_type: impl Into<String>,
        id: Identifier,
        metadata: Metadata,
        properties: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            id,
            metadata,
            properties,
        }
    }

    /// Looks up a property value.
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name).filter(|v| !v.is_null())
    }

    /// The operation of this version.
    #[must_use]
    pub fn operation(&self) -> Operation {
        self.metadata.operation
    }

    /// The revision of this version.
    #[must_use]
    pub fn revision(&self) -> Revision {
        self.metadata.revision
    }

    /// Encodes the entity to its canonical buffer form.
    ///
    /// The buffer is self-describing: type, id, metadata and the
    /// property map are all present, so decode followed by encode
    /// reproduces identical bytes.
    pub fn to_buffer(&self) -> Result<Vec<u8>> {
        let properties: Vec<(Value, Value)> = self
            .properties
            .iter()
            .map(|(name, value)| (Value::Text(name.clone()), value.clone()))
            .collect();
        let buffer = Value::map(vec![
            (Value::Text("type".into()), Value::Text(self.entity_type.clone())),
            (
                Value::Text("id".into()),
                Value::Bytes(self.id.as_bytes().to_vec()),
            ),
            (
                Value::Text("revision".into()),
                Value::Integer(i64::try_from(self.metadata.revision.as_u64()).unwrap_or(i64::MAX)),
            ),
            (
                Value::Text("operation".into()),
                Value::Integer(self.metadata.operation.to_code()),
            ),
            (
                Value::Text("replayed".into()),
                Value::Bool(self.metadata.replayed_to_source),
            ),
            (
                Value::Text("processed".into()),
                Value::Bool(self.metadata.processed),
            ),
            (Value::Text("properties".into()), Value::map(properties)),
        ]);
        Ok(encode(&buffer)?)
    }

    /// Decodes an entity from its buffer form.
    ///
    /// # Errors
    ///
    /// Missing or mistyped fields are a corruption error: buffers only
    /// enter storage through [`Entity::to_buffer`].
    pub fn from_buffer(bytes: &[u8]) -> Result<Self> {
        let value = decode(bytes)?;
        let field = |name: &str| {
            value
                .get(name)
                .ok_or_else(|| Error::corruption(format!("entity buffer missing {name:?}")))
        };

        let entity_type = field("type")?
            .as_text()
            .ok_or_else(|| Error::corruption("entity type is not text"))?
            .to_string();
        let id = Identifier::from_internal_bytes(
            field("id")?
                .as_bytes()
                .ok_or_else(|| Error::corruption("entity id is not bytes"))?,
        )?;
        let revision_raw = field("revision")?
            .as_integer()
            .ok_or_else(|| Error::corruption("entity revision is not an integer"))?;
        let revision = Revision::new(
            u64::try_from(revision_raw)
                .map_err(|_| Error::corruption("entity revision is negative"))?,
        );
        let operation = field("operation")?
            .as_integer()
            .and_then(Operation::from_code)
            .ok_or_else(|| Error::corruption("entity operation code invalid"))?;
        let replayed_to_source = field("replayed")?
            .as_bool()
            .ok_or_else(|| Error::corruption("entity replayed flag is not a bool"))?;
        let processed = field("processed")?
            .as_bool()
            .ok_or_else(|| Error::corruption("entity processed flag is not a bool"))?;

        let mut properties = BTreeMap::new();
        for (key, val) in field("properties")?
            .as_map()
            .ok_or_else(|| Error::corruption("entity properties is not a map"))?
        {
            let name = key
                .as_text()
                .ok_or_else(|| Error::corruption("property name is not text"))?;
            properties.insert(name.to_string(), val.clone());
        }

        Ok(Self {
            entity_type,
            id,
            metadata: Metadata {
                revision,
                operation,
                replayed_to_source,
                processed,
            },
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Entity {
        let mut properties = BTreeMap::new();
        properties.insert("subject".to_string(), Value::Text("hello".into()));
        properties.insert("uid".to_string(), Value::Text("test1".into()));
        Entity::new(
            "mail",
            Identifier::generate(),
            Metadata::new(Revision::new(4), Operation::Creation),
            properties,
        )
    }

    #[test]
    fn buffer_roundtrip() {
        let entity = sample();
        let bytes = entity.to_buffer().unwrap();
        let decoded = Entity::from_buffer(&bytes).unwrap();
        assert_eq!(decoded, entity);
        // Re-encoding must reproduce identical bytes.
        assert_eq!(decoded.to_buffer().unwrap(), bytes);
    }

    #[test]
    fn property_lookup_skips_null() {
        let mut entity = sample();
        entity
            .properties
            .insert("folder".to_string(), Value::Null);
        assert!(entity.property("folder").is_none());
        assert_eq!(
            entity.property("subject").and_then(Value::as_text),
            Some("hello")
        );
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        let mut bytes = sample().to_buffer().unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(Entity::from_buffer(&bytes).is_err());
    }

    #[test]
    fn operation_codes_roundtrip() {
        for op in [Operation::Creation, Operation::Modification, Operation::Removal] {
            assert_eq!(Operation::from_code(op.to_code()), Some(op));
        }
        assert_eq!(Operation::from_code(0), None);
    }
}
