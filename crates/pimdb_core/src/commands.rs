//! Typed commands and their wire format.
//!
//! Commands travel as length-prefixed records of
//! `{command id: u32, payload: bytes}`; payloads are self-describing
//! codec buffers so peers can decode them without shared schemas.

use crate::entity::Operation;
use crate::error::{Error, Result};
use crate::key::{Identifier, Revision};
use crate::query::Query;
use pimdb_codec::{decode, encode, Value};
use std::collections::BTreeMap;

/// Stable numeric command ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandId {
    /// Create an entity.
    Create = 1,
    /// Modify an entity.
    Modify = 2,
    /// Remove an entity.
    Delete = 3,
    /// Flush sentinel that rides the pipeline and replay chain.
    Flush = 4,
    /// A client declares it has consumed up to a revision.
    RevisionReplayed = 5,
    /// Ask the synchronizer to pull from the remote source.
    SynchronizeRequest = 6,
    /// Shut the resource down.
    Shutdown = 7,
}

impl CommandId {
    /// Parses a wire command id.
    #[must_use]
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Create),
            2 => Some(Self::Modify),
            3 => Some(Self::Delete),
            4 => Some(Self::Flush),
            5 => Some(Self::RevisionReplayed),
            6 => Some(Self::SynchronizeRequest),
            7 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// A decoded command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Create an entity with the given id and properties.
    Create {
        /// Entity type name.
        entity_type: String,
        /// Pre-allocated local id.
        id: Identifier,
        /// Initial property map.
        properties: BTreeMap<String, Value>,
    },
    /// Modify an entity.
    ///
    /// Present keys replace the stored value, `Null` deletes the
    /// property, absent keys are kept.
    Modify {
        /// Entity type name.
        entity_type: String,
        /// Target id.
        id: Identifier,
        /// Property changes.
        properties: BTreeMap<String, Value>,
    },
    /// Remove an entity (terminal).
    Delete {
        /// Entity type name.
        entity_type: String,
        /// Target id.
        id: Identifier,
    },
    /// Flush sentinel.
    Flush {
        /// Client-chosen token reported back in `FlushComplete`.
        flush_id: String,
    },
    /// Client-declared replay low-water mark.
    RevisionReplayed {
        /// Highest revision the client has consumed.
        revision: Revision,
    },
    /// Remote synchronization request.
    SynchronizeRequest {
        /// What to synchronize.
        query: Query,
    },
    /// Shut the resource down.
    Shutdown,
}

impl Command {
    /// The command's wire id.
    #[must_use]
    pub fn id(&self) -> CommandId {
        match self {
            Command::Create { .. } => CommandId::Create,
            Command::Modify { .. } => CommandId::Modify,
            Command::Delete { .. } => CommandId::Delete,
            Command::Flush { .. } => CommandId::Flush,
            Command::RevisionReplayed { .. } => CommandId::RevisionReplayed,
            Command::SynchronizeRequest { .. } => CommandId::SynchronizeRequest,
            Command::Shutdown => CommandId::Shutdown,
        }
    }

    /// The operation an entity command performs, if any.
    #[must_use]
    pub fn operation(&self) -> Option<Operation> {
        match self {
            Command::Create { .. } => Some(Operation::Creation),
            Command::Modify { .. } => Some(Operation::Modification),
            Command::Delete { .. } => Some(Operation::Removal),
            _ => None,
        }
    }

    /// Encodes the payload buffer (without the id prefix).
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let value = match self {
            Command::Create {
                entity_type,
                id,
                properties,
            }
            | Command::Modify {
                entity_type,
                id,
                properties,
            } => {
                let props: Vec<(Value, Value)> = properties
                    .iter()
                    .map(|(k, v)| (Value::Text(k.clone()), v.clone()))
                    .collect();
                Value::map(vec![
                    (Value::Text("type".into()), Value::Text(entity_type.clone())),
                    (
                        Value::Text("id".into()),
                        Value::Bytes(id.as_bytes().to_vec()),
                    ),
                    (Value::Text("properties".into()), Value::map(props)),
                ])
            }
            Command::Delete { entity_type, id } => Value::map(vec![
                (Value::Text("type".into()), Value::Text(entity_type.clone())),
                (
                    Value::Text("id".into()),
                    Value::Bytes(id.as_bytes().to_vec()),
                ),
            ]),
            Command::Flush { flush_id } => Value::map(vec![(
                Value::Text("flushId".into()),
                Value::Text(flush_id.clone()),
            )]),
            Command::RevisionReplayed { revision } => Value::map(vec![(
                Value::Text("revision".into()),
                Value::Integer(i64::try_from(revision.as_u64()).unwrap_or(i64::MAX)),
            )]),
            Command::SynchronizeRequest { query } => query.to_value(),
            Command::Shutdown => Value::map(vec![]),
        };
        Ok(encode(&value)?)
    }

    /// Decodes a command from its wire id and payload buffer.
    ///
    /// # Errors
    ///
    /// Unknown ids and malformed buffers are protocol errors.
    pub fn decode(raw_id: u32, payload: &[u8]) -> Result<Command> {
        let id = CommandId::from_u32(raw_id)
            .ok_or_else(|| Error::protocol(format!("unknown command id {raw_id}")))?;
        let value = decode(payload)?;

        let entity_head = |value: &Value| -> Result<(String, Identifier)> {
            let entity_type = value
                .get("type")
                .and_then(Value::as_text)
                .ok_or_else(|| Error::protocol("command missing entity type"))?
                .to_string();
            let id = Identifier::from_internal_bytes(
                value
                    .get("id")
                    .and_then(Value::as_bytes)
                    .ok_or_else(|| Error::protocol("command missing entity id"))?,
            )?;
            Ok((entity_type, id))
        };
        let properties = |value: &Value| -> Result<BTreeMap<String, Value>> {
            let mut out = BTreeMap::new();
            for (k, v) in value
                .get("properties")
                .and_then(Value::as_map)
                .ok_or_else(|| Error::protocol("command missing properties"))?
            {
                let name = k
                    .as_text()
                    .ok_or_else(|| Error::protocol("property name is not text"))?;
                out.insert(name.to_string(), v.clone());
            }
            Ok(out)
        };

        match id {
            CommandId::Create => {
                let (entity_type, id) = entity_head(&value)?;
                Ok(Command::Create {
                    entity_type,
                    id,
                    properties: properties(&value)?,
                })
            }
            CommandId::Modify => {
                let (entity_type, id) = entity_head(&value)?;
                Ok(Command::Modify {
                    entity_type,
                    id,
                    properties: properties(&value)?,
                })
            }
            CommandId::Delete => {
                let (entity_type, id) = entity_head(&value)?;
                Ok(Command::Delete { entity_type, id })
            }
            CommandId::Flush => Ok(Command::Flush {
                flush_id: value
                    .get("flushId")
                    .and_then(Value::as_text)
                    .ok_or_else(|| Error::protocol("flush command missing flushId"))?
                    .to_string(),
            }),
            CommandId::RevisionReplayed => {
                let raw = value
                    .get("revision")
                    .and_then(Value::as_integer)
                    .ok_or_else(|| Error::protocol("revision-replayed missing revision"))?;
                Ok(Command::RevisionReplayed {
                    revision: Revision::new(
                        u64::try_from(raw)
                            .map_err(|_| Error::protocol("negative revision"))?,
                    ),
                })
            }
            CommandId::SynchronizeRequest => Ok(Command::SynchronizeRequest {
                query: Query::from_value(&value)?,
            }),
            CommandId::Shutdown => Ok(Command::Shutdown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(command: Command) {
        let payload = command.encode_payload().unwrap();
        let decoded = Command::decode(command.id() as u32, &payload).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn entity_command_roundtrips() {
        let mut properties = BTreeMap::new();
        properties.insert("subject".to_string(), Value::Text("hello".into()));
        roundtrip(Command::Create {
            entity_type: "mail".into(),
            id: Identifier::generate(),
            properties: properties.clone(),
        });
        roundtrip(Command::Modify {
            entity_type: "mail".into(),
            id: Identifier::generate(),
            properties,
        });
        roundtrip(Command::Delete {
            entity_type: "mail".into(),
            id: Identifier::generate(),
        });
    }

    #[test]
    fn control_command_roundtrips() {
        roundtrip(Command::Flush {
            flush_id: "f-1".into(),
        });
        roundtrip(Command::RevisionReplayed {
            revision: Revision::new(42),
        });
        roundtrip(Command::Shutdown);
    }

    #[test]
    fn synchronize_request_roundtrips() {
        let query = Query::of_type("mail").filter_eq("folder", Value::Text("inbox".into()));
        let command = Command::SynchronizeRequest { query };
        let payload = command.encode_payload().unwrap();
        let decoded = Command::decode(CommandId::SynchronizeRequest as u32, &payload).unwrap();
        match decoded {
            Command::SynchronizeRequest { query } => {
                assert_eq!(query.types, vec!["mail"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn unknown_command_id_is_protocol_error() {
        let err = Command::decode(999, &[]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }

    #[test]
    fn malformed_payload_is_protocol_error() {
        let err = Command::decode(CommandId::Create as u32, &[0xff, 0x00]).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }
}
