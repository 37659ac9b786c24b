//! proptest generators for codec values and key material.

use pimdb_codec::Value;
use pimdb_core::{Identifier, Key, Revision};
use proptest::prelude::*;

/// Strategy for scalar codec values.
pub fn arb_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Integer),
        proptest::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
        "[a-zA-Z0-9 @.]{0,32}".prop_map(Value::Text),
    ]
}

/// Strategy for arbitrarily nested codec values (bounded depth).
pub fn arb_value() -> impl Strategy<Value = Value> {
    arb_scalar().prop_recursive(3, 32, 8, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..8).prop_map(Value::Array),
            proptest::collection::vec(("[a-z]{1,12}", inner), 0..8).prop_map(|pairs| {
                Value::map(
                    pairs
                        .into_iter()
                        .map(|(k, v)| (Value::Text(k), v))
                        .collect(),
                )
            }),
        ]
    })
}

/// Strategy for identifiers.
pub fn arb_identifier() -> impl Strategy<Value = Identifier> {
    any::<[u8; 16]>().prop_map(Identifier::from_bytes)
}

/// Strategy for revisions.
pub fn arb_revision() -> impl Strategy<Value = Revision> {
    any::<u64>().prop_map(Revision::new)
}

/// Strategy for entity keys.
pub fn arb_key() -> impl Strategy<Value = Key> {
    (arb_identifier(), arb_revision()).prop_map(|(id, revision)| Key::new(id, revision))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pimdb_codec::{decode, encode};

    proptest! {
        #[test]
        fn value_roundtrip(value in arb_value()) {
            let bytes = encode(&value).unwrap();
            let decoded = decode(&bytes).unwrap();
            prop_assert_eq!(&decoded, &value);
            // Deterministic re-encoding.
            prop_assert_eq!(encode(&decoded).unwrap(), bytes);
        }

        #[test]
        fn key_roundtrip(key in arb_key()) {
            let bytes = key.to_internal_bytes();
            prop_assert_eq!(Key::from_internal_bytes(&bytes).unwrap(), key);
        }

        #[test]
        fn identifier_display_roundtrip(id in arb_identifier()) {
            let text = id.to_display_string();
            prop_assert_eq!(Identifier::from_display_string(&text).unwrap(), id);
        }

        #[test]
        fn revision_order_matches_byte_order(a in arb_revision(), b in arb_revision()) {
            let (ab, bb) = (a.to_internal_bytes(), b.to_internal_bytes());
            prop_assert_eq!(a.cmp(&b), ab.cmp(&bb));
        }
    }
}
