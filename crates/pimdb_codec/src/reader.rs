//! Canonical buffer reader.

use crate::error::{CodecError, CodecResult};
use crate::value::Value;
use crate::writer::{
    unzigzag, TAG_ARRAY, TAG_BYTES, TAG_FALSE, TAG_INT, TAG_MAP, TAG_NULL, TAG_TEXT, TAG_TRUE,
};

/// Maximum declared length for byte strings and text.
///
/// Guards allocation from untrusted input; far above any real entity.
const MAX_LENGTH: u64 = 256 * 1024 * 1024;

/// Maximum declared element count for arrays and maps.
const MAX_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Decodes a single value from canonical buffer bytes.
///
/// Trailing bytes after the value are an error.
///
/// # Errors
///
/// Returns an error for truncated input, unknown tags, non-minimal
/// varints, unsorted map keys or invalid UTF-8.
pub fn decode(bytes: &[u8]) -> CodecResult<Value> {
    let mut reader = BufferReader::new(bytes);
    let value = reader.read_value()?;
    if !reader.is_empty() {
        return Err(CodecError::malformed("trailing bytes after value"));
    }
    Ok(value)
}

/// A canonical buffer reader.
pub struct BufferReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BufferReader<'a> {
    /// Creates a reader over the given bytes.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// True when all bytes have been consumed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Current read offset.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Reads the next value.
    pub fn read_value(&mut self) -> CodecResult<Value> {
        let offset = self.pos;
        let tag = self.read_byte()?;
        match tag {
            TAG_NULL => Ok(Value::Null),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_INT => Ok(Value::Integer(unzigzag(self.read_varint()?))),
            TAG_BYTES => {
                let len = self.read_length(MAX_LENGTH)?;
                Ok(Value::Bytes(self.read_slice(len)?.to_vec()))
            }
            TAG_TEXT => {
                let len = self.read_length(MAX_LENGTH)?;
                let raw = self.read_slice(len)?;
                let text = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
                Ok(Value::Text(text.to_string()))
            }
            TAG_ARRAY => {
                let count = self.read_length(MAX_ELEMENTS)?;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.read_value()?);
                }
                Ok(Value::Array(items))
            }
            TAG_MAP => {
                let count = self.read_length(MAX_ELEMENTS)?;
                let mut pairs: Vec<(Value, Value)> = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let key = self.read_value()?;
                    if let Some((last_key, _)) = pairs.last() {
                        if *last_key >= key {
                            return Err(CodecError::non_canonical(
                                "map keys not strictly ascending",
                            ));
                        }
                    }
                    let value = self.read_value()?;
                    pairs.push((key, value));
                }
                Ok(Value::Map(pairs))
            }
            other => Err(CodecError::UnknownTag { tag: other, offset }),
        }
    }

    fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(CodecError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_slice(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(CodecError::LengthOverflow { length: len as u64 })?;
        if end > self.data.len() {
            return Err(CodecError::Truncated { offset: self.pos });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_varint(&mut self) -> CodecResult<u64> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_byte()?;
            if shift == 63 && byte > 1 {
                return Err(CodecError::LengthOverflow { length: u64::MAX });
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                // A trailing zero continuation byte would be a longer
                // encoding of the same number.
                if byte == 0 && shift != 0 {
                    return Err(CodecError::non_canonical("non-minimal varint"));
                }
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(CodecError::LengthOverflow { length: u64::MAX });
            }
        }
    }

    fn read_length(&mut self, limit: u64) -> CodecResult<usize> {
        let len = self.read_varint()?;
        if len > limit {
            return Err(CodecError::LengthOverflow { length: len });
        }
        Ok(len as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::encode;

    fn roundtrip(value: Value) {
        let bytes = encode(&value).unwrap();
        assert_eq!(decode(&bytes).unwrap(), value);
        // Deterministic: encode(decode(bytes)) == bytes
        assert_eq!(encode(&decode(&bytes).unwrap()).unwrap(), bytes);
    }

    #[test]
    fn scalar_roundtrips() {
        roundtrip(Value::Null);
        roundtrip(Value::Bool(false));
        roundtrip(Value::Bool(true));
        roundtrip(Value::Integer(0));
        roundtrip(Value::Integer(i64::MIN));
        roundtrip(Value::Integer(i64::MAX));
        roundtrip(Value::Bytes(vec![0, 1, 2, 255]));
        roundtrip(Value::Text("sürrogate-free ünïcode".into()));
    }

    #[test]
    fn nested_roundtrips() {
        roundtrip(Value::Array(vec![
            Value::Integer(1),
            Value::Text("two".into()),
            Value::Array(vec![Value::Null]),
        ]));
        roundtrip(Value::map(vec![
            (Value::Text("subject".into()), "hello".into()),
            (Value::Text("uid".into()), "test1".into()),
            (
                Value::Text("meta".into()),
                Value::map(vec![(Value::Text("rev".into()), Value::Integer(7))]),
            ),
        ]));
    }

    #[test]
    fn empty_input_is_truncated() {
        assert!(matches!(decode(&[]), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(matches!(
            decode(&[0x42]),
            Err(CodecError::UnknownTag { tag: 0x42, .. })
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode(&Value::Null).unwrap();
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(CodecError::Malformed { .. })));
    }

    #[test]
    fn unsorted_map_rejected() {
        // Hand-encode a map with keys out of order: {b: 1, a: 1}
        let mut bytes = vec![super::TAG_MAP, 2];
        bytes.extend(encode(&Value::Text("b".into())).unwrap());
        bytes.extend(encode(&Value::Integer(1)).unwrap());
        bytes.extend(encode(&Value::Text("a".into())).unwrap());
        bytes.extend(encode(&Value::Integer(1)).unwrap());
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::NonCanonical { .. })
        ));
    }

    #[test]
    fn duplicate_map_key_rejected() {
        let mut bytes = vec![super::TAG_MAP, 2];
        for _ in 0..2 {
            bytes.extend(encode(&Value::Text("a".into())).unwrap());
            bytes.extend(encode(&Value::Integer(1)).unwrap());
        }
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::NonCanonical { .. })
        ));
    }

    #[test]
    fn non_minimal_varint_rejected() {
        // 0x80 0x00 is a two-byte encoding of zero.
        let bytes = vec![super::TAG_INT, 0x80, 0x00];
        assert!(matches!(
            decode(&bytes),
            Err(CodecError::NonCanonical { .. })
        ));
    }

    #[test]
    fn truncated_text_rejected() {
        let mut bytes = encode(&Value::Text("hello".into())).unwrap();
        bytes.truncate(bytes.len() - 2);
        assert!(matches!(decode(&bytes), Err(CodecError::Truncated { .. })));
    }
}
