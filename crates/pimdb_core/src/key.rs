//! Identifier, revision and key encodings.
//!
//! Entity keys concatenate a 128-bit identifier with a fixed-width
//! revision so that all versions of one entity sort together, latest
//! last. Internal forms are what the storage layer sees; display forms
//! are for logs and wire payloads.

use crate::error::{Error, Result};
use std::fmt;
use uuid::Uuid;

/// Stable local primary key of an entity: a 128-bit UUID.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier([u8; 16]);

impl Identifier {
    /// Size of the internal byte form.
    pub const INTERNAL_SIZE: usize = 16;
    /// Size of the display byte form (hyphenated UUID).
    pub const DISPLAY_SIZE: usize = 36;

    /// Creates a fresh random identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Creates an identifier from its raw 16 bytes.
    #[inline]
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw 16-byte internal form.
    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Parses the internal byte form.
    ///
    /// # Errors
    ///
    /// The slice must be exactly 16 bytes.
    pub fn from_internal_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 16] = bytes.try_into().map_err(|_| {
            Error::corruption(format!("identifier must be 16 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(array))
    }

    /// The canonical 36-character hyphenated display form.
    #[must_use]
    pub fn to_display_string(&self) -> String {
        Uuid::from_bytes(self.0).hyphenated().to_string()
    }

    /// Parses the display form.
    ///
    /// # Errors
    ///
    /// The input must be a valid hyphenated UUID.
    pub fn from_display_string(text: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(text)
            .map_err(|e| Error::protocol(format!("invalid identifier {text:?}: {e}")))?;
        Ok(Self(uuid.into_bytes()))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.to_display_string())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

impl From<Uuid> for Identifier {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.into_bytes())
    }
}

/// The global monotonic version counter of a resource instance.
///
/// Serialized as zero-padded decimal so the lexicographic order of the
/// internal form equals numeric order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(u64);

impl Revision {
    /// Size of the internal byte form (19 zero-padded digits).
    pub const INTERNAL_SIZE: usize = 19;

    /// The revision of an empty store.
    pub const ZERO: Revision = Revision(0);

    /// Creates a revision from its numeric value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The numeric value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The next revision.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// The fixed-width internal byte form.
    #[must_use]
    pub fn to_internal_bytes(self) -> [u8; Self::INTERNAL_SIZE] {
        let text = format!("{:019}", self.0);
        let mut out = [0u8; Self::INTERNAL_SIZE];
        out.copy_from_slice(text.as_bytes());
        out
    }

    /// Parses the internal byte form.
    ///
    /// # Errors
    ///
    /// The slice must be exactly 19 ASCII digits.
    pub fn from_internal_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::INTERNAL_SIZE {
            return Err(Error::corruption(format!(
                "revision must be {} bytes, got {}",
                Self::INTERNAL_SIZE,
                bytes.len()
            )));
        }
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::corruption("revision bytes not ASCII"))?;
        let value: u64 = text
            .parse()
            .map_err(|_| Error::corruption(format!("revision bytes not numeric: {text:?}")))?;
        Ok(Self(value))
    }

    /// The display form (same digits as the internal form).
    #[must_use]
    pub fn to_display_string(self) -> String {
        format!("{:019}", self.0)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:019}", self.0)
    }
}

/// An entity version address: identifier plus revision.
///
/// Internal form is the concatenation of the two internal forms, so
/// versions of one identifier are contiguous and ordered by revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    id: Identifier,
    revision: Revision,
}

impl Key {
    /// Size of the internal byte form.
    pub const INTERNAL_SIZE: usize = Identifier::INTERNAL_SIZE + Revision::INTERNAL_SIZE;

    /// Creates a key.
    #[must_use]
    pub const fn new(id: Identifier, revision: Revision) -> Self {
        Self { id, revision }
    }

    /// The identifier component.
    #[must_use]
    pub const fn identifier(&self) -> Identifier {
        self.id
    }

    /// The revision component.
    #[must_use]
    pub const fn revision(&self) -> Revision {
        self.revision
    }

    /// Returns this key with a different revision.
    #[must_use]
    pub const fn with_revision(self, revision: Revision) -> Self {
        Self {
            id: self.id,
            revision,
        }
    }

    /// The fixed-width internal byte form.
    #[must_use]
    pub fn to_internal_bytes(&self) -> [u8; Self::INTERNAL_SIZE] {
        let mut out = [0u8; Self::INTERNAL_SIZE];
        out[..Identifier::INTERNAL_SIZE].copy_from_slice(self.id.as_bytes());
        out[Identifier::INTERNAL_SIZE..].copy_from_slice(&self.revision.to_internal_bytes());
        out
    }

    /// Parses the internal byte form.
    ///
    /// # Errors
    ///
    /// The slice must be exactly [`Key::INTERNAL_SIZE`] bytes.
    pub fn from_internal_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::INTERNAL_SIZE {
            return Err(Error::corruption(format!(
                "key must be {} bytes, got {}",
                Self::INTERNAL_SIZE,
                bytes.len()
            )));
        }
        Ok(Self {
            id: Identifier::from_internal_bytes(&bytes[..Identifier::INTERNAL_SIZE])?,
            revision: Revision::from_internal_bytes(&bytes[Identifier::INTERNAL_SIZE..])?,
        })
    }

    /// The display form: hyphenated identifier plus padded revision.
    #[must_use]
    pub fn to_display_string(&self) -> String {
        format!("{}{}", self.id.to_display_string(), self.revision)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_display_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_internal_roundtrip() {
        let id = Identifier::generate();
        let bytes = id.as_bytes().to_vec();
        assert_eq!(Identifier::from_internal_bytes(&bytes).unwrap(), id);
    }

    #[test]
    fn identifier_display_roundtrip() {
        let id = Identifier::generate();
        let text = id.to_display_string();
        assert_eq!(text.len(), Identifier::DISPLAY_SIZE);
        assert_eq!(Identifier::from_display_string(&text).unwrap(), id);
    }

    #[test]
    fn identifier_rejects_wrong_length() {
        assert!(Identifier::from_internal_bytes(&[0u8; 15]).is_err());
        assert!(Identifier::from_internal_bytes(&[0u8; 17]).is_err());
    }

    #[test]
    fn revision_lexicographic_order_is_numeric_order() {
        let revisions = [0u64, 1, 9, 10, 99, 100, 1_000_000, u64::MAX / 2];
        let mut encoded: Vec<[u8; Revision::INTERNAL_SIZE]> = revisions
            .iter()
            .map(|&r| Revision::new(r).to_internal_bytes())
            .collect();
        let sorted = encoded.clone();
        encoded.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn revision_roundtrip() {
        for value in [0u64, 1, 42, 1 << 40] {
            let rev = Revision::new(value);
            assert_eq!(
                Revision::from_internal_bytes(&rev.to_internal_bytes()).unwrap(),
                rev
            );
        }
    }

    #[test]
    fn revision_display_is_padded() {
        assert_eq!(Revision::new(7).to_display_string(), "0000000000000000007");
    }

    #[test]
    fn key_roundtrip() {
        let key = Key::new(Identifier::generate(), Revision::new(12345));
        let bytes = key.to_internal_bytes();
        assert_eq!(bytes.len(), Key::INTERNAL_SIZE);
        assert_eq!(Key::from_internal_bytes(&bytes).unwrap(), key);
    }

    #[test]
    fn keys_sort_by_id_then_revision() {
        let id = Identifier::from_bytes([1; 16]);
        let other = Identifier::from_bytes([2; 16]);
        let a = Key::new(id, Revision::new(1)).to_internal_bytes();
        let b = Key::new(id, Revision::new(2)).to_internal_bytes();
        let c = Key::new(other, Revision::new(1)).to_internal_bytes();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn with_revision_replaces_only_revision() {
        let key = Key::new(Identifier::generate(), Revision::new(1));
        let bumped = key.with_revision(Revision::new(9));
        assert_eq!(bumped.identifier(), key.identifier());
        assert_eq!(bumped.revision(), Revision::new(9));
    }
}
