//! Document identifiers and the collection-aware wire-key encoding (spec §3).
//!
//! Grounded in `original_source/couchbase/document_id.cxx` and
//! `original_source/couchbase/utils/unsigned_leb128.hxx`: the character-class validation and
//! LEB128 collection prefixing are carried over in semantics (not translated line-for-line).

use crate::error::{Error, Result};

const MAX_KEY_LEN: usize = 250;
const MAX_NAME_LEN: usize = 251;
pub(crate) const DEFAULT_SCOPE: &str = "_default";
pub(crate) const DEFAULT_COLLECTION: &str = "_default";

/// `{bucket, scope, collection, key}` — the tuple that names one document (spec §3). Scope and
/// collection default to `_default`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentId {
    /// Bucket the document lives in.
    pub bucket: String,
    /// Scope name; `_default` if unspecified.
    pub scope: String,
    /// Collection name; `_default` if unspecified.
    pub collection: String,
    /// The document's key, as bytes (so non-UTF8 keys are representable).
    pub key: Vec<u8>,
}

impl DocumentId {
    /// Builds an id in the default scope and collection.
    pub fn new(bucket: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            bucket: bucket.into(),
            scope: DEFAULT_SCOPE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            key: key.into(),
        }
    }

    /// Builds an id in an explicit scope/collection.
    pub fn with_collection(
        bucket: impl Into<String>,
        scope: impl Into<String>,
        collection: impl Into<String>,
        key: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            scope: scope.into(),
            collection: collection.into(),
            key: key.into(),
        }
    }

    /// Whether this id names the default scope and collection (no LEB128 prefix needed even
    /// when collections are enabled on the server, since UID 0 is always `_default._default`).
    pub(crate) fn has_default_collection(&self) -> bool {
        self.scope == DEFAULT_SCOPE && self.collection == DEFAULT_COLLECTION
    }

    /// Validates the id's key length and scope/collection name character classes, independent
    /// of whether the collection UID is resolvable. Spec §8.12/§8.13.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.key.is_empty() {
            return Err(Error::invalid_argument("key must not be empty"));
        }
        if self.key.len() > MAX_KEY_LEN {
            return Err(Error::invalid_argument(format!(
                "key length {} exceeds the {MAX_KEY_LEN}-byte limit",
                self.key.len()
            )));
        }
        if !self.has_default_collection() {
            validate_collection_element(&self.scope)?;
            validate_collection_element(&self.collection)?;
        }
        Ok(())
    }
}

fn is_valid_collection_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '%')
}

fn validate_collection_element(element: &str) -> Result<()> {
    if element.is_empty() || element.len() > MAX_NAME_LEN {
        return Err(Error::invalid_argument(format!(
            "scope/collection name {element:?} must be 1..={MAX_NAME_LEN} bytes"
        )));
    }
    if !element.chars().all(is_valid_collection_char) {
        return Err(Error::invalid_argument(format!(
            "scope/collection name {element:?} contains a character outside [A-Za-z0-9_%-]"
        )));
    }
    Ok(())
}

/// Encodes `value` as unsigned LEB128, appending to `out` and returning the number of bytes
/// written. Used for both the collection UID prefix and the flexible-framing extras length.
pub(crate) fn write_uleb128(mut value: u32, out: &mut Vec<u8>) -> usize {
    let start = out.len();
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
    out.len() - start
}

/// Builds the wire-format key: the collection UID LEB128-prefixed onto the raw key, unless
/// collections are not enabled on the server at all (spec §3). The default collection's UID is
/// the well-known constant `0` and never needs manifest resolution; every other collection must
/// have been resolved to a UID first.
pub(crate) fn encode_wire_key(
    id: &DocumentId,
    collection_uid: Option<u32>,
    collections_enabled: bool,
) -> Result<Vec<u8>> {
    if !collections_enabled {
        if !id.has_default_collection() {
            return Err(Error::invalid_argument(
                "non-default collection requested but collections are not enabled on the server",
            ));
        }
        return Ok(id.key.clone());
    }

    let uid = if id.has_default_collection() {
        collection_uid.unwrap_or(0)
    } else {
        collection_uid.ok_or_else(|| {
            Error::invalid_argument(format!(
                "collection {}.{} has not been resolved to a UID",
                id.scope, id.collection
            ))
        })?
    };

    let mut wire_key = Vec::with_capacity(5 + id.key.len());
    write_uleb128(uid, &mut wire_key);
    wire_key.extend_from_slice(&id.key);
    Ok(wire_key)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accepts_key_at_the_250_byte_limit() {
        let id = DocumentId::new("travel", vec![b'k'; 250]);
        id.validate().unwrap();
    }

    #[test]
    fn rejects_key_over_the_250_byte_limit() {
        let id = DocumentId::new("travel", vec![b'k'; 251]);
        let err = id.validate().unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::InvalidArgument { .. }));
    }

    #[test]
    fn rejects_illegal_collection_characters() {
        let id = DocumentId::with_collection("travel", "_default", "bad collection!", b"k1".to_vec());
        let err = id.validate().unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::InvalidArgument { .. }));
    }

    #[test]
    fn default_collection_never_requires_a_uid() {
        let id = DocumentId::new("travel", b"k1".to_vec());
        let key = encode_wire_key(&id, None, true).unwrap();
        assert_eq!(key, [&[0u8][..], b"k1"].concat());
    }

    #[test]
    fn default_collection_is_unprefixed_when_collections_are_disabled() {
        let id = DocumentId::new("travel", b"k1".to_vec());
        let key = encode_wire_key(&id, None, false).unwrap();
        assert_eq!(key, b"k1");
    }

    #[test]
    fn non_default_collection_requires_a_resolved_uid() {
        let id = DocumentId::with_collection("travel", "tenant", "invoices", b"k1".to_vec());
        let err = encode_wire_key(&id, None, true).unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::InvalidArgument { .. }));
    }

    #[test]
    fn leb128_round_trips_known_values() {
        let mut buf = Vec::new();
        let n = write_uleb128(300, &mut buf);
        assert_eq!(n, 2);
        assert_eq!(buf, vec![0xAC, 0x02]);
    }

    #[test]
    fn non_default_collection_prefixes_the_key_with_its_uid() {
        let id = DocumentId::with_collection("travel", "tenant", "invoices", b"k1".to_vec());
        let key = encode_wire_key(&id, Some(9), true).unwrap();
        assert_eq!(key, [&[9u8][..], b"k1"].concat());
    }
}
