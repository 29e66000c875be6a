//! The collection manifest: `scope_name → (scope_uid, {collection_name → collection_uid})`
//! (spec §3). Versioned; a stale manifest (compared to what a server response implies) triggers
//! a re-fetch at the bucket-session layer rather than here.

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::id::{DEFAULT_COLLECTION, DEFAULT_SCOPE};

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub(crate) struct CollectionManifest {
    pub(crate) uid: u64,
    scopes: HashMap<String, Scope>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Scope {
    #[allow(dead_code)]
    uid: u32,
    collections: HashMap<String, u32>,
}

impl CollectionManifest {
    /// The manifest implied by a server with collections disabled: just `_default._default` at
    /// UID 0, which never needs a wire-key prefix.
    pub(crate) fn default_only() -> Self {
        let mut collections = HashMap::new();
        collections.insert(DEFAULT_COLLECTION.to_string(), 0);
        let mut scopes = HashMap::new();
        scopes.insert(DEFAULT_SCOPE.to_string(), Scope { uid: 0, collections });
        Self { uid: 0, scopes }
    }

    /// Parses the JSON body returned by the collections-manifest management endpoint.
    pub(crate) fn parse(json: &[u8]) -> Result<Self> {
        let raw: RawManifest = serde_json::from_slice(json)
            .map_err(|e| Error::parsing_failure(format!("malformed collection manifest: {e}")))?;

        let uid = parse_hex_uid(&raw.uid)?;
        let mut scopes = HashMap::new();
        for raw_scope in raw.scopes {
            let scope_uid = parse_hex_uid(&raw_scope.uid)? as u32;
            let mut collections = HashMap::new();
            for raw_collection in raw_scope.collections {
                collections.insert(raw_collection.name, parse_hex_uid(&raw_collection.uid)? as u32);
            }
            scopes.insert(raw_scope.name, Scope { uid: scope_uid, collections });
        }

        Ok(Self { uid, scopes })
    }

    /// `resolve_collection(scope, collection) → u32 uid | not-found` (spec §4.D).
    pub(crate) fn resolve(&self, scope: &str, collection: &str) -> Result<u32> {
        self.scopes
            .get(scope)
            .and_then(|s| s.collections.get(collection))
            .copied()
            .ok_or_else(|| Error::collection_not_found(scope, collection))
    }
}

fn parse_hex_uid(s: &str) -> Result<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|_| Error::parsing_failure(format!("malformed manifest uid {s:?}")))
}

#[derive(Deserialize)]
struct RawManifest {
    uid: String,
    scopes: Vec<RawScope>,
}

#[derive(Deserialize)]
struct RawScope {
    name: String,
    uid: String,
    collections: Vec<RawCollection>,
}

#[derive(Deserialize)]
struct RawCollection {
    name: String,
    uid: String,
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_json() -> &'static [u8] {
        br#"{
            "uid": "3",
            "scopes": [
                {"name": "_default", "uid": "0", "collections": [{"name": "_default", "uid": "0"}]},
                {"name": "tenant", "uid": "8", "collections": [{"name": "invoices", "uid": "9"}]}
            ]
        }"#
    }

    #[test]
    fn resolves_known_collections() {
        let manifest = CollectionManifest::parse(sample_json()).unwrap();
        assert_eq!(manifest.uid, 3);
        assert_eq!(manifest.resolve("tenant", "invoices").unwrap(), 9);
        assert_eq!(manifest.resolve(DEFAULT_SCOPE, DEFAULT_COLLECTION).unwrap(), 0);
    }

    #[test]
    fn unresolved_collection_is_an_error() {
        let manifest = CollectionManifest::parse(sample_json()).unwrap();
        let err = manifest.resolve("tenant", "missing").unwrap_err();
        assert!(matches!(err.kind(), crate::error::ErrorKind::CollectionNotFound { .. }));
    }

    #[test]
    fn default_only_never_needs_resolution_beyond_uid_zero() {
        let manifest = CollectionManifest::default_only();
        assert_eq!(manifest.resolve(DEFAULT_SCOPE, DEFAULT_COLLECTION).unwrap(), 0);
    }
}
