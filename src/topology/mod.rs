//! The cluster map: an immutable topology snapshot plus the pure routing functions over it
//! (spec §3, §4.D).

mod cluster_map;
mod manifest;

pub(crate) use cluster_map::{ClusterMap, Node};
pub(crate) use manifest::CollectionManifest;

use crc32fast::Hasher;

/// Number of vbuckets in a standard deployment. Real clusters may configure a different count
/// via `vBucketServerMap.vBucketMap.len()`, but this is the value used when building a topology
/// in tests.
pub(crate) const DEFAULT_VBUCKET_COUNT: u16 = 1024;

/// Hashes `wire_key` (already collection-prefixed if applicable) to a partition index, per
/// spec §4.D: CRC-32 modulo the vbucket count.
pub(crate) fn partition_for(wire_key: &[u8], vbucket_count: u16) -> u16 {
    let mut hasher = Hasher::new();
    hasher.update(wire_key);
    (hasher.finalize() % vbucket_count as u32) as u16
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partition_for_is_stable_and_in_range() {
        let a = partition_for(b"user::123", DEFAULT_VBUCKET_COUNT);
        let b = partition_for(b"user::123", DEFAULT_VBUCKET_COUNT);
        assert_eq!(a, b);
        assert!(a < DEFAULT_VBUCKET_COUNT);
    }

    #[test]
    fn partition_for_distributes_distinct_keys() {
        let a = partition_for(b"user::123", DEFAULT_VBUCKET_COUNT);
        let b = partition_for(b"user::456", DEFAULT_VBUCKET_COUNT);
        assert_ne!(a, b);
    }
}
