//! Parsing and querying one immutable cluster-map snapshot (spec §3, §4.C, §4.D).

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{Error, Result, ServiceKind};

/// One node's address and the ports it advertises per service, in both plaintext and TLS form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Node {
    pub(crate) hostname: String,
    ports: HashMap<ServiceKind, u16>,
    tls_ports: HashMap<ServiceKind, u16>,
    kv_port: Option<u16>,
    kv_tls_port: Option<u16>,
}

impl Node {
    pub(crate) fn service_port(&self, service: ServiceKind, tls: bool) -> Option<u16> {
        if tls {
            self.tls_ports.get(&service).copied()
        } else {
            self.ports.get(&service).copied()
        }
    }

    pub(crate) fn kv_port(&self, tls: bool) -> Option<u16> {
        if tls {
            self.kv_tls_port
        } else {
            self.kv_port
        }
    }
}

/// An immutable cluster-map snapshot (spec §3). Installed atomically; consumers that resolved a
/// request against one snapshot keep using it even after a newer one is installed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ClusterMap {
    pub(crate) rev_epoch: u64,
    pub(crate) rev: u64,
    pub(crate) nodes: Vec<Node>,
    /// `vbucket_map[partition]` is `[active, replica_1, replica_2, ...]`, each an index into
    /// `nodes` (or `None` for a partition with no currently assigned owner).
    pub(crate) vbucket_map: Vec<Vec<Option<usize>>>,
    pub(crate) num_replicas: usize,
    pub(crate) bucket_capabilities: Vec<String>,
    pub(crate) collections_manifest_uid: Option<u64>,
}

impl ClusterMap {
    /// Parses a `GET_CLUSTER_CONFIG`/CCCP JSON payload into a snapshot.
    pub(crate) fn parse(json: &[u8]) -> Result<Self> {
        let raw: RawConfig = serde_json::from_slice(json)
            .map_err(|e| Error::parsing_failure(format!("malformed cluster map: {e}")))?;

        let nodes = raw
            .nodes_ext
            .unwrap_or_default()
            .into_iter()
            .map(Node::from_raw)
            .collect::<Vec<_>>();

        let (vbucket_map, num_replicas) = match raw.vbucket_server_map {
            Some(vsm) => {
                let map = vsm
                    .vbucket_map
                    .into_iter()
                    .map(|row| {
                        row.into_iter()
                            .map(|idx| if idx < 0 { None } else { Some(idx as usize) })
                            .collect()
                    })
                    .collect();
                (map, vsm.num_replicas)
            }
            None => (Vec::new(), 0),
        };

        Ok(Self {
            rev_epoch: raw.rev_epoch.unwrap_or(0),
            rev: raw.rev.unwrap_or(0),
            nodes,
            vbucket_map,
            num_replicas,
            bucket_capabilities: raw.bucket_capabilities.unwrap_or_default(),
            collections_manifest_uid: raw.collections_manifest_uid,
        })
    }

    /// Whether `self` is a strictly newer snapshot than `other`, per the `(rev_epoch, rev)`
    /// tie-break in spec §4.D.
    pub(crate) fn supersedes(&self, other: &ClusterMap) -> bool {
        (self.rev_epoch, self.rev) > (other.rev_epoch, other.rev)
    }

    pub(crate) fn vbucket_count(&self) -> u16 {
        self.vbucket_map.len() as u16
    }

    /// `node_for(partition, replica_index)`: `replica_index` 0 is the active node, 1..n are
    /// replicas, per spec §4.D.
    pub(crate) fn node_for(&self, partition: u16, replica_index: usize) -> Option<&Node> {
        let row = self.vbucket_map.get(partition as usize)?;
        let idx = (*row.get(replica_index)?)?;
        self.nodes.get(idx)
    }

    /// All `(host, port)` pairs currently advertising `service`.
    pub(crate) fn services_endpoints(&self, service: ServiceKind, tls: bool) -> Vec<(String, u16)> {
        self.nodes
            .iter()
            .filter_map(|n| n.service_port(service, tls).map(|port| (n.hostname.clone(), port)))
            .collect()
    }
}

#[derive(Deserialize)]
struct RawConfig {
    #[serde(rename = "rev")]
    rev: Option<u64>,
    #[serde(rename = "revEpoch")]
    rev_epoch: Option<u64>,
    #[serde(rename = "vBucketServerMap")]
    vbucket_server_map: Option<RawVbucketServerMap>,
    #[serde(rename = "nodesExt")]
    nodes_ext: Option<Vec<RawNodeExt>>,
    #[serde(rename = "bucketCapabilities")]
    bucket_capabilities: Option<Vec<String>>,
    #[serde(rename = "collectionsManifestUid")]
    collections_manifest_uid: Option<u64>,
}

#[derive(Deserialize)]
struct RawVbucketServerMap {
    #[serde(rename = "numReplicas")]
    num_replicas: usize,
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
}

#[derive(Deserialize)]
struct RawNodeExt {
    hostname: Option<String>,
    services: HashMap<String, u16>,
}

impl Node {
    fn from_raw(raw: RawNodeExt) -> Self {
        let hostname = raw.hostname.unwrap_or_default();
        let mut ports = HashMap::new();
        let mut tls_ports = HashMap::new();
        let mut kv_port = None;
        let mut kv_tls_port = None;

        for (name, port) in raw.services {
            match name.as_str() {
                "kv" => kv_port = Some(port),
                "kvSSL" => kv_tls_port = Some(port),
                "n1ql" => {
                    ports.insert(ServiceKind::Query, port);
                }
                "n1qlSSL" => {
                    tls_ports.insert(ServiceKind::Query, port);
                }
                "fts" => {
                    ports.insert(ServiceKind::Search, port);
                }
                "ftsSSL" => {
                    tls_ports.insert(ServiceKind::Search, port);
                }
                "cbas" => {
                    ports.insert(ServiceKind::Analytics, port);
                }
                "cbasSSL" => {
                    tls_ports.insert(ServiceKind::Analytics, port);
                }
                "capi" => {
                    ports.insert(ServiceKind::Views, port);
                }
                "capiSSL" => {
                    tls_ports.insert(ServiceKind::Views, port);
                }
                "mgmt" => {
                    ports.insert(ServiceKind::Management, port);
                }
                "mgmtSSL" => {
                    tls_ports.insert(ServiceKind::Management, port);
                }
                _ => {}
            }
        }

        Self {
            hostname,
            ports,
            tls_ports,
            kv_port,
            kv_tls_port,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_json() -> &'static [u8] {
        br#"{
            "rev": 5,
            "revEpoch": 1,
            "vBucketServerMap": {
                "numReplicas": 1,
                "vBucketMap": [[0, 1], [1, 0]]
            },
            "nodesExt": [
                {"hostname": "node1", "services": {"kv": 11210, "n1ql": 8093, "mgmt": 8091}},
                {"hostname": "node2", "services": {"kv": 11210, "n1ql": 8093, "mgmt": 8091}}
            ],
            "bucketCapabilities": ["collections"],
            "collectionsManifestUid": 3
        }"#
    }

    #[test]
    fn parses_nodes_and_vbucket_map() {
        let map = ClusterMap::parse(sample_json()).unwrap();
        assert_eq!(map.rev, 5);
        assert_eq!(map.rev_epoch, 1);
        assert_eq!(map.nodes.len(), 2);
        assert_eq!(map.vbucket_count(), 2);
        assert_eq!(map.node_for(0, 0).unwrap().hostname, "node1");
        assert_eq!(map.node_for(0, 1).unwrap().hostname, "node2");
        assert_eq!(map.node_for(1, 0).unwrap().hostname, "node2");
    }

    #[test]
    fn services_endpoints_lists_every_node_advertising_the_service() {
        let map = ClusterMap::parse(sample_json()).unwrap();
        let endpoints = map.services_endpoints(ServiceKind::Query, false);
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0], ("node1".to_string(), 8093));
    }

    #[test]
    fn supersedes_uses_rev_epoch_then_rev() {
        let older = ClusterMap::parse(sample_json()).unwrap();
        let mut newer = older.clone();
        newer.rev = older.rev + 1;
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));

        let mut newer_epoch = older.clone();
        newer_epoch.rev = 0;
        newer_epoch.rev_epoch = older.rev_epoch + 1;
        assert!(newer_epoch.supersedes(&older));
    }
}
