//! A bucket session (spec §4.C, §4.D): the live set of node connections backing one open
//! bucket, the cluster-map snapshot routing dispatches against, and the collection manifest.
//!
//! Grounded in the teacher's `sdam/topology.rs` (one `watch` channel carrying the latest
//! topology snapshot, subscribers never block a refresh) and `cmap/mod.rs` (one pool keyed by
//! server address, opened lazily on first use). This crate has no connection *pool* — KV
//! sockets here are long-lived and multiplexed, so "the pool" collapses to one
//! [`crate::connection::Connection`] per node, opened on first dispatch and kept until the
//! session closes or the node drops out of the map.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch, RwLock};

use crate::connection::{Connection, ConnectOptions, HandshakeOutcome, StreamOptions};
use crate::error::{Error, ErrorKind, Result};
use crate::id::{DEFAULT_COLLECTION, DEFAULT_SCOPE};
use crate::options::ClusterOptions;
use crate::options::ServerAddress;
use crate::runtime;
use crate::topology::{self, ClusterMap, CollectionManifest, Node};
use crate::wire::frame::KvFrame;
use crate::wire::kv_ops::{EncodeContext, GetClusterConfigRequest, GetCollectionsManifestRequest};

#[cfg(feature = "rustls-tls")]
use crate::runtime::tls_rustls::TlsConfig;
#[cfg(feature = "openssl-tls")]
use crate::runtime::tls_openssl::TlsConfig;

/// A live session against one open bucket: node connections, the current topology, and the
/// collection manifest. Always held behind an [`Arc`] since connection-opening tasks keep a
/// [`Weak`] reference back to route pushed cluster-map notifications.
pub(crate) struct BucketSession {
    bucket: String,
    options: ClusterOptions,
    map: watch::Sender<Arc<ClusterMap>>,
    connections: RwLock<HashMap<usize, Connection>>,
    manifest: RwLock<Arc<CollectionManifest>>,
    capabilities: RwLock<HandshakeOutcome>,
    opaque: AtomicU32,
}

impl BucketSession {
    /// Tries each seed in order until one completes a handshake and yields an initial cluster
    /// map; the seed connection itself is then discarded; node connections are opened lazily
    /// against the map it returned (spec §4.C bootstrap).
    pub(crate) async fn connect(
        seeds: &[ServerAddress],
        bucket: String,
        options: ClusterOptions,
    ) -> Result<Arc<Self>> {
        if seeds.is_empty() {
            return Err(Error::invalid_argument("no seed nodes configured"));
        }

        let mut last_err = None;
        for seed in seeds {
            let host = seed.host.clone();
            let port = seed.port_or(options.default_kv_port());
            match Self::bootstrap(&host, port, &bucket, &options).await {
                Ok(session) => return Ok(session),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::invalid_argument("no seed nodes configured")))
    }

    async fn bootstrap(host: &str, port: u16, bucket: &str, options: &ClusterOptions) -> Result<Arc<Self>> {
        let stream_options = stream_options_for(host, port, options)?;
        let connect_options = ConnectOptions {
            stream: stream_options,
            credential: options.credential.clone(),
            bucket: Some(bucket.to_string()),
            enable_mutation_tokens: options.enable_mutation_tokens,
            enable_clustermap_notification: options.enable_clustermap_notification,
        };
        let (conn, outcome, push_rx) = Connection::open(connect_options).await?;
        drop(push_rx); // the bootstrap connection isn't kept, so its pushes go nowhere useful.

        let opaque = AtomicU32::new(1);
        let next_opaque = || opaque.fetch_add(1, Ordering::Relaxed);

        let ctx = EncodeContext {
            vbucket: 0,
            opaque: next_opaque(),
            collection_uid: None,
            collections_enabled: outcome.collections_enabled,
            durability_enabled: outcome.durability_enabled,
        };
        let config_req = GetClusterConfigRequest;
        let config_response = conn.dispatch(config_req.encode(&ctx)?).await?;
        let map = ClusterMap::parse(&config_req.decode(config_response)?)?;

        let manifest = if outcome.collections_enabled {
            let manifest_ctx = EncodeContext {
                opaque: next_opaque(),
                ..ctx
            };
            let manifest_req = GetCollectionsManifestRequest;
            let manifest_response = conn.dispatch(manifest_req.encode(&manifest_ctx)?).await?;
            CollectionManifest::parse(&manifest_req.decode(manifest_response)?)?
        } else {
            CollectionManifest::default_only()
        };

        conn.close().await;

        let (map_tx, _) = watch::channel(Arc::new(map));
        Ok(Arc::new(Self {
            bucket: bucket.to_string(),
            options: options.clone(),
            map: map_tx,
            connections: RwLock::new(HashMap::new()),
            manifest: RwLock::new(Arc::new(manifest)),
            capabilities: RwLock::new(outcome),
            opaque,
        }))
    }

    pub(crate) fn cluster_map(&self) -> Arc<ClusterMap> {
        self.map.borrow().clone()
    }

    pub(crate) fn bucket_name(&self) -> &str {
        &self.bucket
    }

    pub(crate) async fn capabilities(&self) -> HandshakeOutcome {
        *self.capabilities.read().await
    }

    pub(crate) fn partition_for_wire_key(&self, wire_key: &[u8]) -> u16 {
        topology::partition_for(wire_key, self.cluster_map().vbucket_count())
    }

    pub(crate) fn next_opaque(&self) -> u32 {
        self.opaque.fetch_add(1, Ordering::Relaxed)
    }

    /// Looks up the connection that should carry a request to `partition`'s node at
    /// `replica_index` (0 = active, per spec §4.D), opening it if this is the first request
    /// routed there.
    pub(crate) async fn connection_for(
        self: &Arc<Self>,
        partition: u16,
        replica_index: usize,
    ) -> Result<Connection> {
        let map = self.cluster_map();
        let node_index = map
            .vbucket_map
            .get(partition as usize)
            .and_then(|row| row.get(replica_index).copied())
            .flatten()
            .ok_or_else(|| Error::new(ErrorKind::NotMyVbucket))?;
        let node = map
            .nodes
            .get(node_index)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotMyVbucket))?;
        self.get_or_open_connection(node_index, &node).await
    }

    /// Any one connection, for requests that aren't vbucket-routed (manifest/cluster-map
    /// refreshes, `OBSERVE_SEQNO` against a specific node chosen by the durability poller).
    pub(crate) async fn any_connection(self: &Arc<Self>) -> Result<Connection> {
        let map = self.cluster_map();
        let (node_index, node) = map
            .nodes
            .iter()
            .enumerate()
            .find(|(_, n)| n.kv_port(self.options.tls_enabled).is_some())
            .map(|(i, n)| (i, n.clone()))
            .ok_or_else(|| {
                Error::new(ErrorKind::ServiceNotAvailable {
                    message: "no node in the cluster map advertises the key-value service".into(),
                })
            })?;
        self.get_or_open_connection(node_index, &node).await
    }

    async fn get_or_open_connection(self: &Arc<Self>, node_index: usize, node: &Node) -> Result<Connection> {
        if let Some(conn) = self.connections.read().await.get(&node_index) {
            return Ok(conn.clone());
        }

        let port = node.kv_port(self.options.tls_enabled).ok_or_else(|| {
            Error::new(ErrorKind::ServiceNotAvailable {
                message: format!("node {} does not advertise the key-value service", node.hostname),
            })
        })?;
        let stream_options = stream_options_for(&node.hostname, port, &self.options)?;
        let connect_options = ConnectOptions {
            stream: stream_options,
            credential: self.options.credential.clone(),
            bucket: Some(self.bucket.clone()),
            enable_mutation_tokens: self.options.enable_mutation_tokens,
            enable_clustermap_notification: self.options.enable_clustermap_notification,
        };
        let (conn, outcome, push_rx) = Connection::open(connect_options).await?;
        *self.capabilities.write().await = outcome;

        runtime::spawn(drain_pushes(Arc::downgrade(self), push_rx));

        let mut connections = self.connections.write().await;
        // Another task may have raced us to open the same node; keep whichever landed first so
        // we never leak a socket the HashMap no longer references.
        let winner = connections.entry(node_index).or_insert(conn).clone();
        Ok(winner)
    }

    /// Installs `candidate` if it's a newer snapshot than what subscribers currently see (spec
    /// §4.D ordering). Connections are never proactively torn down here: a node that drops out of
    /// the map simply stops being selected by [`Self::connection_for`]; it is closed only when
    /// [`Self::close`] tears down the whole session.
    pub(crate) fn install_cluster_map(&self, candidate: ClusterMap) {
        let candidate = Arc::new(candidate);
        self.map.send_if_modified(|current| {
            if candidate.supersedes(current) {
                *current = candidate.clone();
                true
            } else {
                false
            }
        });
    }

    /// Re-fetches the cluster map from any live connection. Used after a `not_my_vbucket`
    /// response whose carried config (if any) was already applied by the caller, as a fallback
    /// when the response carried none.
    pub(crate) async fn refresh_cluster_map(self: &Arc<Self>) -> Result<()> {
        let conn = self.any_connection().await?;
        let ctx = EncodeContext {
            vbucket: 0,
            opaque: self.next_opaque(),
            collection_uid: None,
            collections_enabled: self.capabilities().await.collections_enabled,
            durability_enabled: false,
        };
        let req = GetClusterConfigRequest;
        let response = conn.dispatch(req.encode(&ctx)?).await?;
        self.install_cluster_map(ClusterMap::parse(&req.decode(response)?)?);
        Ok(())
    }

    /// Resolves `scope.collection` to its UID, re-fetching the manifest once if it isn't found
    /// (the manifest may simply be stale). `_default._default` never needs resolution (spec §3).
    pub(crate) async fn collection_uid(self: &Arc<Self>, scope: &str, collection: &str) -> Result<Option<u32>> {
        if scope == DEFAULT_SCOPE && collection == DEFAULT_COLLECTION {
            return Ok(None);
        }
        let manifest = self.manifest.read().await.clone();
        match manifest.resolve(scope, collection) {
            Ok(uid) => Ok(Some(uid)),
            Err(stale_err) => {
                self.refresh_manifest().await?;
                let manifest = self.manifest.read().await.clone();
                manifest.resolve(scope, collection).map(Some).map_err(|_| stale_err)
            }
        }
    }

    async fn refresh_manifest(self: &Arc<Self>) -> Result<()> {
        let conn = self.any_connection().await?;
        let ctx = EncodeContext {
            vbucket: 0,
            opaque: self.next_opaque(),
            collection_uid: None,
            collections_enabled: true,
            durability_enabled: false,
        };
        let req = GetCollectionsManifestRequest;
        let response = conn.dispatch(req.encode(&ctx)?).await?;
        let manifest = CollectionManifest::parse(&req.decode(response)?)?;
        *self.manifest.write().await = Arc::new(manifest);
        Ok(())
    }

    /// Closes every open node connection. Push-listener tasks end on their own once each
    /// connection's push channel closes.
    pub(crate) async fn close(&self) {
        let connections = self.connections.read().await;
        for conn in connections.values() {
            conn.close().await;
        }
    }
}

/// Forwards unsolicited (opaque-0) frames from one connection into cluster-map installs. Holds
/// only a [`Weak`] reference: if every [`Arc<BucketSession>`] is dropped, this task exits on its
/// next push rather than keeping the session alive.
async fn drain_pushes(session: Weak<BucketSession>, mut push_rx: mpsc::UnboundedReceiver<KvFrame>) {
    while let Some(frame) = push_rx.recv().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        if let Ok(map) = ClusterMap::parse(&frame.value) {
            session.install_cluster_map(map);
        }
    }
}

pub(crate) fn stream_options_for(host: &str, port: u16, options: &ClusterOptions) -> Result<StreamOptions> {
    #[cfg(any(feature = "rustls-tls", feature = "openssl-tls"))]
    let tls = if options.tls_enabled {
        let tls_options = options
            .tls
            .as_ref()
            .ok_or_else(|| Error::invalid_tls_config("TLS was requested but no TlsOptions were configured"))?;
        Some(TlsConfig::new(tls_options)?)
    } else {
        None
    };

    Ok(StreamOptions {
        host: host.to_string(),
        port,
        connect_timeout: Some(options.kv_connect_timeout),
        #[cfg(any(feature = "rustls-tls", feature = "openssl-tls"))]
        tls,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_map() -> ClusterMap {
        ClusterMap::parse(
            br#"{
                "rev": 1,
                "revEpoch": 1,
                "vBucketServerMap": {"numReplicas": 0, "vBucketMap": [[0]]},
                "nodesExt": [{"hostname": "node1", "services": {"kv": 11210}}]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn install_cluster_map_only_replaces_with_a_newer_snapshot() {
        let (tx, rx) = watch::channel(Arc::new(sample_map()));
        let session = BucketSession {
            bucket: "travel".into(),
            options: ClusterOptions::parse(
                "clusterkv://node1",
                crate::options::Credential {
                    username: "u".into(),
                    password: "p".into(),
                },
            )
            .unwrap(),
            map: tx,
            connections: RwLock::new(HashMap::new()),
            manifest: RwLock::new(Arc::new(CollectionManifest::default_only())),
            capabilities: RwLock::new(HandshakeOutcome::default()),
            opaque: AtomicU32::new(1),
        };

        let mut stale = sample_map();
        stale.rev = 0;
        session.install_cluster_map(stale);
        assert_eq!(rx.borrow().rev, 1);

        let mut newer = sample_map();
        newer.rev = 2;
        session.install_cluster_map(newer);
        assert_eq!(rx.borrow().rev, 2);
    }
}
