//! The `Cluster` façade (spec §4.G): the single entry point an application holds, owning one
//! [`crate::session::BucketSession`] per open bucket plus the shared query machinery, and
//! driving the retry/deadline/not-my-vbucket dance common to every key-value operation.
//!
//! Grounded in the teacher's `Client`/`ClientSession` split (`client/mod.rs`,
//! `client/session.rs`): one long-lived handle, lazily-opened per-target sessions underneath,
//! and a single generic operation-execution loop (`Client::execute_operation` in the teacher)
//! that every public method funnels through instead of duplicating retry logic per call.

mod http;
mod query;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::durability::{self, ObserveSample};
use crate::error::{Error, ErrorKind, Result};
use crate::id::{encode_wire_key, DocumentId};
use crate::options::{ClusterOptions, Credential, DurabilityRequirement, MutationOptions, SharedRetryStrategy};
use crate::results::{CounterResult, GetResult, MutationResult, MutationToken};
use crate::retry::{self, Retryability};
use crate::runtime;
use crate::session::{stream_options_for, BucketSession};
use crate::topology::ClusterMap;
use crate::wire::frame::Datatype;
use crate::wire::kv_ops::{
    ConcatMode, ConcatRequest, CounterDirection, CounterRequest, DeleteRequest, EncodeContext, GetAndLockRequest,
    GetAndTouchRequest, GetRequest, KvOperation, LookupInRequest, LookupInSpec, ObserveSeqnoRequest, StoreMode,
    StoreRequest, TouchRequest, UnlockRequest,
};

pub use query::{QueryOptions, QueryResult};

/// A subset of a cluster's topology, surfaced read-only for diagnostics/tests (spec §3
/// GLOSSARY "cluster map" made observable without exposing the whole internal [`ClusterMap`]).
#[derive(Clone, Debug)]
pub struct BucketConfiguration {
    /// The bucket this configuration describes.
    pub bucket: String,
    /// Number of vbuckets the bucket is partitioned into.
    pub vbucket_count: u16,
    /// Number of configured replicas per vbucket.
    pub num_replicas: usize,
    /// Number of nodes currently in the cluster map.
    pub node_count: usize,
}

/// The cluster-level client applications hold onto (spec §4.G). Cheap to clone: bucket sessions
/// live behind an internal `Arc` map, so cloning a `Cluster` shares them rather than
/// reconnecting.
#[derive(Clone)]
pub struct Cluster {
    options: Arc<ClusterOptions>,
    buckets: Arc<RwLock<HashMap<String, Arc<BucketSession>>>>,
    queries: Arc<query::PreparedStatementCache>,
}

impl Cluster {
    /// Parses a connection string and connects, authenticating as `credential` (spec §4.B).
    pub async fn connect(connection_string: impl AsRef<str>, credential: Credential) -> Result<Self> {
        let options = ClusterOptions::parse(connection_string, credential)?;
        Ok(Self::with_options(options))
    }

    /// Builds a cluster handle from already-resolved options, without touching the network. No
    /// bucket session is opened until [`Self::open_bucket`] (or an operation against one) is
    /// called, mirroring the teacher's lazy per-target connection pools.
    pub fn with_options(options: ClusterOptions) -> Self {
        Self {
            options: Arc::new(options),
            buckets: Arc::new(RwLock::new(HashMap::new())),
            queries: Arc::new(query::PreparedStatementCache::default()),
        }
    }

    /// Opens (or returns the already-open) session for `bucket`, bootstrapping its cluster map
    /// over the configured seed nodes (spec §4.C).
    #[instrument(skip(self), fields(bucket = %bucket))]
    pub async fn open_bucket(&self, bucket: &str) -> Result<()> {
        self.session_for(bucket).await?;
        Ok(())
    }

    /// Closes one bucket's session, tearing down every connection it opened. A no-op if the
    /// bucket was never opened.
    pub async fn close_bucket(&self, bucket: &str) {
        let session = self.buckets.write().await.remove(bucket);
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// Closes every open bucket session (spec §4.G cluster-level teardown).
    pub async fn close(&self) {
        let sessions: Vec<_> = self.buckets.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
    }

    /// The current topology snapshot for an already-open bucket, for diagnostics and tests
    /// (testable property: vbucket/replica counts observable without internal access).
    pub async fn bucket_configuration(&self, bucket: &str) -> Result<BucketConfiguration> {
        let session = self.session_for(bucket).await?;
        let map = session.cluster_map();
        Ok(BucketConfiguration {
            bucket: bucket.to_string(),
            vbucket_count: map.vbucket_count(),
            num_replicas: map.num_replicas,
            node_count: map.nodes.len(),
        })
    }

    async fn session_for(&self, bucket: &str) -> Result<Arc<BucketSession>> {
        if let Some(session) = self.buckets.read().await.get(bucket) {
            return Ok(session.clone());
        }
        let session = BucketSession::connect(&self.options.seeds, bucket.to_string(), (*self.options).clone()).await?;
        let mut sessions = self.buckets.write().await;
        // Another task may have opened the same bucket concurrently; keep whichever landed
        // first rather than leaking the loser's connections.
        let winner = sessions.entry(bucket.to_string()).or_insert(session).clone();
        Ok(winner)
    }

    fn deadline_for(&self, timeout: Option<Duration>, default: Duration) -> Instant {
        Instant::now() + timeout.unwrap_or(default)
    }

    fn retry_strategy_for(&self, override_strategy: Option<SharedRetryStrategy>) -> SharedRetryStrategy {
        override_strategy.unwrap_or_else(|| self.options.retry_strategy.clone())
    }

    // ---- reads -----------------------------------------------------------------------------

    /// Reads a document (spec §3 `get`).
    pub async fn get(&self, id: &DocumentId, timeout: Option<Duration>) -> Result<GetResult> {
        let session = self.session_for(&id.bucket).await?;
        let deadline = self.deadline_for(timeout, self.options.timeouts.kv);
        let req = GetRequest { id: id.clone() };
        dispatch_kv(&session, req, 0, deadline, &self.options.retry_strategy)
            .await
            .map(|(response, _)| response)
    }

    /// Reads a document and acquires a pessimistic lock on it for `lock_time_secs` seconds.
    pub async fn get_and_lock(
        &self,
        id: &DocumentId,
        lock_time_secs: u32,
        timeout: Option<Duration>,
    ) -> Result<GetResult> {
        let session = self.session_for(&id.bucket).await?;
        let deadline = self.deadline_for(timeout, self.options.timeouts.kv);
        let req = GetAndLockRequest {
            id: id.clone(),
            lock_time_secs,
        };
        dispatch_kv(&session, req, 0, deadline, &self.options.retry_strategy)
            .await
            .map(|(response, _)| response)
    }

    /// Reads a document and resets its expiry in the same round trip.
    pub async fn get_and_touch(&self, id: &DocumentId, expiry_secs: u32, timeout: Option<Duration>) -> Result<GetResult> {
        let session = self.session_for(&id.bucket).await?;
        let deadline = self.deadline_for(timeout, self.options.timeouts.kv);
        let req = GetAndTouchRequest {
            id: id.clone(),
            expiry_secs,
        };
        dispatch_kv(&session, req, 0, deadline, &self.options.retry_strategy)
            .await
            .map(|(response, _)| response)
    }

    /// Releases a lock acquired by [`Self::get_and_lock`]; `cas` must match the CAS it returned.
    pub async fn unlock(&self, id: &DocumentId, cas: u64, timeout: Option<Duration>) -> Result<()> {
        let session = self.session_for(&id.bucket).await?;
        let deadline = self.deadline_for(timeout, self.options.timeouts.kv);
        let req = UnlockRequest { id: id.clone(), cas };
        dispatch_kv(&session, req, 0, deadline, &self.options.retry_strategy)
            .await
            .map(|(response, _)| response)
    }

    /// Resets a document's expiry without reading its value.
    pub async fn touch(&self, id: &DocumentId, expiry_secs: u32, timeout: Option<Duration>) -> Result<MutationResult> {
        let session = self.session_for(&id.bucket).await?;
        let deadline = self.deadline_for(timeout, self.options.timeouts.kv);
        let req = TouchRequest {
            id: id.clone(),
            expiry_secs,
        };
        let (result, partition) = dispatch_kv(&session, req, 0, deadline, &self.options.retry_strategy).await?;
        Ok(stamp_bucket(result, &id.bucket, partition))
    }

    /// Reads a document from every node that carries a copy (spec scenario S4): the active plus
    /// every configured replica, in one call. Entries that could not be read (the node is down,
    /// or the document genuinely isn't there) are dropped rather than failing the whole call;
    /// an empty result set means `DocumentNotFound`.
    pub async fn get_all_replicas(&self, id: &DocumentId, timeout: Option<Duration>) -> Result<Vec<GetResult>> {
        let session = self.session_for(&id.bucket).await?;
        let deadline = self.deadline_for(timeout, self.options.timeouts.kv);
        let map = session.cluster_map();
        let replica_count = map.num_replicas;

        let futures = (0..=replica_count).map(|replica_index| {
            let session = session.clone();
            let req = GetRequest { id: id.clone() };
            let retry_strategy = self.options.retry_strategy.clone();
            async move {
                let (mut response, _) = dispatch_kv(&session, req, replica_index, deadline, &retry_strategy).await.ok()?;
                response.is_replica = replica_index != 0;
                Some(response)
            }
        });

        let results: Vec<GetResult> = futures_util::future::join_all(futures).await.into_iter().flatten().collect();
        if results.is_empty() {
            return Err(Error::new(ErrorKind::DocumentNotFound));
        }
        Ok(results)
    }

    /// Reads a document from whichever node (active or replica) answers first, racing every
    /// candidate concurrently rather than waiting on the slowest.
    pub async fn get_any_replica(&self, id: &DocumentId, timeout: Option<Duration>) -> Result<GetResult> {
        use futures_util::stream::{FuturesUnordered, StreamExt};

        let session = self.session_for(&id.bucket).await?;
        let deadline = self.deadline_for(timeout, self.options.timeouts.kv);
        let map = session.cluster_map();
        let replica_count = map.num_replicas;

        let mut pending: FuturesUnordered<_> = (0..=replica_count)
            .map(|replica_index| {
                let session = session.clone();
                let req = GetRequest { id: id.clone() };
                let retry_strategy = self.options.retry_strategy.clone();
                async move {
                    let (mut response, _) = dispatch_kv(&session, req, replica_index, deadline, &retry_strategy).await?;
                    response.is_replica = replica_index != 0;
                    Ok::<_, Error>(response)
                }
            })
            .collect();

        let mut last_err = None;
        while let Some(outcome) = pending.next().await {
            match outcome {
                Ok(response) => return Ok(response),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::new(ErrorKind::DocumentNotFound)))
    }

    // ---- subdocument -------------------------------------------------------------------------

    /// Reads a set of subdocument paths in one round trip (spec §3 `lookup_in`). Each path's
    /// result is independent: one path's failure does not fail the others.
    pub async fn lookup_in(
        &self,
        id: &DocumentId,
        paths: Vec<(String, bool)>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Result<Vec<u8>>>> {
        let session = self.session_for(&id.bucket).await?;
        let deadline = self.deadline_for(timeout, self.options.timeouts.kv);
        let specs = paths.into_iter().map(|(path, xattr)| LookupInSpec { path, xattr }).collect();
        let req = LookupInRequest { id: id.clone(), specs };
        dispatch_kv(&session, req, 0, deadline, &self.options.retry_strategy)
            .await
            .map(|(response, _)| response)
    }

    // ---- mutations ---------------------------------------------------------------------------

    /// Creates or overwrites a document unconditionally (unless `opts.cas` is set).
    pub async fn upsert(&self, id: &DocumentId, value: Vec<u8>, datatype: Datatype, opts: MutationOptions) -> Result<MutationResult> {
        self.store(StoreMode::Upsert, id, value, datatype, opts).await
    }

    /// Creates a document; fails with `DocumentExists` if the key is already present.
    pub async fn insert(&self, id: &DocumentId, value: Vec<u8>, datatype: Datatype, opts: MutationOptions) -> Result<MutationResult> {
        self.store(StoreMode::Insert, id, value, datatype, opts).await
    }

    /// Overwrites a document; fails with `DocumentNotFound` if the key is absent.
    pub async fn replace(&self, id: &DocumentId, value: Vec<u8>, datatype: Datatype, opts: MutationOptions) -> Result<MutationResult> {
        self.store(StoreMode::Replace, id, value, datatype, opts).await
    }

    async fn store(
        &self,
        mode: StoreMode,
        id: &DocumentId,
        value: Vec<u8>,
        datatype: Datatype,
        opts: MutationOptions,
    ) -> Result<MutationResult> {
        let session = self.session_for(&id.bucket).await?;
        let deadline = self.deadline_for(opts.timeout, self.options.timeouts.kv);
        let retry_strategy = self.retry_strategy_for(opts.retry_strategy.clone());
        let req = StoreRequest {
            id: id.clone(),
            mode,
            value,
            flags: opts.flags,
            expiry_secs: opts.expiry_secs,
            cas: opts.cas,
            datatype,
            durability: opts.durability,
            preserve_expiry: opts.preserve_expiry,
        };
        let (result, partition) = dispatch_kv(&session, req, 0, deadline, &retry_strategy).await?;
        finish_mutation(&session, &id.bucket, result, &opts.durability, partition, deadline).await
    }

    /// Removes a document.
    pub async fn remove(
        &self,
        id: &DocumentId,
        cas: u64,
        durability: DurabilityRequirement,
        timeout: Option<Duration>,
    ) -> Result<MutationResult> {
        let session = self.session_for(&id.bucket).await?;
        let deadline = self.deadline_for(timeout, self.options.timeouts.kv);
        let req = DeleteRequest {
            id: id.clone(),
            cas,
            durability,
        };
        let (result, partition) = dispatch_kv(&session, req, 0, deadline, &self.options.retry_strategy).await?;
        finish_mutation(&session, &id.bucket, result, &durability, partition, deadline).await
    }

    /// Appends bytes onto a document's existing value.
    pub async fn append(
        &self,
        id: &DocumentId,
        value: Vec<u8>,
        cas: u64,
        durability: DurabilityRequirement,
        timeout: Option<Duration>,
    ) -> Result<MutationResult> {
        self.concat(ConcatMode::Append, id, value, cas, durability, timeout).await
    }

    /// Prepends bytes onto a document's existing value (spec scenario S6).
    pub async fn prepend(
        &self,
        id: &DocumentId,
        value: Vec<u8>,
        cas: u64,
        durability: DurabilityRequirement,
        timeout: Option<Duration>,
    ) -> Result<MutationResult> {
        self.concat(ConcatMode::Prepend, id, value, cas, durability, timeout).await
    }

    async fn concat(
        &self,
        mode: ConcatMode,
        id: &DocumentId,
        value: Vec<u8>,
        cas: u64,
        durability: DurabilityRequirement,
        timeout: Option<Duration>,
    ) -> Result<MutationResult> {
        let session = self.session_for(&id.bucket).await?;
        let deadline = self.deadline_for(timeout, self.options.timeouts.kv);
        let req = ConcatRequest {
            id: id.clone(),
            mode,
            value,
            cas,
        };
        let (result, partition) = dispatch_kv(&session, req, 0, deadline, &self.options.retry_strategy).await?;
        finish_mutation(&session, &id.bucket, result, &durability, partition, deadline).await
    }

    /// Atomically increments a counter document, optionally seeding it with `initial` if absent.
    pub async fn increment(
        &self,
        id: &DocumentId,
        delta: u64,
        initial: Option<u64>,
        expiry_secs: u32,
        durability: DurabilityRequirement,
        timeout: Option<Duration>,
    ) -> Result<CounterResult> {
        self.counter(CounterDirection::Increment, id, delta, initial, expiry_secs, durability, timeout)
            .await
    }

    /// Atomically decrements a counter document, optionally seeding it with `initial` if absent.
    pub async fn decrement(
        &self,
        id: &DocumentId,
        delta: u64,
        initial: Option<u64>,
        expiry_secs: u32,
        durability: DurabilityRequirement,
        timeout: Option<Duration>,
    ) -> Result<CounterResult> {
        self.counter(CounterDirection::Decrement, id, delta, initial, expiry_secs, durability, timeout)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn counter(
        &self,
        direction: CounterDirection,
        id: &DocumentId,
        delta: u64,
        initial: Option<u64>,
        expiry_secs: u32,
        durability: DurabilityRequirement,
        timeout: Option<Duration>,
    ) -> Result<CounterResult> {
        let session = self.session_for(&id.bucket).await?;
        let deadline = self.deadline_for(timeout, self.options.timeouts.kv);
        let req = CounterRequest {
            id: id.clone(),
            direction,
            delta,
            initial: initial.unwrap_or(u64::MAX),
            expiry_secs,
        };
        let (result, partition) = dispatch_kv(&session, req, 0, deadline, &self.options.retry_strategy).await?;
        let CounterResult { value, mutation } = result;
        let mutation = finish_mutation(&session, &id.bucket, mutation, &durability, partition, deadline).await?;
        Ok(CounterResult { value, mutation })
    }

    // ---- query -------------------------------------------------------------------------------

    /// Executes a SQL++ query against `bucket`'s cluster (spec §4.A "query" specialization,
    /// §4.E prepared-statement cache). The bucket supplies node discovery only; queries
    /// themselves are not scoped to it unless `options.query_context` says otherwise.
    pub async fn query(&self, bucket: &str, statement: &str, options: QueryOptions) -> Result<QueryResult> {
        let session = self.session_for(bucket).await?;
        let deadline = self.deadline_for(None, self.options.timeouts.query);
        let map = session.cluster_map();
        let endpoints = map.services_endpoints(crate::error::ServiceKind::Query, self.options.tls_enabled);
        let (host, port) = endpoints.into_iter().next().ok_or_else(|| {
            Error::new(ErrorKind::ServiceNotAvailable {
                message: "no node in the cluster map advertises the query service".into(),
            })
        })?;
        let stream_options = stream_options_for(&host, port, &self.options)?;
        let host_header = format!("{host}:{port}");
        query::execute(&self.queries, stream_options, &host_header, statement, &options, deadline).await
    }
}

/// Stamps the bucket name onto a mutation token (the wire codec never sees it), applying legacy
/// observe-based durability if the caller asked for `persist_to`/`replicate_to`.
async fn finish_mutation(
    session: &Arc<BucketSession>,
    bucket: &str,
    result: MutationResult,
    durability: &DurabilityRequirement,
    partition: u16,
    deadline: Instant,
) -> Result<MutationResult> {
    let result = stamp_bucket(result, bucket, partition);
    if durability.needs_observe_poll() {
        let token = result
            .mutation_token
            .clone()
            .ok_or_else(|| Error::new(ErrorKind::FeatureNotAvailable))?;
        enforce_legacy_durability(session, &token, durability, partition, deadline).await?;
    }
    Ok(result)
}

/// Fills in the two fields the wire response never carries: the bucket name (the KV wire codec
/// is bucket-agnostic) and the vbucket id (that header slot holds the response status instead,
/// see `wire::kv_ops::decode_mutation`). `partition` is the vbucket `dispatch_kv` actually routed
/// the successful attempt to.
fn stamp_bucket(mut result: MutationResult, bucket: &str, partition: u16) -> MutationResult {
    if let Some(token) = result.mutation_token.as_mut() {
        token.bucket_name = bucket.to_string();
        token.partition_id = partition;
    }
    result
}

/// Polls `OBSERVE_SEQNO` against the active node and every configured replica until `durability`
/// is satisfied or `deadline` passes (spec §4.F, scenario S6).
async fn enforce_legacy_durability(
    session: &Arc<BucketSession>,
    token: &MutationToken,
    durability: &DurabilityRequirement,
    partition: u16,
    deadline: Instant,
) -> Result<()> {
    let schedule = Default::default();
    durability::poll_until_satisfied(token, durability, deadline, schedule, || async {
        let map = session.cluster_map();
        let node_count = 1 + map.num_replicas;
        let mut samples = Vec::with_capacity(node_count);
        for replica_index in 0..node_count {
            let Ok(conn) = session.connection_for(partition, replica_index).await else {
                continue;
            };
            let ctx = EncodeContext {
                vbucket: partition,
                opaque: session.next_opaque(),
                collection_uid: None,
                collections_enabled: false,
                durability_enabled: false,
            };
            let req = ObserveSeqnoRequest { vbucket: partition };
            let Ok(frame) = req.encode(&ctx) else { continue };
            let Ok(response) = conn.dispatch(frame).await else {
                continue;
            };
            if let Ok(result) = req.decode(response) {
                samples.push(ObserveSample {
                    is_active: replica_index == 0,
                    result,
                });
            }
        }
        Ok(samples)
    })
    .await
}

/// Drives one key-value operation to completion: resolves routing fresh on every attempt (since
/// a `not_my_vbucket` response may have just installed a newer cluster map), retries according
/// to `retry_strategy` within `deadline`, and hands back the vbucket the successful attempt
/// landed in alongside the decoded response.
///
/// Mirrors the teacher's `Client::execute_operation`: one generic loop instead of one copy per
/// command, parameterized over [`KvOperation`] the way the teacher parameterizes over its own
/// `Operation` trait.
#[instrument(skip(session, op, retry_strategy), fields(replica_index))]
async fn dispatch_kv<Op>(
    session: &Arc<BucketSession>,
    op: Op,
    replica_index: usize,
    deadline: Instant,
    retry_strategy: &SharedRetryStrategy,
) -> Result<(Op::Response, u16)>
where
    Op: KvOperation,
{
    op.document_id().validate()?;
    let collection_uid = session
        .collection_uid(&op.document_id().scope, &op.document_id().collection)
        .await?;

    let mut attempts = 0u32;
    loop {
        if Instant::now() >= deadline {
            let err = if attempts == 0 {
                Error::unambiguous_timeout()
            } else {
                Error::ambiguous_timeout()
            };
            return Err(err);
        }

        let capabilities = session.capabilities().await;
        let wire_key = encode_wire_key(op.document_id(), collection_uid, capabilities.collections_enabled)?;
        let partition = session.partition_for_wire_key(&wire_key);

        let connection = match session.connection_for(partition, replica_index).await {
            Ok(conn) => conn,
            Err(err) => {
                attempts = match retry_or_fail(err, attempts, op.retryability(), retry_strategy, deadline).await {
                    Ok(next) => next,
                    Err(err) => return Err(err),
                };
                continue;
            }
        };

        let last_dispatched_to = session
            .cluster_map()
            .node_for(partition, replica_index)
            .map(|node| node.hostname.clone());

        let ctx = EncodeContext {
            vbucket: partition,
            opaque: session.next_opaque(),
            collection_uid,
            collections_enabled: capabilities.collections_enabled,
            durability_enabled: capabilities.durability_enabled,
        };
        let frame = op.encode(&ctx)?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let dispatch_result = runtime::timeout(remaining, connection.dispatch(frame)).await;
        let frame = match dispatch_result {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                attempts = match retry_or_fail(err, attempts, op.retryability(), retry_strategy, deadline).await {
                    Ok(next) => next,
                    Err(err) => return Err(annotate(err, last_dispatched_to)),
                };
                continue;
            }
            Err(_timeout) => {
                let err = if op.retryability() == Retryability::Idempotent {
                    Error::unambiguous_timeout()
                } else {
                    Error::ambiguous_timeout()
                };
                return Err(annotate(err, last_dispatched_to));
            }
        };

        if frame.status() == crate::error::KvStatus::NotMyVbucket {
            debug!(partition, "not_my_vbucket; refreshing topology");
            if let Ok(map) = ClusterMap::parse(&frame.value) {
                session.install_cluster_map(map);
            } else if let Err(e) = session.refresh_cluster_map().await {
                warn!(error = %e, "failed to refresh cluster map after not_my_vbucket");
            }
            let err = Error::new(ErrorKind::NotMyVbucket);
            attempts = match retry_or_fail(err, attempts, op.retryability(), retry_strategy, deadline).await {
                Ok(next) => next,
                Err(err) => return Err(annotate(err, last_dispatched_to)),
            };
            continue;
        }

        match op.decode(frame) {
            Ok(response) => return Ok((response, partition)),
            Err(err) => {
                attempts = match retry_or_fail(err, attempts, op.retryability(), retry_strategy, deadline).await {
                    Ok(next) => next,
                    Err(err) => return Err(annotate(err, last_dispatched_to)),
                };
            }
        }
    }
}

/// Classifies `err`, consults `retry_strategy`, and either sleeps and returns the incremented
/// attempt count or gives up. The deadline, not the strategy, is what ultimately fails a
/// request that the strategy would otherwise keep retrying forever.
async fn retry_or_fail(
    mut err: Error,
    attempts: u32,
    retryability: Retryability,
    retry_strategy: &SharedRetryStrategy,
    deadline: Instant,
) -> Result<u32> {
    let Some(reason) = retry::classify(&err, retryability) else {
        return Err(err);
    };
    err.record_retry(reason);

    let decision = retry_strategy.decide(reason, attempts);
    if !decision.retry {
        return Err(err);
    }

    if Instant::now() + decision.delay > deadline {
        return Err(if retryability == Retryability::Idempotent {
            Error::unambiguous_timeout()
        } else {
            Error::ambiguous_timeout()
        });
    }

    runtime::sleep(decision.delay).await;
    Ok(attempts + 1)
}

fn annotate(err: Error, last_dispatched_to: Option<String>) -> Error {
    let mut context = err.context().clone();
    context.last_dispatched_to = last_dispatched_to;
    err.with_context(context)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::{PersistTo, ReplicateTo};

    #[test]
    fn stamp_bucket_only_touches_a_present_token() {
        let result = MutationResult { cas: 1, mutation_token: None };
        let stamped = stamp_bucket(result, "my-bucket", 7);
        assert!(stamped.mutation_token.is_none());

        let result = MutationResult {
            cas: 1,
            mutation_token: Some(MutationToken {
                bucket_name: String::new(),
                partition_id: 0,
                partition_uuid: 0,
                sequence_number: 0,
            }),
        };
        let stamped = stamp_bucket(result, "my-bucket", 7).mutation_token.unwrap();
        assert_eq!(stamped.bucket_name, "my-bucket");
        assert_eq!(stamped.partition_id, 7);
    }

    #[test]
    fn bucket_configuration_is_plain_data() {
        let config = BucketConfiguration {
            bucket: "default".into(),
            vbucket_count: 1024,
            num_replicas: 1,
            node_count: 3,
        };
        assert_eq!(config.vbucket_count, 1024);
    }

    #[test]
    fn durability_requirement_needs_poll_only_without_a_sync_level() {
        let mut durability = DurabilityRequirement::none();
        assert!(!durability.needs_observe_poll());
        durability.persist_to = PersistTo::N(1);
        assert!(durability.needs_observe_poll());
        durability.replicate_to = ReplicateTo::N(1);
        assert!(durability.needs_observe_poll());
    }
}
