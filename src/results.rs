//! Result types returned by successful key-value operations (spec §3).

use std::time::Duration;

/// `{vbucket_id, vbucket_uuid, seqno}` stamped by the server on every mutation (spec §3,
/// GLOSSARY). Feeds consistency scans and durability polling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationToken {
    /// Name of the bucket the mutation was applied to (testable property §8.2). The wire
    /// response carries no bucket name at all, so this is stamped on by the bucket-aware
    /// caller after decoding, not by the wire codec itself.
    pub bucket_name: String,
    /// The vbucket the mutation landed in.
    pub partition_id: u16,
    /// The vbucket's incarnation; changes across a failover, which invalidates
    /// durability-poll progress made under the old uuid.
    pub partition_uuid: u64,
    /// Monotonic sequence number within the vbucket.
    pub sequence_number: u64,
}

/// The result of a successful mutation: its resulting CAS and, if the server advertises
/// mutation tokens, the token needed for durability polling and read-your-writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationResult {
    /// Post-mutation CAS. Non-zero on success (testable property §8.3).
    pub cas: u64,
    /// Present when the server advertises `mutation seqno`.
    pub mutation_token: Option<MutationToken>,
}

/// A single replica's answer to `OBSERVE_SEQNO`, used by the durability poller (spec §4.F).
#[derive(Clone, Copy, Debug)]
pub struct ObserveSeqnoResult {
    /// The vbucket uuid the replica reports. Compared against the mutation token's
    /// `partition_uuid`; a mismatch means a failover occurred mid-poll.
    pub vbucket_uuid: u64,
    /// Highest sequence number persisted to disk.
    pub last_persisted_seqno: u64,
    /// Highest sequence number present in memory (i.e. replicated, not necessarily persisted).
    pub current_seqno: u64,
}

/// The result of a `get_and_lock`/`get`-family read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetResult {
    /// Raw document value.
    pub value: Vec<u8>,
    /// Application-defined flags stored alongside the value.
    pub flags: u32,
    /// CAS at the time of the read.
    pub cas: u64,
    /// Set by `get_all_replicas`/`get_any_replica` (spec DESIGN NOTES §10 supplement): `true`
    /// when this particular read was served by a replica node rather than the active.
    pub is_replica: bool,
}

impl GetResult {
    pub(crate) fn active(value: Vec<u8>, flags: u32, cas: u64) -> Self {
        Self {
            value,
            flags,
            cas,
            is_replica: false,
        }
    }

    pub(crate) fn replica(value: Vec<u8>, flags: u32, cas: u64) -> Self {
        Self {
            value,
            flags,
            cas,
            is_replica: true,
        }
    }
}

/// The result of a successful `increment`/`decrement` (spec §3): the counter's new value plus
/// the same CAS/mutation-token pair an ordinary mutation would return.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterResult {
    /// The counter's value after applying the delta.
    pub value: u64,
    /// CAS and mutation token for the write, identical in shape to any other mutation.
    pub mutation: MutationResult,
}

/// How long the durability poller should wait between `OBSERVE_SEQNO` samples, and the overall
/// timeout, surfaced for diagnostics/testing.
#[derive(Clone, Copy, Debug)]
pub struct DurabilityPollSchedule {
    /// Delay before the first sample.
    pub initial_delay: Duration,
    /// Cap on the exponential backoff between samples.
    pub max_delay: Duration,
}

impl Default for DurabilityPollSchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        }
    }
}
