//! Retry classification and the pluggable [`RetryStrategy`] consulted before resubmitting a
//! request.

use std::{fmt, sync::Arc, time::Duration};

use crate::error::{Error, ErrorKind};

/// Why a request was retried. Carried on [`crate::error::ErrorContext`] purely for
/// diagnostics; retry *decisions* are made from the error kind and the strategy, not from this
/// enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryReason {
    /// The server returned `not_my_vbucket`; the topology was stale.
    NotMyVbucket,
    /// The document was locked by a concurrent `get_and_lock`.
    KvLocked,
    /// The server is transiently overloaded or warming up.
    KvTemporaryFailure,
    /// A synchronous durable write's completion could not yet be confirmed.
    KvSyncWriteInProgress,
    /// A socket-level error occurred; the connection is being re-established.
    KvConnectionError,
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotMyVbucket => "not_my_vbucket",
            Self::KvLocked => "kv_locked",
            Self::KvTemporaryFailure => "kv_temporary_failure",
            Self::KvSyncWriteInProgress => "kv_sync_write_in_progress",
            Self::KvConnectionError => "kv_connection_error",
        };
        f.write_str(s)
    }
}

/// Whether retrying a given request at all is semantically safe, independent of whether the
/// strategy in effect chooses to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retryability {
    /// Safe to retry unconditionally: the operation is idempotent (reads, and writes
    /// guarded by the server to apply at most once, e.g. via CAS).
    Idempotent,
    /// Only retry for a narrow set of reasons with well-defined semantics
    /// (not-my-vbucket re-routing, lock contention, transient overload).
    NonIdempotent,
    /// Never retry automatically.
    None,
}

/// Classifies an error into a retry reason, if any, for a request with the given retryability.
pub(crate) fn classify(error: &Error, retryability: Retryability) -> Option<RetryReason> {
    let reason = match error.kind() {
        ErrorKind::NotMyVbucket => RetryReason::NotMyVbucket,
        ErrorKind::DocumentLocked => RetryReason::KvLocked,
        ErrorKind::TemporaryFailure => RetryReason::KvTemporaryFailure,
        ErrorKind::SyncWriteInProgress => RetryReason::KvSyncWriteInProgress,
        ErrorKind::Io(_) => RetryReason::KvConnectionError,
        _ => return None,
    };

    match retryability {
        Retryability::None => None,
        Retryability::NonIdempotent => match reason {
            RetryReason::NotMyVbucket
            | RetryReason::KvLocked
            | RetryReason::KvTemporaryFailure
            | RetryReason::KvSyncWriteInProgress => Some(reason),
            RetryReason::KvConnectionError => None,
        },
        Retryability::Idempotent => Some(reason),
    }
}

/// The decision a [`RetryStrategy`] makes about one retryable failure.
#[derive(Clone, Copy, Debug)]
pub struct RetryDecision {
    /// Whether to retry at all.
    pub retry: bool,
    /// How long to wait before resubmitting, if `retry` is true.
    pub delay: Duration,
}

impl RetryDecision {
    /// Do not retry.
    pub fn no_retry() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }

    /// Retry after `delay`.
    pub fn retry_after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

/// Pluggable policy consulted once a request has been classified as retryable. Implementations
/// must be side-effect-free and fast; they run on the dispatch path.
pub trait RetryStrategy: fmt::Debug + Send + Sync {
    /// Decide whether (and after how long) to retry, given the reason and how many times this
    /// request has already been retried.
    fn decide(&self, reason: RetryReason, attempts_so_far: u32) -> RetryDecision;
}

/// Default strategy: exponential backoff starting at 1ms, doubling, capped at 500ms, with no
/// upper bound on attempt count (the deadline, not the attempt counter, is what eventually
/// fails the request).
#[derive(Clone, Copy, Debug)]
pub struct BestEffortRetryStrategy {
    initial_delay: Duration,
    max_delay: Duration,
}

impl Default for BestEffortRetryStrategy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryStrategy for BestEffortRetryStrategy {
    fn decide(&self, _reason: RetryReason, attempts_so_far: u32) -> RetryDecision {
        let factor = 1u64 << attempts_so_far.min(16);
        let delay = self
            .initial_delay
            .saturating_mul(factor as u32)
            .min(self.max_delay);
        RetryDecision::retry_after(delay)
    }
}

/// Type-erased handle to a [`RetryStrategy`], cheap to clone and share across requests.
pub type SharedRetryStrategy = Arc<dyn RetryStrategy>;
