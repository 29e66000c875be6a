//! The [`Error`] and [`Result`] types this crate uses everywhere, plus the closed set of
//! [`ErrorKind`]s a caller can match on.

use std::{collections::HashSet, fmt, sync::Arc};

use thiserror::Error as ThisError;

use crate::retry::RetryReason;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by this crate. The inner [`ErrorKind`] is wrapped in an [`Arc`] so that
/// `Error` stays cheaply [`Clone`]-able: the same error is frequently handed to both a user
/// callback and a tracing event.
#[derive(Clone, Debug, ThisError)]
#[error("{kind}")]
pub struct Error {
    kind: Arc<ErrorKind>,
    context: ErrorContext,
    #[source]
    source: Option<Arc<Error>>,
}

/// Diagnostic information attached to every error: what was last tried, and why retries gave
/// up. None of this changes the error's [`ErrorKind`]; it exists so a log line or an
/// application-level error report can explain itself without the caller re-deriving history.
#[derive(Clone, Debug, Default)]
pub struct ErrorContext {
    /// Host:port of the node the request was last dispatched to, if any.
    pub last_dispatched_to: Option<String>,
    /// Reasons the retry orchestrator retried this request, in order.
    pub retry_reasons: Vec<RetryReason>,
    /// Number of times the request was retried.
    pub retry_attempts: u32,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Arc::new(kind),
            context: ErrorContext::default(),
            source: None,
        }
    }

    /// The kind of error that occurred.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Diagnostic context describing how this request was dispatched and retried.
    pub fn context(&self) -> &ErrorContext {
        &self.context
    }

    pub(crate) fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub(crate) fn record_retry(&mut self, reason: RetryReason) {
        self.context.retry_attempts += 1;
        self.context.retry_reasons.push(reason);
    }

    pub(crate) fn with_source(mut self, source: Error) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Whether the retry orchestrator is permitted to retry the operation that produced this
    /// error at all. Individual [`crate::retry::RetryStrategy`] implementations may still refuse.
    pub fn is_retryable(&self) -> bool {
        matches!(
            &*self.kind,
            ErrorKind::NotMyVbucket
                | ErrorKind::TemporaryFailure
                | ErrorKind::DocumentLocked
                | ErrorKind::ServiceNotAvailable { .. }
                | ErrorKind::Io(_)
                | ErrorKind::SyncWriteInProgress
                | ErrorKind::AmbiguousTimeout
        )
    }

    /// Whether this error reflects a request that was never dispatched to the network, and is
    /// therefore safe to resubmit without risk of double application.
    pub fn is_unambiguous(&self) -> bool {
        matches!(
            &*self.kind,
            ErrorKind::UnambiguousTimeout | ErrorKind::InvalidArgument { .. }
        )
    }

    pub(crate) fn request_canceled() -> Self {
        Self::new(ErrorKind::RequestCanceled)
    }

    pub(crate) fn unambiguous_timeout() -> Self {
        Self::new(ErrorKind::UnambiguousTimeout)
    }

    pub(crate) fn ambiguous_timeout() -> Self {
        Self::new(ErrorKind::AmbiguousTimeout)
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument {
            message: message.into(),
        })
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal {
            message: message.into(),
        })
    }

    pub(crate) fn parsing_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ParsingFailure {
            message: message.into(),
        })
    }

    pub(crate) fn dns_resolve(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DnsResolve {
            message: message.into(),
        })
    }

    pub(crate) fn invalid_tls_config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidTlsConfig {
            message: message.into(),
        })
    }

    pub(crate) fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthenticationFailure {
            message: message.into(),
        })
    }

    pub(crate) fn collection_not_found(scope: &str, collection: &str) -> Self {
        Self::new(ErrorKind::CollectionNotFound {
            name: format!("{scope}.{collection}"),
        })
    }

    pub(crate) fn from_kv_status(status: KvStatus) -> Self {
        Self::new(status.into_error_kind())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::Io(Arc::new(e)))
    }
}

#[cfg(feature = "rustls-tls")]
impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Self::new(ErrorKind::Tls(e.to_string()))
    }
}

#[cfg(feature = "openssl-tls")]
impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Self::new(ErrorKind::Tls(e.to_string()))
    }
}

/// The closed set of error kinds this crate can produce. New variants are added rarely and
/// deliberately: callers are expected to match on these, not on string messages.
#[derive(Clone, Debug, ThisError)]
#[non_exhaustive]
pub enum ErrorKind {
    // -- common --
    /// `close()` was called, or the deadline for this request elapsed before it was ever
    /// dispatched onto the wire.
    #[error("request canceled")]
    RequestCanceled,
    /// The request's deadline elapsed before any bytes were written for it; it is safe to
    /// resubmit.
    #[error("operation timed out before being sent")]
    UnambiguousTimeout,
    /// The request's deadline elapsed after it may have reached the server; its effect is
    /// unknown.
    #[error("operation timed out, outcome unknown")]
    AmbiguousTimeout,
    /// The connected server does not support a feature this request required.
    #[error("required feature not available on server")]
    FeatureNotAvailable,
    /// A request was rejected before dispatch because of a malformed argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of what was invalid.
        message: String,
    },
    /// No node currently advertises the service this request needed.
    #[error("service not available: {message}")]
    ServiceNotAvailable {
        /// Description of the missing service.
        message: String,
    },
    /// The server reported an error outside the documented set.
    #[error("internal server failure: {message}")]
    InternalServerFailure {
        /// Raw server message, if any.
        message: String,
    },
    /// SASL/authentication negotiation failed.
    #[error("authentication failure: {message}")]
    AuthenticationFailure {
        /// Description of the failure.
        message: String,
    },
    /// The named bucket does not exist, or is not open.
    #[error("bucket not found: {name}")]
    BucketNotFound {
        /// Name of the missing bucket.
        name: String,
    },
    /// The named collection does not exist in the manifest.
    #[error("collection not found: {name}")]
    CollectionNotFound {
        /// `scope.collection` that was not found.
        name: String,
    },
    /// The named scope does not exist in the manifest.
    #[error("scope not found: {name}")]
    ScopeNotFound {
        /// Name of the missing scope.
        name: String,
    },
    /// A server-side index required by the request does not exist.
    #[error("index not found: {name}")]
    IndexNotFound {
        /// Name of the missing index.
        name: String,
    },
    /// An index creation request named an index that already exists.
    #[error("index already exists: {name}")]
    IndexExists {
        /// Name of the conflicting index.
        name: String,
    },
    /// A response could not be decoded.
    #[error("parsing failure: {message}")]
    ParsingFailure {
        /// What failed to parse.
        message: String,
    },
    /// A CAS-guarded write lost the compare.
    #[error("CAS mismatch")]
    CasMismatch,
    /// The server is transiently unable to service the request (overloaded, warming up).
    #[error("temporary failure")]
    TemporaryFailure,
    /// Name resolution failed.
    #[error("DNS resolution failure: {message}")]
    DnsResolve {
        /// Description of the failure.
        message: String,
    },
    /// The configured TLS material could not be loaded.
    #[error("invalid TLS configuration: {message}")]
    InvalidTlsConfig {
        /// Description of the failure.
        message: String,
    },
    /// TLS handshake or record layer failure.
    #[error("TLS failure: {0}")]
    Tls(String),
    /// Underlying socket I/O failure.
    #[error("I/O failure: {0}")]
    Io(Arc<std::io::Error>),
    /// A bug in this crate (unreachable state, invariant violation). Never retryable.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the invariant that was violated.
        message: String,
    },

    // -- key-value --
    /// `not_my_vbucket`: the connection's topology is stale for this key. Carries no payload;
    /// the carried cluster-map update (if any) is applied by the router before the retry is
    /// scheduled, not exposed on the error itself.
    #[error("not my vbucket")]
    NotMyVbucket,
    /// The document does not exist.
    #[error("document not found")]
    DocumentNotFound,
    /// A document with the same id already exists.
    #[error("document already exists")]
    DocumentExists,
    /// The document is locked by a prior `get_and_lock`.
    #[error("document locked")]
    DocumentLocked,
    /// The value exceeds the server's maximum document size.
    #[error("value too large")]
    ValueTooLarge,
    /// The server does not support the requested synchronous durability level.
    #[error("durability level not available")]
    DurabilityLevelNotAvailable,
    /// The requested durability level cannot currently be satisfied (e.g. too few replicas).
    #[error("durability impossible")]
    DurabilityImpossible,
    /// A synchronous durable write's outcome could not be confirmed.
    #[error("durability ambiguous")]
    DurabilityAmbiguous,
    /// Another synchronous durable write to the same key is already in progress.
    #[error("sync write in progress")]
    SyncWriteInProgress,
    /// A synchronous durable write's outcome is ambiguous server-side.
    #[error("sync write ambiguous")]
    SyncWriteAmbiguous,
    /// A subdocument path does not exist in the document.
    #[error("path not found")]
    PathNotFound,
    /// A subdocument path exists but has the wrong type for the operation.
    #[error("path mismatch")]
    PathMismatch,
    /// A subdocument path already exists.
    #[error("path exists")]
    PathExists,

    // -- query --
    /// Query planning failed.
    #[error("query planning failure: {message}")]
    PlanningFailure {
        /// Server-reported planning error.
        message: String,
    },
    /// A query-side index operation failed.
    #[error("query index failure: {message}")]
    IndexFailure {
        /// Server-reported index error.
        message: String,
    },
    /// A prepared statement could not be prepared or had gone stale.
    #[error("prepared statement failure: {message}")]
    PreparedStatementFailure {
        /// Server-reported error.
        message: String,
    },
    /// A DML statement failed for a reason other than a CAS mismatch.
    #[error("DML failure: {message}")]
    DmlFailure {
        /// Server-reported error.
        message: String,
    },

    // -- search / analytics / views (generic: response shapes are out of scope) --
    /// A non-KV service reported an error; `service` says which one.
    #[error("{service} service failure: {message}")]
    ServiceFailure {
        /// Which service reported the failure.
        service: ServiceKind,
        /// Server-reported message.
        message: String,
    },

    // -- management --
    /// A named user does not exist.
    #[error("user not found: {name}")]
    UserNotFound {
        /// Name of the missing user.
        name: String,
    },
    /// A named group does not exist.
    #[error("group not found: {name}")]
    GroupNotFound {
        /// Name of the missing group.
        name: String,
    },
    /// A bucket creation request named a bucket that already exists.
    #[error("bucket already exists: {name}")]
    BucketExists {
        /// Name of the conflicting bucket.
        name: String,
    },
    /// An analytics dataverse does not exist.
    #[error("dataverse not found: {name}")]
    DataverseNotFound {
        /// Name of the missing dataverse.
        name: String,
    },
}

/// Which non-KV service an error came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// The N1QL/SQL++ query service.
    Query,
    /// Full-text search.
    Search,
    /// The analytics service.
    Analytics,
    /// Map-reduce views.
    Views,
    /// Cluster/bucket/user management.
    Management,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Query => "query",
            Self::Search => "search",
            Self::Analytics => "analytics",
            Self::Views => "views",
            Self::Management => "management",
        };
        f.write_str(s)
    }
}

/// The status byte on a key-value binary protocol response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum KvStatus {
    Success,
    KeyNotFound,
    KeyExists,
    ValueTooLarge,
    InvalidArguments,
    NotStored,
    NotMyVbucket,
    AuthenticationError,
    Locked,
    TemporaryFailure,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    DurabilityInvalidLevel,
    DurabilityImpossible,
    SyncWriteInProgress,
    SyncWriteAmbiguous,
    SubdocPathNotFound,
    SubdocPathMismatch,
    SubdocPathExists,
    SubdocMultiPathFailure,
    /// `AUTH_CONTINUE`: the SASL exchange needs another `SASL_STEP` round trip. Not itself an
    /// error; the connection handshake special-cases it rather than routing it through
    /// [`Self::into_error_kind`].
    AuthContinue,
    Unknown(u16),
}

impl KvStatus {
    pub(crate) fn from_wire(code: u16) -> Self {
        match code {
            0x00 => Self::Success,
            0x01 => Self::KeyNotFound,
            0x02 => Self::KeyExists,
            0x03 => Self::ValueTooLarge,
            0x04 => Self::InvalidArguments,
            0x05 => Self::NotStored,
            0x07 => Self::NotMyVbucket,
            0x09 => Self::Locked,
            0x20 => Self::AuthenticationError,
            0x21 => Self::AuthContinue,
            0x81 => Self::UnknownCommand,
            0x82 => Self::OutOfMemory,
            0x83 => Self::NotSupported,
            0x84 => Self::InternalError,
            0x85 => Self::Busy,
            0x86 => Self::TemporaryFailure,
            0xa0 => Self::DurabilityInvalidLevel,
            0xa1 => Self::DurabilityImpossible,
            0xa2 => Self::SyncWriteInProgress,
            0xa3 => Self::SyncWriteAmbiguous,
            0xc0 => Self::SubdocPathNotFound,
            0xc1 => Self::SubdocPathMismatch,
            0xc5 => Self::SubdocPathExists,
            0xcc => Self::SubdocMultiPathFailure,
            other => Self::Unknown(other),
        }
    }

    pub(crate) fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// True for `SUBDOC_MULTI_PATH_FAILURE`: the overall `lookup_in`/`mutate_in` dispatched, but
    /// one or more of its paths failed independently. The per-path statuses in the response body
    /// carry the real outcome; this top-level status is not itself an error to surface.
    pub(crate) fn is_subdoc_multi_failure(&self) -> bool {
        matches!(self, Self::SubdocMultiPathFailure)
    }

    /// True for `AUTH_CONTINUE`: the SASL exchange is not finished, this is not a failure.
    pub(crate) fn is_auth_continue(&self) -> bool {
        matches!(self, Self::AuthContinue)
    }

    fn into_error_kind(self) -> ErrorKind {
        match self {
            Self::Success => unreachable!("success status does not produce an error"),
            Self::KeyNotFound => ErrorKind::DocumentNotFound,
            Self::KeyExists => ErrorKind::DocumentExists,
            Self::ValueTooLarge => ErrorKind::ValueTooLarge,
            Self::InvalidArguments => ErrorKind::InvalidArgument {
                message: "server rejected request arguments".into(),
            },
            Self::NotStored => ErrorKind::InternalServerFailure {
                message: "item not stored".into(),
            },
            Self::NotMyVbucket => ErrorKind::NotMyVbucket,
            Self::Locked => ErrorKind::DocumentLocked,
            Self::AuthenticationError => ErrorKind::AuthenticationFailure {
                message: "authentication required".into(),
            },
            Self::TemporaryFailure | Self::Busy | Self::OutOfMemory => ErrorKind::TemporaryFailure,
            Self::UnknownCommand | Self::NotSupported => ErrorKind::FeatureNotAvailable,
            Self::InternalError => ErrorKind::InternalServerFailure {
                message: "server internal error".into(),
            },
            Self::DurabilityInvalidLevel => ErrorKind::DurabilityLevelNotAvailable,
            Self::DurabilityImpossible => ErrorKind::DurabilityImpossible,
            Self::SyncWriteInProgress => ErrorKind::SyncWriteInProgress,
            Self::SyncWriteAmbiguous => ErrorKind::SyncWriteAmbiguous,
            Self::SubdocPathNotFound => ErrorKind::PathNotFound,
            Self::SubdocPathMismatch => ErrorKind::PathMismatch,
            Self::SubdocPathExists => ErrorKind::PathExists,
            Self::SubdocMultiPathFailure => {
                unreachable!("multi-path failure is not itself an error; inspect per-path statuses")
            }
            Self::AuthContinue => ErrorKind::AuthenticationFailure {
                message: "unexpected SASL continuation".into(),
            },
            Self::Unknown(code) => ErrorKind::InternalServerFailure {
                message: format!("unrecognized status code {code:#x}"),
            },
        }
    }
}

/// Maps a query-service numeric error code to an [`ErrorKind`], per the documented table.
pub(crate) fn query_error_kind(code: i64, message: String) -> ErrorKind {
    match code {
        1065 => ErrorKind::InvalidArgument { message },
        1080 => ErrorKind::UnambiguousTimeout,
        3000 => ErrorKind::ParsingFailure { message },
        4040..=4090 => ErrorKind::PreparedStatementFailure { message },
        4000..=4999 => ErrorKind::PlanningFailure { message },
        12004 | 12016 => ErrorKind::IndexNotFound { name: message },
        12009 if message.to_ascii_lowercase().contains("cas") => ErrorKind::CasMismatch,
        12009 => ErrorKind::DmlFailure { message },
        12000..=12999 | 14000..=14999 => ErrorKind::IndexFailure { message },
        13014 => ErrorKind::AuthenticationFailure { message },
        _ => ErrorKind::DmlFailure { message },
    }
}

/// Labels this crate attaches to retryable write errors, mirroring the retry-reason
/// bookkeeping carried on [`ErrorContext`]. Exposed for diagnostics, not for control flow.
pub fn retry_reason_labels(error: &Error) -> HashSet<String> {
    error
        .context
        .retry_reasons
        .iter()
        .map(|r| r.to_string())
        .collect()
}
