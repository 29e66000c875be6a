#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]

mod auth;
pub mod client;
mod connection;
mod durability;
pub mod error;
mod id;
mod options;
pub mod results;
pub(crate) mod retry;
mod session;
mod topology;
mod wire;

pub(crate) mod runtime;

pub use client::Cluster;
pub use error::{Error, Result};
pub use id::DocumentId;
pub use options::{
    ClusterOptions, Credential, DurabilityLevel, DurabilityRequirement, MutationOptions, PersistTo, ReplicateTo,
    ServerAddress, ServiceTimeouts, TlsOptions,
};
pub use results::{CounterResult, GetResult, MutationResult, MutationToken};
pub use retry::{RetryDecision, RetryReason, RetryStrategy, Retryability, SharedRetryStrategy};
pub use wire::frame::Datatype;
