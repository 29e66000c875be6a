//! Thin wrappers around the `tokio` runtime used throughout the crate.
//!
//! There is exactly one runtime backend (`tokio`); unlike the driver this crate grew out of,
//! we dropped the `async-std` abstraction layer since nothing downstream of this module needs
//! it and the indirection bought nothing but an extra enum arm per call site.

mod join_handle;
#[cfg(feature = "openssl-tls")]
pub(crate) mod tls_openssl;
#[cfg(feature = "rustls-tls")]
pub(crate) mod tls_rustls;
pub(crate) mod stream;

use std::{future::Future, time::Duration};

pub(crate) use join_handle::AsyncJoinHandle;

use crate::error::{Error, Result};

/// Spawn a future onto the runtime's thread pool. The returned handle can be awaited for the
/// future's output or dropped to detach it.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    tokio::task::spawn(fut).into()
}

/// Run `fut` to completion, failing with an `unambiguous_timeout` error if `duration` elapses
/// first. Callers decide whether a timed-out mutation is ambiguous based on whether any bytes
/// were written to the wire before the timeout fired.
pub(crate) async fn timeout<F>(duration: Duration, fut: F) -> Result<F::Output>
where
    F: Future,
{
    tokio::time::timeout(duration, fut)
        .await
        .map_err(|_| Error::unambiguous_timeout())
}

/// Suspend the current task for `duration`. Used for retry backoff and durability-poll
/// intervals.
pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}
