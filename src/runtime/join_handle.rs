/// Handle to a task spawned onto the runtime. Polling it yields the task's
/// output, translating a panic/cancellation into a crate [`Error`](crate::error::Error).
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T> {
    inner: tokio::task::JoinHandle<T>,
}

impl<T> AsyncJoinHandle<T> {
    pub(crate) fn abort(&self) {
        self.inner.abort();
    }
}

impl<T> From<tokio::task::JoinHandle<T>> for AsyncJoinHandle<T> {
    fn from(inner: tokio::task::JoinHandle<T>) -> Self {
        Self { inner }
    }
}

impl<T> std::future::Future for AsyncJoinHandle<T> {
    type Output = crate::error::Result<T>;

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        std::pin::Pin::new(&mut self.inner).poll(cx).map(|res| {
            res.map_err(|e| crate::error::Error::internal(format!("task join failed: {e}")))
        })
    }
}
