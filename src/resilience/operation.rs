//! A unit of asynchronous work that may fail.

use std::future::Future;

/// Work submitted to the pipeline.
///
/// Consumed on invocation. The future and its outputs are `Send + 'static`
/// because a timed-out operation may be detached onto the runtime and
/// outlive the caller's wait.
pub trait Operation: Send + 'static {
    type Output: Send + 'static;
    type Error: Send + 'static;
    type Future: Future<Output = Result<Self::Output, Self::Error>> + Send + 'static;

    fn call(self) -> Self::Future;
}

impl<F, Fut, T, E> Operation for F
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    type Output = T;
    type Error = E;
    type Future = Fut;

    fn call(self) -> Self::Future {
        self()
    }
}
