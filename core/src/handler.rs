use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::job::Job;

/// Per-attempt context handed to a [`JobHandler`].
#[derive(Clone, Debug)]
pub struct JobContext {
    /// Zero-based attempt number (equals the job's retry count).
    pub attempt: u32,
    /// Fired when the job is cancelled while this attempt is in flight.
    /// Observing it is up to the handler; the attempt is never aborted.
    pub cancel: CancellationToken,
}

/// Does the work for one job type.
///
/// `Ok(value)` completes the job with `value` as its result. `Err` (or a
/// panic) counts as a failed attempt and goes through the retry table.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Run one attempt of `job`.
    async fn handle(&self, job: Job, ctx: JobContext) -> anyhow::Result<Value>;
}

/// [`JobHandler`] backed by an async closure. Build with [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a [`JobHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, job: Job, ctx: JobContext) -> anyhow::Result<Value> {
        (self.0)(job, ctx).await
    }
}
