//! The step DAG executor: typed futures with explicit dependency wiring, a
//! bounded worker pool, and cooperative cancellation.
//!
//! A "step" here is any `Future<Output = Result<T>>` boxed and shared via
//! [`futures::future::Shared`] — cloning a [`Step`] gets you a handle to
//! the same in-flight (or already-resolved) computation, which is how
//! fan-out (`Step<T>: Clone`, pass it to several dependents) and fan-in
//! ([`when_all`]) are both expressed without a bespoke graph type. Because
//! `Shared` requires a `Clone` output, [`crate::error::BuildError`] derives
//! `Clone` (every variant is stringified or otherwise already `Clone`),
//! which removes the usual `Arc<Error>` wrapping dance.

use crate::error::{BuildError, Result};
use futures::future::{FutureExt, Shared};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// A handle to a (possibly still-running) unit of pipeline work. Cheap to
/// clone; every clone observes the same eventual result.
pub type Step<T> = Shared<BoxFuture<T>>;

/// Threaded through every step: the worker-pool permit gate and the
/// cooperative cancellation signal, bundled into one per-pipeline context
/// object rather than mutable global timers.
#[derive(Clone)]
pub struct DagContext {
    semaphore: Arc<Semaphore>,
    cancellation: CancellationToken,
}

impl DagContext {
    /// `workers` is clamped into `[2, 10]`, a sane default pool size for
    /// I/O-bound registry and filesystem work.
    pub fn new(workers: usize) -> Self {
        let workers = workers.clamp(2, 10);
        Self {
            semaphore: Arc::new(Semaphore::new(workers)),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn cancel_all(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Wraps `fut` as a step: acquires a worker-pool permit, then races
    /// the future against the cancellation signal. A step that never gets
    /// scheduled because the pool is saturated still respects
    /// cancellation while it waits for a permit.
    pub fn spawn<T, F>(&self, fut: F) -> Step<T>
    where
        T: Clone + Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let cancellation = self.cancellation.clone();
        let boxed: BoxFuture<T> = Box::pin(async move {
            let permit = tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(BuildError::Cancelled),
                permit = semaphore.acquire_owned() => permit.map_err(|_| BuildError::Cancelled)?,
            };
            let result = tokio::select! {
                biased;
                _ = cancellation.cancelled() => Err(BuildError::Cancelled),
                result = fut => result,
            };
            drop(permit);
            result
        });
        boxed.shared()
    }

    /// A step with no dependencies and no I/O — used to seed a DAG with an
    /// already-known value (e.g. a parsed [`crate::reference::ImageReference`]).
    pub fn ready<T>(&self, value: T) -> Step<T>
    where
        T: Clone + Send + 'static,
    {
        let boxed: BoxFuture<T> = Box::pin(async move { Ok(value) });
        boxed.shared()
    }
}

/// Runs every step to completion concurrently (polled together via
/// [`futures::future::join_all`], so the worker-pool semaphore inside each
/// step's body actually bounds concurrent execution rather than steps
/// running one at a time) and aggregates results in input order. If any
/// step failed, every error is folded into a single `BuildError::Multi`
/// rather than surfacing only the first.
pub async fn when_all<T: Clone + Send + 'static>(steps: Vec<Step<T>>) -> Result<Vec<T>> {
    let results = futures::future::join_all(steps).await;
    let mut values = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(v) => values.push(v),
            Err(e) => errors.push(e),
        }
    }
    match BuildError::aggregate(errors) {
        Some(e) => Err(e),
        None => Ok(values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn independent_steps_all_complete() {
        let ctx = DagContext::new(4);
        let steps: Vec<Step<i32>> = (0..5)
            .map(|i| ctx.spawn(async move { Ok(i * 2) }))
            .collect();
        let results = when_all(steps).await.unwrap();
        assert_eq!(results, vec![0, 2, 4, 6, 8]);
    }

    #[tokio::test]
    async fn a_failed_step_does_not_stop_siblings_from_running() {
        let ctx = DagContext::new(4);
        let ok_step: Step<i32> = ctx.spawn(async { Ok(1) });
        let err_step: Step<i32> = ctx.spawn(async { Err(BuildError::Validation("boom".to_string())) });
        let err = when_all(vec![ok_step, err_step]).await.unwrap_err();
        assert!(matches!(err, BuildError::Validation(_)));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_pending_steps() {
        let ctx = DagContext::new(1);
        ctx.cancel_all();
        let step: Step<i32> = ctx.spawn(async { Ok(1) });
        let err = step.await.unwrap_err();
        assert!(matches!(err, BuildError::Cancelled));
    }

    #[tokio::test]
    async fn dependent_step_awaits_its_dependency_handle() {
        let ctx = DagContext::new(4);
        let base: Step<i32> = ctx.spawn(async { Ok(10) });
        let dependent = {
            let base = base.clone();
            ctx.spawn(async move { base.await.map(|v| v + 1) })
        };
        assert_eq!(dependent.await.unwrap(), 11);
    }
}
