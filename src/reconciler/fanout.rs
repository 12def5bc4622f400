//! Bounded per-device fan-out with a join barrier
//!
//! Spawns one task per item, at most `concurrency` running at a time, and
//! returns only once every task has finished.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Runs `f` for every item concurrently and collects the results in input
/// order. A panicking task is logged and its result dropped.
pub async fn fan_out<I, T, F, Fut>(items: Vec<I>, concurrency: usize, f: F) -> Vec<T>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = T> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let f = Arc::new(f);
    let mut handles = Vec::with_capacity(items.len());

    for item in items {
        // the semaphore is never closed
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };
        let f = f.clone();
        handles.push(tokio::spawn(async move {
            let result = f(item).await;
            drop(permit);
            result
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => tracing::error!(error = %e, "Device task failed"),
        }
    }
    results
}
