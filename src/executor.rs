use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::Serialize;
use tracing::warn;

#[derive(Debug)]
pub enum JobError<E> {
    Failed(E),
    Panicked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutorStats {
    pub workers: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub panicked: usize,
}

/// Runs `worker` over `items` with at most `max_concurrency` jobs outstanding.
///
/// Workers share a cursor and keep claiming the next unclaimed item until the
/// list is exhausted. `on_result` sees every outcome, including failures; one
/// failing or panicking job never stops the others.
pub async fn run_all<T, R, E, W, Fut, C>(
    items: &[T],
    max_concurrency: usize,
    worker: W,
    on_result: C,
) -> ExecutorStats
where
    W: Fn(&T) -> Fut,
    Fut: Future<Output = Result<R, E>>,
    C: Fn(&T, Result<R, JobError<E>>),
{
    let worker_count = max_concurrency.max(1).min(items.len());
    if worker_count == 0 {
        return ExecutorStats::default();
    }

    let cursor = AtomicUsize::new(0);
    let succeeded = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let panicked = AtomicUsize::new(0);

    let (cursor, succeeded, failed, panicked) = (&cursor, &succeeded, &failed, &panicked);
    let (worker, on_result) = (&worker, &on_result);
    let workers = (0..worker_count).map(|_| async move {
        loop {
            let index = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(item) = items.get(index) else {
                break;
            };

            let outcome = AssertUnwindSafe(async { worker(item).await })
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(Ok(value)) => {
                    succeeded.fetch_add(1, Ordering::Relaxed);
                    Ok(value)
                }
                Ok(Err(err)) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    Err(JobError::Failed(err))
                }
                Err(_) => {
                    warn!(index, "executor job panicked");
                    panicked.fetch_add(1, Ordering::Relaxed);
                    Err(JobError::Panicked)
                }
            };
            on_result(item, result);
        }
    });
    join_all(workers).await;

    ExecutorStats {
        workers: worker_count,
        dispatched: items.len(),
        succeeded: succeeded.load(Ordering::SeqCst),
        failed: failed.load(Ordering::SeqCst),
        panicked: panicked.load(Ordering::SeqCst),
    }
}
