//! Bounded-concurrency fan-out with per-item failure isolation.
//!
//! - [`process_in_batches`]: fixed groups with a barrier between them. Peak
//!   concurrency is exactly the batch size and the barrier is the only
//!   backpressure.
//! - [`process_with_concurrency_limit`]: sliding window, a new item starts as
//!   soon as any in-flight one finishes.
//! - [`process_in_batches_with_retry`]: batches plus a per-item linear backoff
//!   retry.
//!
//! A failing item never aborts its batch or later batches; its error is kept
//! in its [`BatchResult`]. Results always come back in input order.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::debug;

/// Outcome for one input item.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult<I, T, E> {
    pub item: I,
    pub outcome: Result<T, E>,
    /// Times the worker was invoked for this item.
    pub attempts: u32,
}

impl<I, T, E> BatchResult<I, T, E> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&E> {
        self.outcome.as_ref().err()
    }
}

/// Success/failure tally over a result set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchSummary {
    pub fn from_results<I, T, E>(results: &[BatchResult<I, T, E>]) -> Self {
        let succeeded = results.iter().filter(|r| r.is_success()).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
        }
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.succeeded == 0
    }
}

/// Run `worker` over `items` in sequential groups of `batch_size`.
///
/// Every item in a group runs concurrently; the next group starts only after
/// all of the current group's futures have settled. `batch_size == 0` is
/// treated as 1.
pub async fn process_in_batches<I, T, E, F, Fut>(
    items: Vec<I>,
    worker: F,
    batch_size: usize,
) -> Vec<BatchResult<I, T, E>>
where
    I: Clone,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let batch_size = batch_size.max(1);
    let total_batches = items.len().div_ceil(batch_size);
    let mut results = Vec::with_capacity(items.len());

    for (index, chunk) in items.chunks(batch_size).enumerate() {
        debug!(batch = index + 1, total_batches, size = chunk.len(), "processing batch");

        let outcomes = join_all(chunk.iter().cloned().map(&worker)).await;
        results.extend(
            chunk
                .iter()
                .cloned()
                .zip(outcomes)
                .map(|(item, outcome)| BatchResult {
                    item,
                    outcome,
                    attempts: 1,
                }),
        );
    }

    results
}

/// Run `worker` over `items` with at most `limit` calls in flight.
pub async fn process_with_concurrency_limit<I, T, E, F, Fut>(
    items: Vec<I>,
    worker: F,
    limit: usize,
) -> Vec<BatchResult<I, T, E>>
where
    I: Clone,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let worker = &worker;

    let mut indexed: Vec<(usize, BatchResult<I, T, E>)> = stream::iter(items.into_iter().enumerate())
        .map(|(index, item)| async move {
            let outcome = worker(item.clone()).await;
            (
                index,
                BatchResult {
                    item,
                    outcome,
                    attempts: 1,
                },
            )
        })
        .buffer_unordered(limit.max(1))
        .collect()
        .await;

    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, result)| result).collect()
}

/// [`process_in_batches`] with up to `max_retries` extra attempts per item,
/// waiting `retry_delay * attempt` between attempts.
///
/// Partial failure is a normal return value: each item's final error is in
/// its result.
pub async fn process_in_batches_with_retry<I, T, E, F, Fut>(
    items: Vec<I>,
    worker: F,
    batch_size: usize,
    max_retries: u32,
    retry_delay: Duration,
) -> Vec<BatchResult<I, T, E>>
where
    I: Clone,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let batch_size = batch_size.max(1);
    let worker = &worker;
    let mut results = Vec::with_capacity(items.len());

    for chunk in items.chunks(batch_size) {
        let settled = join_all(chunk.iter().cloned().map(|item| async move {
            let mut attempt = 0;
            loop {
                attempt += 1;
                match worker(item.clone()).await {
                    Ok(value) => {
                        return BatchResult {
                            item,
                            outcome: Ok(value),
                            attempts: attempt,
                        };
                    }
                    Err(err) if attempt > max_retries => {
                        return BatchResult {
                            item,
                            outcome: Err(err),
                            attempts: attempt,
                        };
                    }
                    Err(err) => {
                        debug!(attempt, error = %err, "batch item failed, retrying");
                        tokio::time::sleep(retry_delay * attempt).await;
                    }
                }
            }
        }))
        .await;

        results.extend(settled);
    }

    results
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Tracks in-flight calls and the peak seen.
    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batches_isolate_failures_preserve_order_and_cap_concurrency() {
        let gauge = Gauge::default();
        let items: Vec<u32> = (1..=10).collect();

        let results = process_in_batches(
            items,
            |n| {
                let gauge = &gauge;
                async move {
                    gauge.enter();
                    // Later items finish first to scramble completion order.
                    tokio::time::sleep(Duration::from_millis(100 - u64::from(n) * 5)).await;
                    gauge.exit();
                    if n == 2 || n == 7 {
                        Err(format!("item {n} failed"))
                    } else {
                        Ok(n * 10)
                    }
                }
            },
            3,
        )
        .await;

        assert_eq!(results.len(), 10);
        let order: Vec<u32> = results.iter().map(|r| r.item).collect();
        assert_eq!(order, (1..=10).collect::<Vec<_>>());

        let failed: Vec<u32> = results.iter().filter(|r| !r.is_success()).map(|r| r.item).collect();
        assert_eq!(failed, vec![2, 7]);
        assert_eq!(results[6].error().map(String::as_str), Some("item 7 failed"));
        assert_eq!(results[0].value(), Some(&10));

        assert!(gauge.peak() <= 3);
        assert_eq!(gauge.peak(), 3);

        let summary = BatchSummary::from_results(&results);
        assert_eq!((summary.total, summary.succeeded, summary.failed), (10, 8, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn next_batch_waits_for_the_slowest_item() {
        let starts = Mutex::new(Vec::new());
        let t0 = tokio::time::Instant::now();

        process_in_batches(
            vec![500u64, 10, 10, 10],
            |ms| {
                let starts = &starts;
                async move {
                    starts.lock().unwrap().push(t0.elapsed().as_millis());
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok::<_, ()>(())
                }
            },
            3,
        )
        .await;

        let starts = starts.into_inner().unwrap();
        assert_eq!(starts, vec![0, 0, 0, 500]);
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_window_starts_next_item_without_a_barrier() {
        let gauge = Gauge::default();
        let starts = Mutex::new(Vec::new());
        let t0 = tokio::time::Instant::now();

        let results = process_with_concurrency_limit(
            vec![500u64, 10, 10, 10],
            |ms| {
                let (gauge, starts) = (&gauge, &starts);
                async move {
                    gauge.enter();
                    starts.lock().unwrap().push(t0.elapsed().as_millis());
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    gauge.exit();
                    Ok::<_, ()>(ms)
                }
            },
            3,
        )
        .await;

        let mut starts = starts.into_inner().unwrap();
        starts.sort();
        assert_eq!(starts, vec![0, 0, 0, 10]);
        assert!(gauge.peak() <= 3);

        let order: Vec<u64> = results.iter().map(|r| r.item).collect();
        assert_eq!(order, vec![500, 10, 10, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_variant_recovers_flaky_items_and_reports_the_rest() {
        let attempts = Mutex::new(std::collections::HashMap::<char, u32>::new());

        let results = process_in_batches_with_retry(
            vec!['a', 'b', 'c'],
            |c| {
                let attempts = &attempts;
                async move {
                    let n = {
                        let mut map = attempts.lock().unwrap();
                        let n = map.entry(c).or_insert(0);
                        *n += 1;
                        *n
                    };
                    match c {
                        'a' => Ok(c),
                        'b' if n >= 2 => Ok(c),
                        _ => Err(format!("{c} failed on attempt {n}")),
                    }
                }
            },
            2,
            2,
            Duration::from_millis(100),
        )
        .await;

        assert!(results[0].is_success());
        assert_eq!(results[0].attempts, 1);
        assert!(results[1].is_success());
        assert_eq!(results[1].attempts, 2);
        assert_eq!(results[2].attempts, 3);
        assert_eq!(results[2].error().map(String::as_str), Some("c failed on attempt 3"));
    }

    #[tokio::test]
    async fn empty_input_and_zero_batch_size() {
        let results = process_in_batches(Vec::<u8>::new(), |n| async move { Ok::<_, ()>(n) }, 0).await;
        assert!(results.is_empty());

        let results = process_in_batches(vec![1u8, 2], |n| async move { Ok::<_, ()>(n) }, 0).await;
        assert_eq!(results.len(), 2);

        let summary = BatchSummary::from_results::<u8, u8, ()>(&[]);
        assert!(summary.all_succeeded());
        assert!(!summary.all_failed());
    }
}
