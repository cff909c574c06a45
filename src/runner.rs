//! # Bounded Task Runner
//!
//! Fans out independent async operations with a fixed concurrency ceiling.
//! Everything in the engine that performs concurrent work (fetches,
//! per-item identification phases, pairwise scoring) goes through one
//! shared runner.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

/// Semaphore-gated task fan-out with a cooperative stop flag.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    permits: Arc<Semaphore>,
    stop: Arc<AtomicBool>,
}

impl TaskRunner {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request a drain: nothing new starts, in-flight work completes and
    /// its results are still merged.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Run one future on the current task, counted against the same
    /// concurrency ceiling as [`Self::run_all`]. Used for awaits that must
    /// stay inline with their caller (fetch, decode) rather than fan out.
    pub async fn run_one<T>(&self, future: impl Future<Output = T>) -> T {
        let _permit = self.permits.acquire().await.ok();
        future.await
    }

    /// Run all futures with at most the configured number in flight.
    /// Results are returned in completion order. Futures not yet started
    /// when the stop flag is raised are skipped; a panicking task is logged
    /// and dropped without aborting its siblings.
    pub async fn run_all<T, F>(&self, futures: impl IntoIterator<Item = F>) -> Vec<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let mut set = JoinSet::new();
        for future in futures {
            if self.is_stopped() {
                break;
            }
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break, // semaphore closed, nothing more can run
            };
            set.spawn(async move {
                let result = future.await;
                drop(permit);
                result
            });
        }

        let mut results = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => warn!(error = %err, "task failed to join"),
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn ceiling_is_respected() {
        let runner = TaskRunner::new(3);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..20)
            .map(|_| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
            })
            .collect();

        runner.run_all(futures).await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn run_one_shares_the_ceiling() {
        let runner = TaskRunner::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut set = JoinSet::new();
        for _ in 0..10 {
            let runner = runner.clone();
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            set.spawn(async move {
                runner
                    .run_one(async {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            });
        }
        while set.join_next().await.is_some() {}

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn all_results_are_collected() {
        let runner = TaskRunner::new(4);
        let mut results = runner.run_all((0..10).map(|i| async move { i })).await;
        results.sort();
        assert_eq!(results, (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn stop_prevents_new_work() {
        let runner = TaskRunner::new(2);
        runner.stop();
        let results = runner.run_all((0..10).map(|i| async move { i })).await;
        assert!(results.is_empty());
    }
}
