//! Shared I/O worker pool
//!
//! One semaphore per run bounds registry and OSV requests combined. When
//! the pool saturates, callers suspend; there is no queue beyond the pool
//! and no unbounded buffering behind it.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size.max(1))),
        }
    }

    /// Run `fut` under a pool permit, suspending until one frees up
    pub async fn throttle<F: Future>(&self, fut: F) -> F::Output {
        // the semaphore is never closed; an error here means the process
        // is tearing down, and running unthrottled is the safe default
        let _permit = self.permits.clone().acquire_owned().await.ok();
        fut.await
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_bound_is_enforced() {
        let pool = WorkerPool::new(2);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.throttle(async {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_throttle_returns_output() {
        let pool = WorkerPool::new(1);
        let value = pool.throttle(async { 42 }).await;
        assert_eq!(value, 42);
    }
}
