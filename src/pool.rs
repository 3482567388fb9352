//! Bounded background execution for delivery tasks.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use crate::config::{DispatchMode, WORKER_COUNT};

#[derive(Default)]
struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the outstanding counter even if the task panics.
struct TaskGuard(Arc<Outstanding>);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct DispatchPool {
    mode: DispatchMode,
    permits: Arc<Semaphore>,
    outstanding: Arc<Outstanding>,
}

impl DispatchPool {
    pub fn new(mode: DispatchMode) -> Self {
        Self::with_workers(mode, WORKER_COUNT)
    }

    pub fn with_workers(mode: DispatchMode, workers: usize) -> Self {
        Self {
            mode,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            outstanding: Arc::new(Outstanding::default()),
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Tasks submitted and not yet finished.
    pub fn outstanding(&self) -> usize {
        self.outstanding.count.load(Ordering::Acquire)
    }

    /// Pooled: queue the task and return at once. Inline: run it to completion
    /// before returning.
    ///
    /// Pooled mode must be called from within a tokio runtime.
    pub async fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.mode {
            DispatchMode::Inline => task.await,
            DispatchMode::Pooled => {
                self.outstanding.count.fetch_add(1, Ordering::AcqRel);
                let guard = TaskGuard(self.outstanding.clone());
                let permits = self.permits.clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    // The semaphore is never closed.
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };
                    task.await;
                });
            }
        }
    }

    /// Wait until every outstanding task has finished or `timeout` elapses.
    /// Returns `true` when the pool went idle. Does not cancel anything.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let outstanding = self.outstanding.clone();
        let wait = async move {
            loop {
                let notified = outstanding.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if outstanding.count.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };
        let idle = tokio::time::timeout(timeout, wait).await.is_ok();
        if !idle {
            tracing::warn!(
                outstanding = self.outstanding(),
                "dispatch pool did not drain before timeout"
            );
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pooled_submit_returns_before_task_runs() {
        let pool = DispatchPool::new(DispatchMode::Pooled);
        let gate = Arc::new(Notify::new());
        let done = Arc::new(AtomicUsize::new(0));

        let (g, d) = (gate.clone(), done.clone());
        pool.submit(async move {
            g.notified().await;
            d.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        assert_eq!(done.load(Ordering::SeqCst), 0);
        assert_eq!(pool.outstanding(), 1);
        assert!(!pool.drain(Duration::from_millis(50)).await);

        gate.notify_one();
        assert!(pool.drain(Duration::from_secs(5)).await);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inline_submit_runs_before_returning() {
        let pool = DispatchPool::new(DispatchMode::Inline);
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        pool.submit(async move {
            d.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(pool.drain(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_worker_count() {
        let pool = DispatchPool::new(DispatchMode::Pooled);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let (running, peak) = (running.clone(), peak.clone());
            pool.submit(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .await;
        }

        assert!(pool.drain(Duration::from_secs(10)).await);
        assert!(peak.load(Ordering::SeqCst) <= WORKER_COUNT);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn panicking_task_does_not_wedge_drain() {
        let pool = DispatchPool::new(DispatchMode::Pooled);
        pool.submit(async {
            panic!("boom");
        })
        .await;
        assert!(pool.drain(Duration::from_secs(5)).await);
        assert_eq!(pool.outstanding(), 0);
    }
}
