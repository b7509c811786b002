//! Scheduler - bounded parallelism and cooperative cancellation
//!
//! Sounding candidates, evaluator calls and async sub-cascades all run under
//! one per-cascade pool. Workers acquire a slot before any model call and
//! hold it for the duration of the candidate body. Cancellation is a
//! cooperative token checked between suspension points; cancelling never
//! emits misleading success events because workers return `Cancelled`
//! instead of a result.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::CascadeError;

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation token
///
/// Children created with [`CancelToken::child`] observe their parent's
/// cancellation as well as their own, so cancelling a cascade fans out to
/// every sounding worker and sub-cascade it spawned.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation; idempotent
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire) || self.parent.as_ref().is_some_and(|p| p.is_cancelled())
    }

    /// Error if cancellation has been requested
    pub fn check(&self) -> Result<(), CascadeError> {
        if self.is_cancelled() {
            Err(CascadeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Derive a child token that also observes this token's cancellation
    pub fn child(&self) -> CancelToken {
        CancelToken {
            inner: Arc::new(CancelInner::default()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Resolve once cancellation is requested on this token or any ancestor
    pub fn cancelled(&self) -> futures::future::BoxFuture<'_, ()> {
        Box::pin(async move {
            loop {
                let own = self.inner.notify.notified();
                // Check after registering the waiter so a concurrent cancel
                // cannot slip between check and await
                if self.is_cancelled() {
                    return;
                }
                match &self.parent {
                    Some(parent) => {
                        tokio::select! {
                            _ = own => {}
                            _ = parent.cancelled() => {}
                        }
                    }
                    None => own.await,
                }
            }
        })
    }
}

/// Snapshot of scheduler counters
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub total_acquired: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

/// Bounded worker pool for parallel work inside a cascade
pub struct Scheduler {
    semaphore: Arc<Semaphore>,
    max_parallel: usize,
    in_flight: Arc<AtomicUsize>,
    total_acquired: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Held for the duration of one unit of parallel work
pub struct SchedulerPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for SchedulerPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Scheduler {
    pub fn new(max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
            in_flight: Arc::new(AtomicUsize::new(0)),
            total_acquired: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Acquire a slot, or return `Cancelled` if the token fires first
    pub async fn acquire(&self, cancel: &CancelToken) -> Result<SchedulerPermit, CascadeError> {
        cancel.check()?;

        let semaphore = self.semaphore.clone();
        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Scheduler: acquisition cancelled");
                return Err(CascadeError::Cancelled);
            }
            permit = semaphore.acquire_owned() => {
                permit.map_err(|_| CascadeError::Cancelled)?
            }
        };

        self.total_acquired.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        Ok(SchedulerPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            total_acquired: self.total_acquired.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_token_lifecycle() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check().is_ok());

        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(CascadeError::Cancelled)));

        // Idempotent
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_observes_parent_cancel() {
        let parent = CancelToken::new();
        let child = parent.child();

        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(parent.child().check().is_err());
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves() {
        let token = CancelToken::new();
        let waiter = token.clone();

        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert!(tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_scheduler_bounds_parallelism() {
        let scheduler = Arc::new(Scheduler::new(2));
        let cancel = CancelToken::new();

        let p1 = scheduler.acquire(&cancel).await.unwrap();
        let _p2 = scheduler.acquire(&cancel).await.unwrap();
        assert_eq!(scheduler.stats().in_flight, 2);

        // Third acquisition must wait until a permit drops
        let sched = scheduler.clone();
        let cancel2 = cancel.clone();
        let third = tokio::spawn(async move { sched.acquire(&cancel2).await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!third.is_finished());

        drop(p1);
        assert!(tokio::time::timeout(Duration::from_secs(1), third).await.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_acquire_respects_cancellation() {
        let scheduler = Scheduler::new(1);
        let cancel = CancelToken::new();
        let _held = scheduler.acquire(&cancel).await.unwrap();

        cancel.cancel();
        let result = scheduler.acquire(&cancel).await;
        assert!(matches!(result, Err(CascadeError::Cancelled)));
    }

    #[tokio::test]
    async fn test_stats_track_peak() {
        let scheduler = Scheduler::new(4);
        let cancel = CancelToken::new();

        let a = scheduler.acquire(&cancel).await.unwrap();
        let b = scheduler.acquire(&cancel).await.unwrap();
        drop(a);
        drop(b);

        let stats = scheduler.stats();
        assert_eq!(stats.total_acquired, 2);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.peak_in_flight, 2);
    }

    #[test]
    fn test_zero_parallelism_clamped() {
        let scheduler = Scheduler::new(0);
        assert_eq!(scheduler.max_parallel(), 1);
    }
}
