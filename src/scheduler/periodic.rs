use crate::lock::{OperationGuard, OperationLock};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Work done on a fixed interval under the operation lock.
#[async_trait]
pub trait PeriodicJob: Send + Sync {
    /// Name the operation lock is held under.
    fn name(&self) -> &'static str;

    /// Current interval from configuration. `None` disables the job until
    /// configuration enables it again.
    fn interval(&self) -> Option<Duration>;

    /// Delay before trying again while another operation runs.
    fn retry_interval(&self) -> Duration;

    async fn run(&self, guard: OperationGuard);
}

/// One-shot timer that re-arms itself after every firing.
///
/// The next delay is computed when the timer fires: the configured interval
/// after a run, the retry interval when the lock was taken or the job is
/// disabled.
pub struct RearmingTimer {
    job: Arc<dyn PeriodicJob>,
    lock: OperationLock,
}

impl RearmingTimer {
    pub fn new(job: Arc<dyn PeriodicJob>, lock: OperationLock) -> Self {
        Self { job, lock }
    }

    /// Delay before the first firing.
    pub fn initial_delay(&self) -> Duration {
        self.job
            .interval()
            .unwrap_or_else(|| self.job.retry_interval())
    }

    /// Fires once and returns the delay until the next firing.
    pub async fn fire(&self) -> Duration {
        let name = self.job.name();
        if self.job.interval().is_none() {
            tracing::trace!(job = name, "Periodic job disabled");
            return self.job.retry_interval();
        }

        let Some(guard) = self.lock.try_acquire(name) else {
            let retry = self.job.retry_interval();
            tracing::info!(job = name, holder = ?self.lock.holder(), ?retry, "Operation in progress, retrying later");
            return retry;
        };

        tracing::debug!(job = name, "Periodic job firing");
        self.job.run(guard).await;

        // Re-read so an interval edited during the run applies right away.
        self.job
            .interval()
            .unwrap_or_else(|| self.job.retry_interval())
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut delay = self.initial_delay();
            loop {
                tokio::time::sleep(delay).await;
                delay = self.fire().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: AtomicUsize,
        interval: Option<Duration>,
    }

    #[async_trait]
    impl PeriodicJob for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Option<Duration> {
            self.interval
        }

        fn retry_interval(&self) -> Duration {
            Duration::from_secs(300)
        }

        async fn run(&self, _guard: OperationGuard) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn timer(interval: Option<Duration>) -> (Arc<Counting>, OperationLock, RearmingTimer) {
        let job = Arc::new(Counting {
            runs: AtomicUsize::new(0),
            interval,
        });
        let lock = OperationLock::new();
        let timer = RearmingTimer::new(job.clone(), lock.clone());
        (job, lock, timer)
    }

    #[tokio::test]
    async fn test_fires_and_rearms_for_interval() {
        let (job, lock, timer) = timer(Some(Duration::from_secs(1800)));
        assert_eq!(timer.fire().await, Duration::from_secs(1800));
        assert_eq!(job.runs.load(Ordering::SeqCst), 1);
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn test_blocked_by_running_operation() {
        let (job, lock, timer) = timer(Some(Duration::from_secs(1800)));
        let _guard = lock.try_acquire("update").unwrap();
        assert_eq!(timer.fire().await, Duration::from_secs(300));
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_job_never_runs() {
        let (job, _lock, timer) = timer(None);
        assert_eq!(timer.initial_delay(), Duration::from_secs(300));
        assert_eq!(timer.fire().await, Duration::from_secs(300));
        assert_eq!(job.runs.load(Ordering::SeqCst), 0);
    }
}
