//! Repeating reconciliation task
//!
//! A [`PollLoop`] ticks at a fixed interval while started. Each tick is
//! bounded by the tick budget; a slow tick is abandoned and the ticks it
//! overlapped are skipped, never queued. The loop only holds a weak reference
//! to its target and ends by itself once the target is dropped.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Whatever a tick does
#[async_trait]
pub trait PollTarget: Send + Sync {
    async fn poll(&self) -> Result<()>;
}

#[derive(Debug)]
pub struct PollLoop {
    interval: Duration,
    budget: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollLoop {
    /// Loop with a tick budget equal to the interval
    pub fn new(interval: Duration) -> Self {
        Self::with_budget(interval, interval)
    }

    pub fn with_budget(interval: Duration, budget: Duration) -> Self {
        Self {
            interval,
            budget,
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start ticking; the first tick runs immediately
    ///
    /// Returns false if already running.
    pub fn start(&self, target: Weak<dyn PollTarget>) -> bool {
        let Ok(mut task) = self.task.lock() else {
            return false;
        };
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return false;
        }

        let interval = self.interval;
        let budget = self.budget;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let Some(target) = target.upgrade() else {
                    tracing::debug!("poll target dropped, stopping");
                    break;
                };

                match tokio::time::timeout(budget, target.poll()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) if e.is_configuration_error() => {
                        tracing::debug!(error = %e, "poll skipped");
                    }
                    Ok(Err(e)) if e.is_retryable() => {
                        tracing::debug!(error = %e, "poll failed, retrying next tick");
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "poll failed"),
                    Err(_) => tracing::warn!(budget_ms = budget.as_millis() as u64, "poll exceeded its budget"),
                }
            }
        }));

        tracing::debug!(interval_ms = interval.as_millis() as u64, "poll loop started");
        true
    }

    /// Stop ticking; an in-flight tick is abandoned
    ///
    /// Returns false if not running.
    pub fn stop(&self) -> bool {
        let handle = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(_) => None,
        };

        match handle {
            Some(handle) => {
                let was_running = !handle.is_finished();
                handle.abort();
                if was_running {
                    tracing::debug!("poll loop stopped");
                }
                was_running
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|t| t.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }
}

impl Drop for PollLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OfflineError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counter {
        ticks: AtomicUsize,
        work: Duration,
    }

    #[async_trait]
    impl PollTarget for Counter {
        async fn poll(&self) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            Err(OfflineError::transient("server down"))
        }
    }

    fn counter(work: Duration) -> Arc<Counter> {
        Arc::new(Counter {
            ticks: AtomicUsize::new(0),
            work,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_while_running() {
        let target = counter(Duration::ZERO);
        let weak: Weak<dyn PollTarget> = Arc::downgrade(&target) as Weak<dyn PollTarget>;
        let poll_loop = PollLoop::new(Duration::from_secs(2));

        assert!(poll_loop.start(weak.clone()));
        assert!(!poll_loop.start(weak));
        assert!(poll_loop.is_running());

        tokio::time::sleep(Duration::from_millis(6_100)).await;
        assert_eq!(target.ticks.load(Ordering::SeqCst), 4);

        assert!(poll_loop.stop());
        assert!(!poll_loop.is_running());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(target.ticks.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_ticks_are_skipped_not_queued() {
        let target = counter(Duration::from_secs(60));
        let weak: Weak<dyn PollTarget> = Arc::downgrade(&target) as Weak<dyn PollTarget>;
        let poll_loop = PollLoop::with_budget(Duration::from_secs(2), Duration::from_secs(3));
        poll_loop.start(weak);

        // Each tick is cut off after 3s; the missed slots are not replayed
        tokio::time::sleep(Duration::from_millis(8_100)).await;
        let ticks = target.ticks.load(Ordering::SeqCst);
        assert!(ticks <= 3, "ticks = {}", ticks);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ends_when_target_dropped() {
        let target = counter(Duration::ZERO);
        let weak: Weak<dyn PollTarget> = Arc::downgrade(&target) as Weak<dyn PollTarget>;
        let poll_loop = PollLoop::new(Duration::from_secs(1));
        poll_loop.start(weak);

        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(target);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!poll_loop.is_running());
    }
}
