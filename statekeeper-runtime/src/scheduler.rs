//! Periodic timeout sweeping.

use crate::config::SweepConfig;
use crate::runtime::Runtime;
use parking_lot::Mutex;
use statekeeper_core::{Clock, SweepReport, Sweeper};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Runs the sweeper every `interval_secs`, or sooner when triggered.
pub struct SweepScheduler {
    sweeper: Arc<Sweeper>,
    clock: Arc<dyn Clock>,
    config: SweepConfig,
    passes: AtomicU64,
    triggered: AtomicU64,
    failures: AtomicU64,
    last_sweep: Mutex<Option<Instant>>,
    shutdown: AtomicBool,
    notify: Notify,
}

impl SweepScheduler {
    pub fn new(sweeper: Arc<Sweeper>, clock: Arc<dyn Clock>, config: SweepConfig) -> Self {
        Self {
            sweeper,
            clock,
            config,
            passes: AtomicU64::new(0),
            triggered: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_sweep: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn for_runtime(runtime: &Runtime) -> Self {
        Self::new(
            Arc::clone(runtime.sweeper()),
            Arc::clone(runtime.clock()),
            runtime.config().sweep.clone(),
        )
    }

    /// Runs one sweep pass now.
    pub fn sweep_once(&self) -> Option<SweepReport> {
        let report = match self.sweeper.sweep(self.clock.now()) {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(error = %e, "Sweep failed");
                self.failures.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        self.passes.fetch_add(1, Ordering::Relaxed);
        self.triggered
            .fetch_add(report.triggered as u64, Ordering::Relaxed);
        self.failures
            .fetch_add(report.failures.len() as u64, Ordering::Relaxed);
        *self.last_sweep.lock() = Some(Instant::now());
        Some(report)
    }

    /// Runs the sweep loop (call from a background task).
    pub async fn run(&self) {
        if self.config.is_disabled() {
            tracing::info!("Timeout sweep is disabled");
            return;
        }

        tracing::info!(
            "Sweep scheduler started (interval={}s)",
            self.config.interval_secs
        );

        let interval = self.config.interval();

        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            if let Some(report) = self.sweep_once() {
                if report.due > 0 {
                    tracing::debug!(
                        "Sweep pass complete: {} due, {} triggered",
                        report.due,
                        report.triggered
                    );
                }
            }
        }

        tracing::info!("Sweep scheduler stopped");
    }

    /// Wakes the loop for an immediate pass.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// Signals the loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn stats(&self) -> SweepStats {
        SweepStats {
            passes: self.passes.load(Ordering::Relaxed),
            triggered: self.triggered.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            since_last_sweep: self.last_sweep.lock().map(|at| at.elapsed()),
        }
    }
}

/// Sweep statistics.
#[derive(Debug, Clone, Copy)]
pub struct SweepStats {
    pub passes: u64,
    pub triggered: u64,
    pub failures: u64,
    pub since_last_sweep: Option<Duration>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::tests::test_runtime;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use serde_json::json;
    use statekeeper_core::{ManualClock, Subject};
    use statekeeper_storage::StoredRecord;

    #[tokio::test]
    async fn test_trigger_runs_a_pass() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        ));
        let runtime = test_runtime(clock.clone());
        runtime
            .storage()
            .put_record(StoredRecord::new("article", json!(1)))
            .unwrap();
        {
            let binding = runtime.binding("article", None).unwrap();
            let mut subject = runtime.subject("article", &json!(1)).unwrap();
            binding.init(&mut subject, None).unwrap();
        }
        clock.advance(ChronoDuration::hours(3));

        let scheduler = Arc::new(SweepScheduler::for_runtime(&runtime));
        let handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run().await })
        };

        scheduler.trigger();
        for _ in 0..200 {
            if scheduler.stats().passes > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        scheduler.shutdown();
        handle.await.unwrap();

        let stats = scheduler.stats();
        assert!(stats.passes >= 1);
        assert_eq!(stats.triggered, 1);
        assert!(stats.since_last_sweep.is_some());

        let subject = runtime.subject("article", &json!(1)).unwrap();
        assert_eq!(subject.get("status_id"), Some(json!("archived")));
    }

    #[tokio::test]
    async fn test_disabled_scheduler_returns() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let runtime = test_runtime(clock);
        let mut config = runtime.config().sweep.clone();
        config.enabled = false;

        let scheduler = SweepScheduler::new(
            Arc::clone(runtime.sweeper()),
            Arc::clone(runtime.clock()),
            config,
        );
        scheduler.run().await;
        assert_eq!(scheduler.stats().passes, 0);
    }

    #[test]
    fn test_sweep_once_counts() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let runtime = test_runtime(clock);
        let scheduler = SweepScheduler::for_runtime(&runtime);
        let report = scheduler.sweep_once().unwrap();
        assert_eq!(report.due, 0);
        assert_eq!(scheduler.stats().passes, 1);
        assert_eq!(scheduler.stats().triggered, 0);
    }
}
