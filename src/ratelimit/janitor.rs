//! Background reclamation of idle token buckets.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::registry::LimiterRegistry;

/// Counters describing a janitor's work so far.
#[derive(Debug, Default)]
pub struct JanitorStats {
    sweeps: AtomicU64,
    evicted: AtomicU64,
    last_sweep: Mutex<Option<DateTime<Utc>>>,
}

/// Point-in-time copy of [`JanitorStats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JanitorReport {
    pub registry: String,
    pub sweeps: u64,
    pub evicted: u64,
    pub last_sweep: Option<DateTime<Utc>>,
}

impl JanitorStats {
    fn record(&self, evicted: usize) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        *self.last_sweep.lock() = Some(Utc::now());
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn last_sweep(&self) -> Option<DateTime<Utc>> {
        *self.last_sweep.lock()
    }

    /// Snapshot of the counters, labelled with the registry they describe.
    pub fn report(&self, registry: &str) -> JanitorReport {
        JanitorReport {
            registry: registry.to_string(),
            sweeps: self.sweeps(),
            evicted: self.evicted(),
            last_sweep: self.last_sweep(),
        }
    }
}

/// Periodically evicts idle buckets from one registry.
pub struct Janitor {
    registry: Arc<LimiterRegistry>,
    interval: Duration,
    idle_after: Duration,
    stats: Arc<JanitorStats>,
}

impl Janitor {
    /// Create a janitor that sweeps every `interval` and evicts buckets that
    /// are full and untouched for `idle_after`. A zero `idle_after` evicts
    /// every full bucket.
    pub fn new(registry: Arc<LimiterRegistry>, interval: Duration, idle_after: Duration) -> Self {
        Self {
            registry,
            // tokio::time::interval panics on a zero period
            interval: interval.max(Duration::from_millis(1)),
            idle_after,
            stats: Arc::new(JanitorStats::default()),
        }
    }

    /// Run one sweep now. Returns the number of buckets evicted.
    pub fn sweep_once(&self) -> usize {
        let started = Instant::now();
        let evicted = self.registry.sweep(started, self.idle_after);
        self.stats.record(evicted);

        debug!(
            registry = self.registry.name(),
            evicted,
            remaining = self.registry.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Janitor sweep complete"
        );
        evicted
    }

    /// Move the janitor onto the tokio runtime.
    ///
    /// The task runs until [`JanitorHandle::shutdown`] is called or the
    /// handle is dropped. The first sweep happens one `interval` after
    /// spawning.
    pub fn spawn(self) -> JanitorHandle {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let stats = Arc::clone(&self.stats);
        let registry = self.registry.name().to_string();

        info!(
            registry = %registry,
            interval_secs = self.interval.as_secs_f64(),
            idle_after_secs = self.idle_after.as_secs_f64(),
            "Starting janitor"
        );

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + self.interval,
                self.interval,
            );
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep_once();
                    }
                    _ = stop_rx.changed() => {
                        break;
                    }
                }
            }

            info!(registry = self.registry.name(), "Janitor stopped");
        });

        JanitorHandle {
            registry,
            stop: stop_tx,
            task,
            stats,
        }
    }
}

/// Owner of a running janitor task.
pub struct JanitorHandle {
    registry: String,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<JanitorStats>,
}

impl JanitorHandle {
    /// Name of the registry being swept.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<JanitorStats> {
        &self.stats
    }

    /// Snapshot of the janitor's counters.
    pub fn report(&self) -> JanitorReport {
        self.stats.report(&self.registry)
    }

    /// Signal the task to stop and wait for it to finish.
    pub async fn shutdown(self) {
        // Err if the task already exited
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(registry = %self.registry, error = %e, "Janitor task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::identity::IdentityKey;
    use crate::ratelimit::policy::RateLimitPolicy;

    fn populated_registry() -> Arc<LimiterRegistry> {
        let registry = Arc::new(LimiterRegistry::with_shards("user", 2));
        let policy = RateLimitPolicy::per_minute(60, 10).unwrap();
        let now = Instant::now();
        for user_id in 0..6 {
            let bucket = registry.get_or_create(&IdentityKey::User(user_id), policy, now);
            if user_id >= 4 {
                // drain so these stay below capacity for the whole test
                while bucket.try_acquire(now).unwrap() {}
            }
        }
        registry
    }

    #[test]
    fn test_sweep_once_twice() {
        let registry = populated_registry();
        let janitor = Janitor::new(Arc::clone(&registry), Duration::from_secs(60), Duration::ZERO);

        assert_eq!(janitor.sweep_once(), 4);
        assert_eq!(janitor.sweep_once(), 0);
        assert_eq!(registry.len(), 2);
        assert_eq!(janitor.stats.sweeps(), 2);
        assert_eq!(janitor.stats.evicted(), 4);
        assert!(janitor.stats.last_sweep().is_some());
    }

    #[test]
    fn test_idle_threshold_protects_recent_buckets() {
        let registry = populated_registry();
        let janitor = Janitor::new(
            Arc::clone(&registry),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );

        assert_eq!(janitor.sweep_once(), 0);
        assert_eq!(registry.len(), 6);
    }

    #[tokio::test]
    async fn test_spawned_janitor_sweeps_and_stops() {
        let registry = populated_registry();
        let handle = Janitor::new(
            Arc::clone(&registry),
            Duration::from_millis(20),
            Duration::ZERO,
        )
        .spawn();

        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = handle.report();
        assert_eq!(report.registry, "user");
        assert!(report.sweeps >= 1);
        assert_eq!(report.evicted, 4);
        assert_eq!(registry.len(), 2);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_before_first_tick() {
        let registry = populated_registry();
        let handle = Janitor::new(
            Arc::clone(&registry),
            Duration::from_secs(3600),
            Duration::ZERO,
        )
        .spawn();

        let stats = Arc::clone(handle.stats());
        handle.shutdown().await;

        assert_eq!(stats.sweeps(), 0);
        assert_eq!(registry.len(), 6);
    }
}
