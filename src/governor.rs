//! C8 — Resource Governor ("QOMS"): CPU/RAM-aware admission control consulted
//! by the Embedding Broker (C4) and Indexing Pipeline (C6).
//!
//! Exposed as the `ResourceGate` trait per SPEC_FULL.md's design note: the
//! governor knows nothing about the broker or the pipeline, only about a
//! `canExecute(priority)` predicate and a wait-until-admissible primitive.
//! Sampling follows the reference daemon's polling-task idiom (the same shape
//! used for watcher/daemon health loops), backed by `sysinfo` since no example
//! in the corpus samples host resources directly.

use crate::models::Priority;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub ram_percent: f32,
}

#[async_trait]
pub trait ResourceGate: Send + Sync {
    fn can_execute(&self, priority: Priority) -> bool;

    /// Best-effort snapshot for `stats`/`/metrics`; stub gates may return the
    /// default (zeroed) sample.
    fn current_sample(&self) -> ResourceSample {
        ResourceSample::default()
    }

    /// Poll `can_execute` until admissible or `deadline` elapses. Returns
    /// `true` if the caller may proceed.
    async fn wait_until_admissible(&self, priority: Priority, deadline: Duration) -> bool {
        if self.can_execute(priority) {
            return true;
        }
        let start = tokio::time::Instant::now();
        let mut backoff = Duration::from_millis(50);
        loop {
            if start.elapsed() >= deadline {
                return self.can_execute(priority);
            }
            tokio::time::sleep(backoff.min(deadline.saturating_sub(start.elapsed()))).await;
            if self.can_execute(priority) {
                return true;
            }
            backoff = (backoff * 2).min(Duration::from_secs(1));
        }
    }
}

/// Thresholds per §4.8; defaults mirror the tier plan's env-config fallbacks
/// in `config::EnvConfig`.
#[derive(Debug, Clone, Copy)]
pub struct GovernorThresholds {
    pub cpu_max_percent: f32,
    pub ram_max_percent: f32,
    pub idle_cpu_max_percent: f32,
    pub idle_ram_max_percent: f32,
}

impl Default for GovernorThresholds {
    fn default() -> Self {
        Self {
            cpu_max_percent: 90.0,
            ram_max_percent: 80.0,
            idle_cpu_max_percent: 5.0,
            idle_ram_max_percent: 15.0,
        }
    }
}

pub struct ResourceGovernor {
    thresholds: GovernorThresholds,
    sample: Arc<RwLock<ResourceSample>>,
}

impl ResourceGovernor {
    /// Spawn a background sampling task on `interval` and return a handle
    /// implementing `ResourceGate`. The sampling task runs for the lifetime
    /// of the returned `Arc`'s strong references via a detached tokio task
    /// reading through a weak handle, mirroring the reference daemon's
    /// fire-and-forget polling tasks.
    pub fn spawn(thresholds: GovernorThresholds, interval: Duration) -> Arc<Self> {
        let governor = Arc::new(Self {
            thresholds,
            sample: Arc::new(RwLock::new(ResourceSample::default())),
        });

        let weak = Arc::downgrade(&governor);
        tokio::spawn(async move {
            let mut sys = System::new();
            loop {
                let Some(governor) = weak.upgrade() else {
                    break;
                };
                sys.refresh_cpu_usage();
                sys.refresh_memory();
                let cpu_percent = sys.global_cpu_usage();
                let ram_percent = if sys.total_memory() > 0 {
                    (sys.used_memory() as f32 / sys.total_memory() as f32) * 100.0
                } else {
                    0.0
                };
                *governor.sample.write().await = ResourceSample {
                    cpu_percent,
                    ram_percent,
                };
                drop(governor);
                tokio::time::sleep(interval).await;
            }
        });

        governor
    }

    pub async fn current_sample_async(&self) -> ResourceSample {
        *self.sample.read().await
    }

    fn can_execute_sync(&self, priority: Priority, sample: ResourceSample) -> bool {
        match priority {
            Priority::Critical => true,
            Priority::Idle => {
                sample.cpu_percent < self.thresholds.idle_cpu_max_percent
                    && sample.ram_percent < self.thresholds.idle_ram_max_percent
            }
            Priority::Low | Priority::Medium | Priority::High => {
                sample.cpu_percent <= self.thresholds.cpu_max_percent
                    && sample.ram_percent <= self.thresholds.ram_max_percent
            }
        }
    }
}

#[async_trait]
impl ResourceGate for ResourceGovernor {
    fn can_execute(&self, priority: Priority) -> bool {
        // Read-mostly, advisory: a `try_read` that misses (writer mid-sample)
        // falls back to "permit", since the governor's counters are read-mostly
        // and decisions are advisory per the concurrency model in SPEC_FULL.md.
        let sample = self
            .sample
            .try_read()
            .map(|s| *s)
            .unwrap_or_default();
        self.can_execute_sync(priority, sample)
    }

    fn current_sample(&self) -> ResourceSample {
        self.sample.try_read().map(|s| *s).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedGate(ResourceSample, GovernorThresholds);

    impl ResourceGate for FixedGate {
        fn can_execute(&self, priority: Priority) -> bool {
            match priority {
                Priority::Critical => true,
                Priority::Idle => {
                    self.0.cpu_percent < self.1.idle_cpu_max_percent
                        && self.0.ram_percent < self.1.idle_ram_max_percent
                }
                _ => {
                    self.0.cpu_percent <= self.1.cpu_max_percent
                        && self.0.ram_percent <= self.1.ram_max_percent
                }
            }
        }
    }

    #[tokio::test]
    async fn critical_always_admitted() {
        let gate = FixedGate(
            ResourceSample {
                cpu_percent: 99.0,
                ram_percent: 99.0,
            },
            GovernorThresholds::default(),
        );
        assert!(gate.can_execute(Priority::Critical));
        assert!(!gate.can_execute(Priority::Idle));
        assert!(!gate.can_execute(Priority::Low));
    }

    #[tokio::test]
    async fn idle_requires_near_zero_load() {
        let gate = FixedGate(
            ResourceSample {
                cpu_percent: 2.0,
                ram_percent: 10.0,
            },
            GovernorThresholds::default(),
        );
        assert!(gate.can_execute(Priority::Idle));
        assert!(gate.can_execute(Priority::Low));
    }
}
