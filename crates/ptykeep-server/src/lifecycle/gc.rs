//! Time-based garbage collection of session records.
//!
//! A sweep runs four passes in a fixed order, each one bulk conditional
//! update in the store. Every pass re-reads state, so a session may move
//! through more than one transition in a single sweep.

use super::manager::LifecycleManager;
use super::store::BulkTransition;
use chrono::Duration;
use ptykeep_core::KeepResult;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sweep cadence and TTLs. A zero (or negative) TTL disables its pass.
#[derive(Debug, Clone)]
pub struct GcPolicy {
    pub interval: Duration,
    pub running_idle_timeout: Duration,
    pub detached_ttl: Duration,
    pub max_lifetime: Duration,
    pub terminated_retention: Duration,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::minutes(1),
            running_idle_timeout: Duration::hours(2),
            detached_ttl: Duration::hours(24),
            max_lifetime: Duration::days(7),
            terminated_retention: Duration::hours(48),
        }
    }
}

/// Sessions moved by one sweep, per pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub detached_idle: usize,
    pub terminated_detached: usize,
    pub terminated_lifetime: usize,
    pub archived: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.detached_idle + self.terminated_detached + self.terminated_lifetime + self.archived
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

fn enabled(ttl: Duration) -> bool {
    ttl > Duration::zero()
}

impl LifecycleManager {
    /// Run one GC sweep.
    pub fn cleanup(&self) -> KeepResult<CleanupReport> {
        let policy = &self.config().gc;
        let now = self.now();
        let mut report = CleanupReport::default();

        if enabled(policy.running_idle_timeout) {
            let cutoff = now - policy.running_idle_timeout;
            report.detached_idle = self
                .store()
                .bulk_transition(&BulkTransition::DetachIdle { cutoff }, now)?
                .len();
        }

        let mut terminated = Vec::new();
        if enabled(policy.detached_ttl) {
            let cutoff = now - policy.detached_ttl;
            let ids = self
                .store()
                .bulk_transition(&BulkTransition::TerminateDetached { cutoff }, now)?;
            report.terminated_detached = ids.len();
            terminated.extend(ids);
        }
        if enabled(policy.max_lifetime) {
            let cutoff = now - policy.max_lifetime;
            let ids = self
                .store()
                .bulk_transition(&BulkTransition::TerminateOverLifetime { cutoff }, now)?;
            report.terminated_lifetime = ids.len();
            terminated.extend(ids);
        }
        self.otps.clear_many(&terminated);
        self.otps.prune(now);

        if enabled(policy.terminated_retention) {
            let cutoff = now - policy.terminated_retention;
            report.archived = self
                .store()
                .bulk_transition(&BulkTransition::ArchiveTerminated { cutoff }, now)?
                .len();
        }

        debug!(?report, "gc sweep finished");
        Ok(report)
    }

    /// Run [`cleanup`](Self::cleanup) every `gc.interval` until `shutdown`
    /// fires. Sweeps run on the blocking pool; only non-empty ones are logged.
    pub fn spawn_gc(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let period = self
            .config()
            .gc
            .interval
            .to_std()
            .ok()
            .filter(|d| !d.is_zero())
            .unwrap_or(std::time::Duration::from_secs(60));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown.recv() => {
                        debug!("gc loop stopping");
                        break;
                    }
                }

                let manager = self.clone();
                match tokio::task::spawn_blocking(move || manager.cleanup()).await {
                    Ok(Ok(report)) if !report.is_empty() => info!(
                        detached_idle = report.detached_idle,
                        terminated_detached = report.terminated_detached,
                        terminated_lifetime = report.terminated_lifetime,
                        archived = report.archived,
                        "session gc"
                    ),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "session gc failed"),
                    Err(e) => warn!(error = %e, "session gc task panicked"),
                }
            }
        })
    }
}
