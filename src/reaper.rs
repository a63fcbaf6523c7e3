//! Out-of-process reaper.
//!
//! Runs from cron (or `reap --watch`) with no access to the service's
//! memory. Age comes from the runtime's own creation timestamps, so it keeps
//! working across service restarts. Every removal is independent and
//! idempotent; overlapping runs at worst repeat a removal that already
//! happened.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::lifetime::LifetimePolicy;
use crate::runtime::{ManagedEnvironment, Runtime, RuntimeResult};

/// What one reaper pass removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReapReport {
    pub scanned: usize,
    pub removed: Vec<String>,
    pub orphaned_volumes: Vec<String>,
    pub failures: usize,
}

pub struct Reaper {
    runtime: Arc<dyn Runtime>,
    policy: LifetimePolicy,
}

impl Reaper {
    pub fn new(runtime: Arc<dyn Runtime>, policy: LifetimePolicy) -> Self {
        Self { runtime, policy }
    }

    /// Past ceiling plus grace according to the runtime's clock.
    pub fn is_overdue(&self, environment: &ManagedEnvironment, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(environment.created_at);
        age.to_std().is_ok_and(|age| age > self.policy.hard_limit())
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> RuntimeResult<ReapReport> {
        let managed = self.runtime.list_managed().await?;
        let mut report = ReapReport {
            scanned: managed.len(),
            ..ReapReport::default()
        };
        let mut remaining: HashSet<String> = HashSet::new();

        for environment in managed {
            if !self.is_overdue(&environment, now) {
                remaining.insert(environment.name);
                continue;
            }
            let age_secs = now.signed_duration_since(environment.created_at).num_seconds();
            match self.runtime.remove(&environment.name).await {
                Ok(()) => {
                    info!(
                        at = %Utc::now().to_rfc3339(),
                        environment = %environment.name,
                        session_id = environment.session_id.as_deref().unwrap_or("-"),
                        created_at = %environment.created_at.to_rfc3339(),
                        age_secs,
                        "reaped environment past ceiling"
                    );
                    report.removed.push(environment.name);
                }
                Err(err) => {
                    warn!(at = %Utc::now().to_rfc3339(), environment = %environment.name, error = %err, "reap failed");
                    report.failures += 1;
                    remaining.insert(environment.name);
                }
            }
        }

        let volumes = match self.runtime.list_volumes().await {
            Ok(volumes) => volumes,
            Err(err) => {
                warn!(at = %Utc::now().to_rfc3339(), error = %err, "volume listing failed");
                report.failures += 1;
                return Ok(report);
            }
        };
        for volume in volumes {
            let owned = self
                .runtime
                .volume_owner(&volume)
                .is_some_and(|owner| remaining.contains(&owner));
            if owned {
                continue;
            }
            match self.runtime.remove_volume(&volume).await {
                Ok(()) => {
                    info!(at = %Utc::now().to_rfc3339(), volume = %volume, "removed orphaned volume");
                    report.orphaned_volumes.push(volume);
                }
                Err(err) => {
                    warn!(at = %Utc::now().to_rfc3339(), volume = %volume, error = %err, "orphaned volume removal failed");
                    report.failures += 1;
                }
            }
        }

        info!(
            at = %Utc::now().to_rfc3339(),
            scanned = report.scanned,
            removed = report.removed.len(),
            orphaned_volumes = report.orphaned_volumes.len(),
            failures = report.failures,
            "reaper pass finished"
        );
        Ok(report)
    }

    /// Repeat [`Reaper::run_once`] every `every` until cancelled.
    pub async fn watch(&self, every: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(err) = self.run_once(Utc::now()).await {
                error!(at = %Utc::now().to_rfc3339(), error = %err, "reaper pass aborted");
            }
        }
    }
}
