//! In-process lifetime enforcement: per-session deadline timers and the
//! periodic registry sweep.
//!
//! Both layers are best effort and die with the process. The out-of-process
//! reaper in [`crate::reaper`] and the runtime's own self-removal cover the
//! rest.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provisioner::Provisioner;
use crate::registry::{EnvironmentId, SessionStatus};

/// Ceiling and grace shared by every lifetime layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifetimePolicy {
    /// Base lifetime of every session.
    pub ceiling: Duration,
    /// One-time extension granted by `extend_lifetime`.
    pub grace: Duration,
    /// Untouched for this long marks a running session idle.
    pub idle_after: Duration,
}

impl LifetimePolicy {
    /// Absolute upper bound, extension included.
    pub fn hard_limit(&self) -> Duration {
        self.ceiling + self.grace
    }
}

impl Default for LifetimePolicy {
    fn default() -> Self {
        Self {
            ceiling: Duration::from_secs(30 * 60),
            grace: Duration::from_secs(10 * 60),
            idle_after: Duration::from_secs(10 * 60),
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(5200))
}

type Armed = HashMap<String, (u64, AbortHandle)>;

/// Per-session deadline callbacks. Re-arming replaces the previous callback.
#[derive(Clone, Default)]
pub struct Timers {
    armed: Arc<Mutex<Armed>>,
    generation: Arc<AtomicU64>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    fn armed(&self) -> std::sync::MutexGuard<'_, Armed> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `on_deadline` after `delay` unless disarmed or re-armed first.
    pub fn arm<F>(&self, id: &str, delay: Duration, on_deadline: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        // Held across the spawn so a zero delay cannot fire before registration.
        let mut registered = self.armed();
        let armed = Arc::clone(&self.armed);
        let key = id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Unregister before firing so the callback's own teardown cannot abort it.
            {
                let mut armed = armed.lock().unwrap_or_else(PoisonError::into_inner);
                if armed.get(&key).is_some_and(|(g, _)| *g == generation) {
                    armed.remove(&key);
                }
            }
            on_deadline.await;
        });

        let previous = registered.insert(id.to_string(), (generation, task.abort_handle()));
        drop(registered);
        if let Some((_, previous)) = previous {
            previous.abort();
        }
    }

    pub fn disarm(&self, id: &str) {
        if let Some((_, handle)) = self.armed().remove(id) {
            handle.abort();
        }
    }

    pub fn is_armed(&self, id: &str) -> bool {
        self.armed().contains_key(id)
    }
}

/// What one sweep pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<String>,
    pub vanished: Vec<String>,
    pub idled: usize,
}

/// One pass over the registry.
///
/// Destroys sessions past their deadline, purges real sessions whose
/// environment the runtime no longer knows about (removed by the reaper or
/// by self-removal), and marks untouched sessions idle.
pub async fn sweep_once(provisioner: &Provisioner, now: DateTime<Utc>) -> SweepReport {
    let policy = *provisioner.policy();
    let registry = provisioner.registry();
    let mut report = SweepReport::default();

    let listed_at = Utc::now();
    let live: Option<HashSet<String>> = match provisioner.runtime().list_managed().await {
        Ok(managed) => Some(managed.into_iter().map(|env| env.name).collect()),
        Err(err) => {
            debug!(error = %err, "sweep: runtime listing unavailable, skipping reconciliation");
            None
        }
    };

    let idle_cutoff = now - to_chrono(policy.idle_after);
    for session in registry.list().await {
        if session.status == SessionStatus::Expiring {
            continue;
        }
        if session.is_expired(&policy, now) {
            info!(session_id = %session.id, deadline = %session.deadline(&policy), "sweep: session past deadline");
            if provisioner.expire(&session.id, now).await {
                report.expired.push(session.id);
            }
            continue;
        }
        if let (Some(live), EnvironmentId::Real(name)) = (&live, &session.environment_id) {
            if session.created_at < listed_at && !live.contains(name) {
                warn!(session_id = %session.id, environment = %name, "sweep: environment vanished, purging session");
                provisioner.destroy(&session.id).await;
                report.vanished.push(session.id);
                continue;
            }
        }
        if registry.mark_idle_before(&session.id, idle_cutoff).await {
            report.idled += 1;
        }
    }
    report
}

/// Run [`sweep_once`] every `every` until `cancel` fires.
pub fn spawn_sweeper(
    provisioner: Provisioner,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            // A panicking pass must not stop the loop.
            let pass = tokio::spawn({
                let provisioner = provisioner.clone();
                async move { sweep_once(&provisioner, Utc::now()).await }
            });
            match pass.await {
                Ok(report) => {
                    if !report.expired.is_empty() || !report.vanished.is_empty() {
                        info!(
                            expired = report.expired.len(),
                            vanished = report.vanished.len(),
                            idled = report.idled,
                            "sweep finished"
                        );
                    }
                }
                Err(err) => warn!(error = %err, "sweep pass failed"),
            }
        }
        debug!("sweeper stopped");
    })
}
