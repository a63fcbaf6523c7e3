//! Background process supervision.
//!
//! Detached commands are owned here, keyed by session, so their lifetime
//! ends with the environment they run in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::process::Child;
use tracing::{debug, info, warn};

const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// A background command still owned by its session.
#[derive(Debug)]
pub struct Supervised {
    pub command: String,
    pub log_path: String,
    pub started_at: DateTime<Utc>,
    child: Child,
}

type Children = HashMap<String, Vec<Supervised>>;

#[derive(Clone, Default)]
pub struct Supervisor {
    children: Arc<Mutex<Children>>,
    started: Arc<AtomicU64>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn children(&self) -> std::sync::MutexGuard<'_, Children> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Monotonic counter used to name log files.
    pub fn next_index(&self) -> u64 {
        self.started.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Take ownership of a freshly spawned child, dropping finished siblings.
    pub fn adopt(&self, session_id: &str, command: &str, log_path: &str, child: Child) {
        let mut children = self.children();
        let owned = children.entry(session_id.to_string()).or_default();
        owned.retain_mut(|supervised| matches!(supervised.child.try_wait(), Ok(None)));
        owned.push(Supervised {
            command: command.to_string(),
            log_path: log_path.to_string(),
            started_at: Utc::now(),
            child,
        });
        debug!(session_id, running = owned.len(), "background process adopted");
    }

    /// Number of still-running children of a session.
    pub fn running(&self, session_id: &str) -> usize {
        let mut children = self.children();
        children.get_mut(session_id).map_or(0, |owned| {
            owned.retain_mut(|supervised| matches!(supervised.child.try_wait(), Ok(None)));
            owned.len()
        })
    }

    /// Stop every child of a session: SIGTERM, short grace, then kill.
    pub async fn terminate(&self, session_id: &str) -> usize {
        let owned = self.children().remove(session_id).unwrap_or_default();
        let count = owned.len();
        for mut supervised in owned {
            signal_terminate(&supervised.child);
            match tokio::time::timeout(TERMINATE_GRACE, supervised.child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(session_id, command = %supervised.command, "background process ignored SIGTERM, killing");
                    if let Err(err) = supervised.child.kill().await {
                        warn!(session_id, error = %err, "kill failed");
                    }
                }
            }
        }
        if count > 0 {
            info!(session_id, count, "background processes terminated");
        }
        count
    }
}

#[cfg(unix)]
fn signal_terminate(child: &Child) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    let pid = Pid::from_raw(pid);
    // Children spawned in their own process group take the whole tree down.
    if killpg(pid, Signal::SIGTERM).is_err() {
        let _ = kill(pid, Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn signal_terminate(_child: &Child) {}
