//! In-memory session registry.
//!
//! The map itself sits behind a short-lived `RwLock`; every entry carries its
//! own async mutex so operations on the same session serialize while
//! different sessions never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedMutexGuard, RwLock};

use crate::lifetime::LifetimePolicy;

/// Length of the public short id.
pub const SHORT_ID_LEN: usize = 8;

/// Handle into the execution runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum EnvironmentId {
    /// A container managed by the real runtime.
    Real(String),
    /// A host directory standing in for a container when the runtime is down.
    Simulated(String),
}

impl EnvironmentId {
    pub fn name(&self) -> &str {
        match self {
            Self::Real(name) | Self::Simulated(name) => name,
        }
    }

    pub fn is_simulated(&self) -> bool {
        matches!(self, Self::Simulated(_))
    }
}

impl std::fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real(name) => write!(f, "real:{name}"),
            Self::Simulated(name) => write!(f, "simulated:{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    #[default]
    Node,
    Python,
    Static,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Provisioning,
    Running,
    Idle,
    Expiring,
}

/// One client-visible session bound to a single environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub short_id: String,
    pub environment_id: EnvironmentId,
    pub project_kind: ProjectKind,
    pub exposed_port: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub extended: bool,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(id: &str, environment_id: EnvironmentId, project_kind: ProjectKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            short_id: short_id_of(id),
            environment_id,
            project_kind,
            exposed_port: None,
            created_at: now,
            last_accessed_at: now,
            extended: false,
            status: SessionStatus::Provisioning,
        }
    }

    /// Instant after which every lifetime layer tears the session down.
    pub fn deadline(&self, policy: &LifetimePolicy) -> DateTime<Utc> {
        let mut lifetime = policy.ceiling;
        if self.extended {
            lifetime += policy.grace;
        }
        self.created_at
            + chrono::Duration::from_std(lifetime).unwrap_or_else(|_| chrono::Duration::weeks(5200))
    }

    pub fn is_expired(&self, policy: &LifetimePolicy, now: DateTime<Utc>) -> bool {
        now >= self.deadline(policy)
    }

    fn touch(&mut self) {
        self.last_accessed_at = Utc::now();
        if self.status == SessionStatus::Idle {
            self.status = SessionStatus::Running;
        }
    }
}

/// Public short token for a session id: its lower-cased suffix.
pub fn short_id_of(id: &str) -> String {
    let start = id.len().saturating_sub(SHORT_ID_LEN);
    id.get(start..).unwrap_or(id).to_ascii_lowercase()
}

struct Entry {
    op: Arc<tokio::sync::Mutex<()>>,
    record: Mutex<Option<Session>>,
}

impl Entry {
    fn new() -> Self {
        Self {
            op: Arc::new(tokio::sync::Mutex::new(())),
            record: Mutex::new(None),
        }
    }

    fn snapshot(&self) -> Option<Session> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_record<R>(&self, f: impl FnOnce(&mut Option<Session>) -> R) -> R {
        let mut record = self.record.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut record)
    }
}

#[derive(Default)]
struct Tables {
    entries: HashMap<String, Arc<Entry>>,
    short_ids: HashMap<String, String>,
}

/// Concurrency-safe session store. Cloning shares the same underlying map.
#[derive(Clone, Default)]
pub struct Registry {
    tables: Arc<RwLock<Tables>>,
}

/// Exclusive, per-session access obtained through [`Registry::lock`].
///
/// While held, no other locked operation on the same id can run. Reads via
/// [`Registry::get`] still see the last committed snapshot.
pub struct SessionGuard {
    id: String,
    entry: Arc<Entry>,
    registry: Registry,
    _op: OwnedMutexGuard<()>,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn session(&self) -> Option<Session> {
        self.entry.snapshot()
    }

    /// Replace the stored record.
    pub fn set(&self, session: Session) {
        self.entry.with_record(|record| *record = Some(session));
    }

    /// Mutate the stored record in place; returns `None` when the slot is empty.
    pub fn update<R>(&self, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        self.entry.with_record(|record| record.as_mut().map(f))
    }

    /// Empty the slot but keep it (and the lock) for reuse.
    pub fn take(&self) -> Option<Session> {
        self.entry.with_record(Option::take)
    }

    /// Purge the record and its short-id reservation. Later lookups report unknown.
    pub async fn clear(self) -> Option<Session> {
        let removed = self.entry.with_record(Option::take);
        let mut tables = self.registry.tables.write().await;
        if let Some(current) = tables.entries.get(&self.id) {
            if Arc::ptr_eq(current, &self.entry) {
                tables.entries.remove(&self.id);
            }
        }
        let short = short_id_of(&self.id);
        if tables.short_ids.get(&short) == Some(&self.id) {
            tables.short_ids.remove(&short);
        }
        removed
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a session, or `None` if unknown.
    pub async fn get(&self, id: &str) -> Option<Session> {
        let entry = self.tables.read().await.entries.get(id).cloned()?;
        entry.snapshot()
    }

    /// Resolve a public short id to its session.
    pub async fn get_by_short_id(&self, short_id: &str) -> Option<Session> {
        let entry = {
            let tables = self.tables.read().await;
            let id = tables.short_ids.get(&short_id.to_ascii_lowercase())?;
            tables.entries.get(id).cloned()?
        };
        entry.snapshot()
    }

    /// Resolve either a canonical id or a short id, canonical first.
    pub async fn resolve(&self, key: &str) -> Option<Session> {
        match self.get(key).await {
            Some(session) => Some(session),
            None => self.get_by_short_id(key).await,
        }
    }

    pub async fn list(&self) -> Vec<Session> {
        let entries: Vec<Arc<Entry>> = self.tables.read().await.entries.values().cloned().collect();
        entries.iter().filter_map(|entry| entry.snapshot()).collect()
    }

    pub async fn len(&self) -> usize {
        self.list().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Insert or replace a session record.
    pub async fn upsert(&self, session: Session) {
        let guard = self.lock_or_insert(&session.id).await;
        self.reserve_short_id(&session.id).await;
        guard.set(session);
    }

    /// Remove a session, returning its last record.
    pub async fn remove(&self, id: &str) -> Option<Session> {
        self.lock(id).await?.clear().await
    }

    /// Bump `lastAccessedAt` without waiting on in-flight operations.
    pub async fn touch(&self, id: &str) -> Option<Session> {
        let entry = self.tables.read().await.entries.get(id).cloned()?;
        entry.with_record(|record| {
            let session = record.as_mut()?;
            session.touch();
            Some(session.clone())
        })
    }

    /// Flip a running session to idle when it has not been touched since `cutoff`.
    pub async fn mark_idle_before(&self, id: &str, cutoff: DateTime<Utc>) -> bool {
        let Some(entry) = self.tables.read().await.entries.get(id).cloned() else {
            return false;
        };
        entry.with_record(|record| match record.as_mut() {
            Some(session)
                if session.status == SessionStatus::Running
                    && session.last_accessed_at < cutoff =>
            {
                session.status = SessionStatus::Idle;
                true
            }
            _ => false,
        })
    }

    /// Record an observed listening port.
    pub async fn set_exposed_port(&self, id: &str, port: u16) -> bool {
        let Some(entry) = self.tables.read().await.entries.get(id).cloned() else {
            return false;
        };
        entry.with_record(|record| match record.as_mut() {
            Some(session) => {
                session.exposed_port = Some(port);
                true
            }
            None => false,
        })
    }

    /// Exclusive access to an existing session; `None` if it is unknown or
    /// was purged while waiting for the lock.
    pub async fn lock(&self, id: &str) -> Option<SessionGuard> {
        loop {
            let entry = self.tables.read().await.entries.get(id).cloned()?;
            let op = Arc::clone(&entry.op).lock_owned().await;
            if !self.is_current(id, &entry).await {
                continue;
            }
            entry.snapshot()?;
            return Some(SessionGuard {
                id: id.to_string(),
                entry,
                registry: self.clone(),
                _op: op,
            });
        }
    }

    /// Exclusive access to the slot for `id`, creating an empty one if needed.
    pub async fn lock_or_insert(&self, id: &str) -> SessionGuard {
        loop {
            let entry = {
                let mut tables = self.tables.write().await;
                Arc::clone(
                    tables
                        .entries
                        .entry(id.to_string())
                        .or_insert_with(|| Arc::new(Entry::new())),
                )
            };
            let op = Arc::clone(&entry.op).lock_owned().await;
            if self.is_current(id, &entry).await {
                return SessionGuard {
                    id: id.to_string(),
                    entry,
                    registry: self.clone(),
                    _op: op,
                };
            }
        }
    }

    /// Claim the short id derived from `id`. Returns false when a different
    /// live session already owns it.
    pub async fn reserve_short_id(&self, id: &str) -> bool {
        let short = short_id_of(id);
        let mut tables = self.tables.write().await;
        if let Some(owner) = tables.short_ids.get(&short) {
            if owner != id && Self::is_live(&tables, owner) {
                return false;
            }
        }
        tables.short_ids.insert(short, id.to_string());
        true
    }

    /// Release a reservation made by [`Registry::reserve_short_id`].
    pub async fn release_short_id(&self, id: &str) {
        let short = short_id_of(id);
        let mut tables = self.tables.write().await;
        if tables.short_ids.get(&short).map(String::as_str) == Some(id) {
            tables.short_ids.remove(&short);
        }
    }

    /// Drop an empty slot left behind by a failed creation.
    pub async fn discard_empty(&self, guard: SessionGuard) {
        if guard.session().is_none() {
            let _ = guard.clear().await;
        }
    }

    fn is_live(tables: &Tables, id: &str) -> bool {
        tables.entries.contains_key(id)
    }

    async fn is_current(&self, id: &str, entry: &Arc<Entry>) -> bool {
        self.tables
            .read()
            .await
            .entries
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }
}
