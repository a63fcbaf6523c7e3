//! Environment provisioning and the session lifecycle.
//!
//! `provisioning → running → (idle) → expiring → destroyed`. Every state
//! change happens under the registry's per-session lock, so a destroy racing
//! an extend (or a second create) is serialized and can never resurrect a
//! purged record.

use std::sync::{Arc, Weak};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::lifetime::{LifetimePolicy, Timers};
use crate::registry::{
    short_id_of, EnvironmentId, ProjectKind, Registry, Session, SessionGuard, SessionStatus,
};
use crate::runtime::{EnvironmentSpec, Runtime, RuntimeError};
use crate::supervisor::Supervisor;

const MAX_SESSION_ID_LEN: usize = 64;
const MINT_ATTEMPTS: usize = 5;

/// Outcome of [`Provisioner::create`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Provisioned {
    pub session_id: String,
    pub short_id: String,
    pub environment_id: EnvironmentId,
    pub existing: bool,
    pub simulated: bool,
}

struct Inner {
    registry: Registry,
    runtime: Arc<dyn Runtime>,
    simulated: Arc<dyn Runtime>,
    policy: LifetimePolicy,
    timers: Timers,
    supervisor: Supervisor,
}

/// Creates and destroys environments. Cloning shares the same state.
#[derive(Clone)]
pub struct Provisioner {
    inner: Arc<Inner>,
}

/// Mint a fresh session id: base36 milliseconds plus a random suffix.
pub fn mint_session_id() -> String {
    let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", to_base36(millis), &random[..8])
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Client-supplied ids end up in container names and URLs.
pub fn validate_session_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > MAX_SESSION_ID_LEN {
        return Err(AppError::BadRequest(format!(
            "session id must be 1..={MAX_SESSION_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(AppError::BadRequest(
            "session id may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

impl Provisioner {
    pub fn new(
        registry: Registry,
        runtime: Arc<dyn Runtime>,
        simulated: Arc<dyn Runtime>,
        policy: LifetimePolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                runtime,
                simulated,
                policy,
                timers: Timers::new(),
                supervisor: Supervisor::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn policy(&self) -> &LifetimePolicy {
        &self.inner.policy
    }

    pub fn timers(&self) -> &Timers {
        &self.inner.timers
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    /// The real container runtime.
    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.inner.runtime
    }

    /// Backend serving a given environment.
    pub fn backend(&self, environment: &EnvironmentId) -> &Arc<dyn Runtime> {
        match environment {
            EnvironmentId::Real(_) => &self.inner.runtime,
            EnvironmentId::Simulated(_) => &self.inner.simulated,
        }
    }

    /// Live session for `id`, bumping its access time.
    pub async fn live_session(&self, id: &str) -> Result<Session> {
        match self.inner.registry.touch(id).await {
            Some(session) if session.status != SessionStatus::Expiring => Ok(session),
            _ => Err(AppError::NotFound(format!("session {id}"))),
        }
    }

    /// Turn a runtime failure on `id` into an error. An environment that is
    /// gone takes its session down with it.
    pub async fn runtime_failed(&self, id: &str, err: RuntimeError) -> AppError {
        if let RuntimeError::NotFound(reason) = &err {
            warn!(session_id = id, reason = %reason, "environment vanished, destroying session");
            self.destroy(id).await;
        }
        err.into()
    }

    /// Provision an environment for a session, or return the live one.
    pub async fn create(&self, requested: Option<&str>, kind: ProjectKind) -> Result<Provisioned> {
        let guard = self.claim(requested).await?;

        if let Some(existing) = guard.session() {
            if self.environment_alive(&existing).await {
                let session = self
                    .inner
                    .registry
                    .touch(guard.id())
                    .await
                    .unwrap_or(existing);
                debug!(session_id = %session.id, "create: environment already live");
                return Ok(Self::provisioned(&session, true));
            }
            warn!(session_id = %existing.id, environment = %existing.environment_id, "create: environment gone, reprovisioning");
            self.inner.timers.disarm(guard.id());
            self.inner.supervisor.terminate(guard.id()).await;
            let environment = &existing.environment_id;
            if let Err(err) = self.backend(environment).remove(environment.name()).await {
                warn!(session_id = %existing.id, environment = %environment, error = %err, "stale environment removal failed");
            }
            guard.take();
        }

        let spec = EnvironmentSpec {
            session_id: guard.id().to_string(),
            project_kind: kind,
            self_destruct_after: self.inner.policy.hard_limit(),
        };
        let environment_id = match self.provision_environment(&spec).await {
            Ok(environment_id) => environment_id,
            Err(err) => {
                self.inner.registry.discard_empty(guard).await;
                return Err(err);
            }
        };

        let mut session = Session::new(guard.id(), environment_id, kind);
        session.status = SessionStatus::Running;
        guard.set(session.clone());
        self.arm_deadline(&session);
        info!(
            session_id = %session.id,
            short_id = %session.short_id,
            environment = %session.environment_id,
            deadline = %session.deadline(&self.inner.policy),
            "session running"
        );
        Ok(Self::provisioned(&session, false))
    }

    /// Tear down a session's environment and purge it. Unknown ids are a no-op.
    pub async fn destroy(&self, id: &str) {
        match self.inner.registry.lock(id).await {
            Some(guard) => self.destroy_locked(guard).await,
            None => debug!(session_id = id, "destroy: unknown session"),
        }
    }

    /// Destroy every registered session. Used on shutdown since the registry
    /// does not survive the process.
    pub async fn destroy_all(&self) -> usize {
        let sessions = self.inner.registry.list().await;
        let count = sessions.len();
        futures_util::future::join_all(sessions.iter().map(|s| self.destroy(&s.id))).await;
        count
    }

    /// Grant the one-time grace extension. False for unknown sessions and
    /// for every call after the first.
    pub async fn extend_lifetime(&self, id: &str) -> bool {
        let Some(guard) = self.inner.registry.lock(id).await else {
            return false;
        };
        let extended = guard.update(|session| {
            if session.extended || session.status == SessionStatus::Expiring {
                return None;
            }
            session.extended = true;
            session.last_accessed_at = Utc::now();
            Some(session.clone())
        });
        match extended.flatten() {
            Some(session) => {
                self.arm_deadline(&session);
                info!(session_id = id, deadline = %session.deadline(&self.inner.policy), "session extended");
                true
            }
            None => false,
        }
    }

    /// Destroy `id` if it is past its deadline at `now`. Rechecked under the
    /// session lock so a concurrent extension wins.
    pub async fn expire(&self, id: &str, now: chrono::DateTime<Utc>) -> bool {
        let Some(guard) = self.inner.registry.lock(id).await else {
            return false;
        };
        match guard.session() {
            Some(session) if session.is_expired(&self.inner.policy, now) => {
                info!(session_id = id, "session reached its deadline");
                self.destroy_locked(guard).await;
                true
            }
            _ => false,
        }
    }

    async fn destroy_locked(&self, guard: SessionGuard) {
        let Some(session) = guard.update(|session| {
            session.status = SessionStatus::Expiring;
            session.clone()
        }) else {
            return;
        };
        let id = session.id.as_str();
        self.inner.timers.disarm(id);
        self.inner.supervisor.terminate(id).await;

        let environment = &session.environment_id;
        if let Err(err) = self.backend(environment).remove(environment.name()).await {
            // The reaper removes whatever is left behind.
            warn!(session_id = id, environment = %environment, error = %err, "environment removal failed");
        }
        guard.clear().await;
        info!(session_id = id, environment = %environment, "session destroyed");
    }

    async fn claim(&self, requested: Option<&str>) -> Result<SessionGuard> {
        let registry = &self.inner.registry;
        if let Some(id) = requested {
            validate_session_id(id)?;
            let guard = registry.lock_or_insert(id).await;
            if guard.session().is_some() {
                return Ok(guard);
            }
            if !registry.reserve_short_id(id).await {
                registry.discard_empty(guard).await;
                return Err(AppError::Conflict(format!(
                    "short id {} is taken by another live session",
                    short_id_of(id)
                )));
            }
            return Ok(guard);
        }

        for _ in 0..MINT_ATTEMPTS {
            let id = mint_session_id();
            let guard = registry.lock_or_insert(&id).await;
            if guard.session().is_none() && registry.reserve_short_id(&id).await {
                return Ok(guard);
            }
            registry.discard_empty(guard).await;
        }
        Err(AppError::Internal("could not mint a unique session id".into()))
    }

    async fn provision_environment(&self, spec: &EnvironmentSpec) -> Result<EnvironmentId> {
        let runtime = &self.inner.runtime;
        let reachable = match runtime.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!(session_id = %spec.session_id, runtime = runtime.kind(), error = %err, "runtime unreachable, falling back to simulation");
                false
            }
        };
        if reachable {
            match runtime.create(spec).await {
                Ok(name) => return Ok(EnvironmentId::Real(name)),
                Err(RuntimeError::Unreachable(reason)) => {
                    warn!(session_id = %spec.session_id, reason = %reason, "runtime dropped during create, falling back to simulation");
                }
                Err(err) => return Err(err.into()),
            }
        }
        let name = self.inner.simulated.create(spec).await?;
        Ok(EnvironmentId::Simulated(name))
    }

    async fn environment_alive(&self, session: &Session) -> bool {
        let environment = &session.environment_id;
        match self.backend(environment).is_running(environment.name()).await {
            Ok(alive) => alive,
            Err(err) => {
                // Do not tear down on a transient probe failure.
                warn!(session_id = %session.id, error = %err, "liveness probe failed");
                true
            }
        }
    }

    fn arm_deadline(&self, session: &Session) {
        let delay = (session.deadline(&self.inner.policy) - Utc::now())
            .to_std()
            .unwrap_or_default();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let id = session.id.clone();
        self.inner.timers.arm(&session.id, delay, async move {
            if let Some(inner) = weak.upgrade() {
                Provisioner { inner }.expire(&id, Utc::now()).await;
            }
        });
    }

    fn provisioned(session: &Session, existing: bool) -> Provisioned {
        Provisioned {
            session_id: session.id.clone(),
            short_id: session.short_id.clone(),
            environment_id: session.environment_id.clone(),
            existing,
            simulated: session.environment_id.is_simulated(),
        }
    }
}
