//! Command execution inside a session's environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::provisioner::Provisioner;
use crate::registry::{Session, SessionStatus};
use crate::runtime::ExecRequest;

/// Result of a command. A nonzero `exit_code` is a normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    pub background: bool,
}

/// How the gateway looks for a server after a background start.
#[derive(Debug, Clone, Copy)]
pub struct PortWatch {
    pub interval: Duration,
    pub attempts: u32,
}

impl Default for PortWatch {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            attempts: 30,
        }
    }
}

#[derive(Clone)]
pub struct Gateway {
    provisioner: Provisioner,
    port_watch: PortWatch,
}

impl Gateway {
    pub fn new(provisioner: Provisioner, port_watch: PortWatch) -> Self {
        Self {
            provisioner,
            port_watch,
        }
    }

    /// Run `command` in the session's environment.
    ///
    /// Fails only when the session has no live environment or the runtime
    /// itself breaks; a command that runs and fails comes back as `Ok`.
    pub async fn exec(&self, session_id: &str, command: &str, options: ExecOptions) -> Result<ExecResult> {
        if command.trim().is_empty() {
            return Err(AppError::BadRequest("command must not be empty".into()));
        }
        let session = self.provisioner.live_session(session_id).await?;
        let environment = &session.environment_id;
        let backend = self.provisioner.backend(environment);

        if options.background {
            return self.start_background(&session, command).await;
        }

        let request = ExecRequest {
            command: command.to_string(),
            stdin: None,
        };
        let output = match backend.exec(environment.name(), &request).await {
            Ok(output) => output,
            Err(err) => return Err(self.provisioner.runtime_failed(session_id, err).await),
        };
        debug!(session_id, command, exit_code = output.exit_code, "command finished");
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.exit_code,
        })
    }

    /// Spawn and adopt under the session lock so a concurrent destroy either
    /// runs first and wins, or waits and terminates the new child.
    async fn start_background(&self, session: &Session, command: &str) -> Result<ExecResult> {
        let session_id = session.id.as_str();
        let environment = &session.environment_id;
        let backend = self.provisioner.backend(environment);
        let supervisor = self.provisioner.supervisor();

        let Some(guard) = self.provisioner.registry().lock(session_id).await else {
            return Err(AppError::NotFound(format!("session {session_id}")));
        };
        if guard
            .session()
            .map_or(true, |s| s.status == SessionStatus::Expiring)
        {
            return Err(AppError::NotFound(format!("session {session_id}")));
        }

        let log_path = backend.log_path(supervisor.next_index());
        let child = match backend
            .spawn_detached(environment.name(), command, &log_path)
            .await
        {
            Ok(child) => child,
            Err(err) => {
                drop(guard);
                return Err(self.provisioner.runtime_failed(session_id, err).await);
            }
        };
        supervisor.adopt(session_id, command, &log_path, child);
        drop(guard);

        info!(session_id, command, log = %log_path, "background command started");
        if session.exposed_port.is_none() {
            self.watch_for_port(session_id);
        }
        Ok(ExecResult {
            stdout: format!("started in background (log: {log_path})"),
            stderr: String::new(),
            exit_code: 0,
        })
    }

    /// Poll for a listening port and record the first one seen.
    fn watch_for_port(&self, session_id: &str) {
        let provisioner = self.provisioner.clone();
        let watch = self.port_watch;
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            for _ in 0..watch.attempts {
                tokio::time::sleep(watch.interval).await;
                match probe_port(&provisioner, &session_id).await {
                    Ok(Some(port)) => {
                        info!(session_id = %session_id, port, "listening port detected");
                        return;
                    }
                    Ok(None) => {}
                    Err(AppError::NotFound(_)) => return,
                    Err(err) => warn!(session_id = %session_id, error = %err, "port probe failed"),
                }
            }
            debug!(session_id = %session_id, "no listening port detected");
        });
    }
}

/// Ask the runtime for a listening port once and record it on the session.
pub async fn probe_port(provisioner: &Provisioner, session_id: &str) -> Result<Option<u16>> {
    let session = provisioner
        .registry()
        .get(session_id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?;
    if let Some(port) = session.exposed_port {
        return Ok(Some(port));
    }
    let environment = &session.environment_id;
    let port = match provisioner
        .backend(environment)
        .listening_port(environment.name())
        .await
    {
        Ok(port) => port,
        Err(err) => return Err(provisioner.runtime_failed(session_id, err).await),
    };
    if let Some(port) = port {
        provisioner.registry().set_exposed_port(session_id, port).await;
    }
    Ok(port)
}
