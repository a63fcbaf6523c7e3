//! Execution runtime abstraction.
//!
//! The container engine is a black box reached through [`Runtime`]. Two
//! backends exist: [`docker::DockerRuntime`] for real isolation and
//! [`local::LocalRuntime`], the simulated fallback used when the container
//! engine cannot be reached.

pub mod docker;
pub mod local;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::registry::ProjectKind;

pub use docker::DockerRuntime;
pub use local::LocalRuntime;

/// Collaborator-level failure.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The engine (daemon, CLI) is not reachable at all.
    #[error("runtime unreachable: {0}")]
    Unreachable(String),
    /// The environment the operation targeted no longer exists.
    #[error("environment gone: {0}")]
    NotFound(String),
    /// The engine answered but the operation failed.
    #[error("runtime command failed: {0}")]
    Command(String),
    #[error("runtime io: {0}")]
    Io(#[from] std::io::Error),
}

pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

/// Everything needed to bring up one environment.
#[derive(Debug, Clone)]
pub struct EnvironmentSpec {
    pub session_id: String,
    pub project_kind: ProjectKind,
    /// Hard lifetime after which the environment removes itself.
    pub self_destruct_after: std::time::Duration,
}

/// A command to run inside an environment and wait for.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub command: String,
    pub stdin: Option<Vec<u8>>,
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
}

/// One filesystem entry of a workspace, path relative to the writable root.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    pub content: Vec<u8>,
}

/// An environment as reported by the runtime itself.
#[derive(Debug, Clone)]
pub struct ManagedEnvironment {
    pub name: String,
    pub session_id: Option<String>,
    /// Creation time according to the runtime, not to this process.
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Backend name for logs.
    fn kind(&self) -> &'static str;

    /// Cheap reachability probe.
    async fn ping(&self) -> RuntimeResult<()>;

    /// Create an environment and return its runtime name.
    async fn create(&self, spec: &EnvironmentSpec) -> RuntimeResult<String>;

    /// Remove an environment and its storage. Absent environments are not an error.
    async fn remove(&self, name: &str) -> RuntimeResult<()>;

    async fn is_running(&self, name: &str) -> RuntimeResult<bool>;

    /// Run a command in the workspace directory and wait for it.
    async fn exec(&self, name: &str, request: &ExecRequest) -> RuntimeResult<ExecOutput>;

    /// Start a command whose output goes to `log_path` and hand back the child.
    async fn spawn_detached(
        &self,
        name: &str,
        command: &str,
        log_path: &str,
    ) -> RuntimeResult<tokio::process::Child>;

    /// Log file location for the `n`-th background command.
    fn log_path(&self, n: u64) -> String;

    async fn create_dir(&self, name: &str, path: &std::path::Path) -> RuntimeResult<()>;

    async fn write_file(
        &self,
        name: &str,
        path: &std::path::Path,
        content: &[u8],
    ) -> RuntimeResult<()>;

    /// Every entry under the workspace root, parents before children.
    async fn read_tree(&self, name: &str) -> RuntimeResult<Vec<TreeEntry>>;

    /// Host port reaching a service listening inside the environment, if any.
    async fn listening_port(&self, name: &str) -> RuntimeResult<Option<u16>>;

    /// Environments carrying this product's naming convention.
    async fn list_managed(&self) -> RuntimeResult<Vec<ManagedEnvironment>>;

    /// Storage volumes carrying this product's naming convention.
    async fn list_volumes(&self) -> RuntimeResult<Vec<String>>;

    async fn remove_volume(&self, volume: &str) -> RuntimeResult<()>;

    /// Environment name a storage volume belongs to.
    fn volume_owner(&self, volume: &str) -> Option<String>;
}
