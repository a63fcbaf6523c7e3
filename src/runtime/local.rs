//! Simulated runtime: plain host directories, commands run through the host shell.
//!
//! Used when the container engine is unreachable so sessions keep working
//! without isolation.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use super::{
    EntryKind, EnvironmentSpec, ExecOutput, ExecRequest, ManagedEnvironment, Runtime,
    RuntimeError, RuntimeResult, TreeEntry,
};

/// Prefix of background log files kept next to the workspace files.
const LOG_PREFIX: &str = ".bg-";

pub struct LocalRuntime {
    root: PathBuf,
}

impl LocalRuntime {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn environment_name(session_id: &str) -> String {
        format!("sim-{session_id}")
    }

    /// Host directory backing an environment.
    pub fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Directory of an environment that must still exist.
    async fn live_dir(&self, name: &str) -> RuntimeResult<PathBuf> {
        let dir = self.dir(name);
        if !fs::try_exists(&dir).await? {
            return Err(RuntimeError::NotFound(format!("{} is gone", dir.display())));
        }
        Ok(dir)
    }

    async fn resolve(&self, name: &str, path: &Path) -> RuntimeResult<PathBuf> {
        let mut resolved = self.live_dir(name).await?;
        for component in path.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(RuntimeError::Command(format!(
                        "path escapes workspace: {}",
                        path.display()
                    )))
                }
            }
        }
        Ok(resolved)
    }

    fn is_log_file(path: &Path) -> bool {
        path.components().count() == 1
            && path
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_PREFIX) && name.ends_with(".log"))
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    fn kind(&self) -> &'static str {
        "simulated"
    }

    async fn ping(&self) -> RuntimeResult<()> {
        Ok(())
    }

    async fn create(&self, spec: &EnvironmentSpec) -> RuntimeResult<String> {
        let name = Self::environment_name(&spec.session_id);
        let dir = self.dir(&name);
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        fs::create_dir_all(&dir).await?;
        info!(dir = %dir.display(), "simulated environment created");
        Ok(name)
    }

    async fn remove(&self, name: &str) -> RuntimeResult<()> {
        match fs::remove_dir_all(self.dir(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn is_running(&self, name: &str) -> RuntimeResult<bool> {
        Ok(fs::try_exists(self.dir(name)).await?)
    }

    async fn exec(&self, name: &str, request: &ExecRequest) -> RuntimeResult<ExecOutput> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&request.command)
            .current_dir(self.live_dir(name).await?)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(bytes), Some(mut pipe)) = (request.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                let _ = pipe.write_all(&bytes).await;
            });
        }

        let output = child.wait_with_output().await?;
        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn spawn_detached(
        &self,
        name: &str,
        command: &str,
        log_path: &str,
    ) -> RuntimeResult<tokio::process::Child> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(r#"eval "$1" > "$2" 2>&1"#)
            .args(["sh", command, log_path])
            .current_dir(self.live_dir(name).await?)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        // Own process group so the supervisor can signal the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);
        Ok(cmd.spawn()?)
    }

    fn log_path(&self, n: u64) -> String {
        format!("{LOG_PREFIX}{n}.log")
    }

    async fn create_dir(&self, name: &str, path: &Path) -> RuntimeResult<()> {
        fs::create_dir_all(self.resolve(name, path).await?).await?;
        Ok(())
    }

    async fn write_file(&self, name: &str, path: &Path, content: &[u8]) -> RuntimeResult<()> {
        let full_path = self.resolve(name, path).await?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full_path, content).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&full_path, std::fs::Permissions::from_mode(0o644)).await?;
        }
        Ok(())
    }

    async fn read_tree(&self, name: &str) -> RuntimeResult<Vec<TreeEntry>> {
        let root = self.live_dir(name).await?;
        let mut entries = Vec::new();
        let mut pending = vec![PathBuf::new()];
        while let Some(relative) = pending.pop() {
            let mut dir = fs::read_dir(root.join(&relative)).await?;
            while let Some(item) = dir.next_entry().await? {
                let path = relative.join(item.file_name());
                let file_type = item.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path.clone());
                    entries.push(TreeEntry {
                        path,
                        kind: EntryKind::Folder,
                        content: Vec::new(),
                    });
                } else if file_type.is_file() && !Self::is_log_file(&path) {
                    let content = fs::read(item.path()).await?;
                    entries.push(TreeEntry {
                        path,
                        kind: EntryKind::File,
                        content,
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn listening_port(&self, _name: &str) -> RuntimeResult<Option<u16>> {
        Ok(None)
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ManagedEnvironment>> {
        Ok(Vec::new())
    }

    async fn list_volumes(&self) -> RuntimeResult<Vec<String>> {
        Ok(Vec::new())
    }

    async fn remove_volume(&self, _volume: &str) -> RuntimeResult<()> {
        Ok(())
    }

    fn volume_owner(&self, _volume: &str) -> Option<String> {
        None
    }
}
