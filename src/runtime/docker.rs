//! Docker-backed runtime driven through the `docker` CLI.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    EntryKind, EnvironmentSpec, ExecOutput, ExecRequest, ManagedEnvironment, Runtime,
    RuntimeError, RuntimeResult, TreeEntry,
};
use crate::config::RuntimeConfig;
use crate::registry::ProjectKind;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// LISTEN state in `/proc/net/tcp`.
const TCP_LISTEN: &str = "0A";

pub struct DockerRuntime {
    config: RuntimeConfig,
}

impl DockerRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self { config }
    }

    pub fn container_name(&self, session_id: &str) -> String {
        format!("{}-{}", self.config.prefix, session_id)
    }

    fn volume_name(&self, container: &str) -> String {
        let session = container
            .strip_prefix(&format!("{}-", self.config.prefix))
            .unwrap_or(container);
        format!("{}-vol-{}", self.config.prefix, session)
    }

    fn session_label(&self) -> String {
        format!("{}.session", self.config.label)
    }

    fn image_for(&self, kind: ProjectKind) -> &str {
        match kind {
            ProjectKind::Node | ProjectKind::Static => &self.config.node_image,
            ProjectKind::Python => &self.config.python_image,
            ProjectKind::Other => &self.config.image,
        }
    }

    fn workdir(&self) -> &str {
        &self.config.workdir
    }

    async fn cli(&self, args: &[String]) -> RuntimeResult<Output> {
        debug!(args = ?args, "docker");
        let output = Command::new(&self.config.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| RuntimeError::Unreachable(format!("spawn {}: {e}", self.config.docker_bin)))?;
        check_daemon(&output)?;
        Ok(output)
    }

    async fn cli_ok(&self, args: &[String]) -> RuntimeResult<String> {
        let output = self.cli(args).await?;
        if !output.status.success() {
            return Err(RuntimeError::Command(format!(
                "docker {}: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run `sh -c <script> sh <args...>` in the workspace of `name`.
    async fn exec_script(
        &self,
        name: &str,
        script: &str,
        args: &[&str],
        stdin: Option<&[u8]>,
    ) -> RuntimeResult<ExecOutput> {
        let mut cmd = Command::new(&self.config.docker_bin);
        cmd.arg("exec");
        if stdin.is_some() {
            cmd.arg("-i");
        }
        cmd.args(["-w", self.workdir(), name, "sh", "-c", script, "sh"])
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| RuntimeError::Unreachable(format!("spawn {}: {e}", self.config.docker_bin)))?;

        let writer = match (stdin, child.stdin.take()) {
            (Some(bytes), Some(mut pipe)) => {
                let bytes = bytes.to_vec();
                Some(tokio::spawn(async move {
                    let result = pipe.write_all(&bytes).await;
                    drop(pipe);
                    result
                }))
            }
            _ => None,
        };

        let output = child.wait_with_output().await?;
        if let Some(writer) = writer {
            writer
                .await
                .map_err(|e| RuntimeError::Command(format!("stdin writer: {e}")))??;
        }
        check_daemon(&output)?;
        check_container(&output, name)?;

        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn exec_checked(&self, name: &str, script: &str, args: &[&str]) -> RuntimeResult<Vec<u8>> {
        let output = self.exec_script(name, script, args, None).await?;
        if !output.success() {
            return Err(RuntimeError::Command(format!(
                "exec in {name} exited {}: {}",
                output.exit_code,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn list_null_separated(&self, name: &str, script: &str) -> RuntimeResult<Vec<PathBuf>> {
        let stdout = self.exec_checked(name, script, &[]).await?;
        Ok(stdout
            .split(|b| *b == 0)
            .filter(|raw| !raw.is_empty())
            .map(|raw| {
                let path = String::from_utf8_lossy(raw);
                PathBuf::from(path.trim_start_matches("./"))
            })
            .collect())
    }
}

/// Map "cannot talk to the daemon" stderr into `Unreachable`.
fn check_daemon(output: &Output) -> RuntimeResult<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("Cannot connect to the Docker daemon")
        || stderr.contains("error during connect")
    {
        return Err(RuntimeError::Unreachable(stderr.trim().to_string()));
    }
    Ok(())
}

/// Map the engine refusing to exec into a vanished or stopped container
/// into `NotFound`, so it is never mistaken for the command's own failure.
fn check_container(output: &Output, name: &str) -> RuntimeResult<()> {
    if output.status.success() || !container_gone(&output.stderr) {
        return Ok(());
    }
    Err(RuntimeError::NotFound(format!(
        "{name}: {}",
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

fn container_gone(stderr: &[u8]) -> bool {
    let stderr = String::from_utf8_lossy(stderr);
    stderr.lines().any(|line| {
        line.starts_with("Error response from daemon:")
            && (line.contains("No such container") || line.contains("is not running"))
    })
}

fn is_missing(stderr: &[u8]) -> bool {
    let stderr = String::from_utf8_lossy(stderr);
    stderr.contains("No such container") || stderr.contains("No such volume")
}

/// Ports in LISTEN state from `/proc/net/tcp` and `/proc/net/tcp6` text.
pub fn parse_listening_ports(proc_net_tcp: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for line in proc_net_tcp.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[3] != TCP_LISTEN {
            continue;
        }
        let Some((_, port_hex)) = fields[1].rsplit_once(':') else {
            continue;
        };
        if let Ok(port) = u16::from_str_radix(port_hex, 16) {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
    }
    ports
}

/// Host port from `docker port` output such as `127.0.0.1:49153`.
pub fn parse_port_mapping(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

#[async_trait]
impl Runtime for DockerRuntime {
    fn kind(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> RuntimeResult<()> {
        let args = ["info".to_string(), "--format".into(), "{{.ServerVersion}}".into()];
        let output = tokio::time::timeout(PING_TIMEOUT, self.cli(&args))
            .await
            .map_err(|_| RuntimeError::Unreachable("docker info timed out".into()))??;
        if !output.status.success() {
            return Err(RuntimeError::Unreachable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn create(&self, spec: &EnvironmentSpec) -> RuntimeResult<String> {
        let name = self.container_name(&spec.session_id);
        let volume = self.volume_name(&name);
        let label = format!("{}=1", self.config.label);
        let session_label = format!("{}={}", self.session_label(), spec.session_id);

        self.cli_ok(&[
            "volume".into(),
            "create".into(),
            "--label".into(),
            label.clone(),
            "--label".into(),
            session_label.clone(),
            volume.clone(),
        ])
        .await?;

        // `--rm` plus a bounded PID 1 makes the engine remove the container
        // on its own once the ceiling has passed.
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--rm".into(),
            "--name".into(),
            name.clone(),
            "--label".into(),
            label,
            "--label".into(),
            session_label,
            "-v".into(),
            format!("{volume}:{}", self.workdir()),
            "-w".into(),
            self.workdir().to_string(),
        ];
        for port in &self.config.candidate_ports {
            args.extend(["-p".into(), format!("127.0.0.1::{port}")]);
        }
        args.push(self.image_for(spec.project_kind).to_string());
        args.extend([
            "sleep".into(),
            spec.self_destruct_after.as_secs().max(1).to_string(),
        ]);

        if let Err(err) = self.cli_ok(&args).await {
            let _ = self.remove_volume(&volume).await;
            return Err(err);
        }
        info!(container = %name, volume = %volume, "docker environment started");
        Ok(name)
    }

    async fn remove(&self, name: &str) -> RuntimeResult<()> {
        let output = self.cli(&["rm".into(), "-f".into(), name.to_string()]).await?;
        if !output.status.success() && !is_missing(&output.stderr) {
            return Err(RuntimeError::Command(format!(
                "docker rm {name}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        self.remove_volume(&self.volume_name(name)).await
    }

    async fn is_running(&self, name: &str) -> RuntimeResult<bool> {
        let output = self
            .cli(&[
                "inspect".into(),
                "--format".into(),
                "{{.State.Running}}".into(),
                name.to_string(),
            ])
            .await?;
        Ok(output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    async fn exec(&self, name: &str, request: &ExecRequest) -> RuntimeResult<ExecOutput> {
        self.exec_script(name, &request.command, &[], request.stdin.as_deref())
            .await
    }

    async fn spawn_detached(
        &self,
        name: &str,
        command: &str,
        log_path: &str,
    ) -> RuntimeResult<tokio::process::Child> {
        // The detached exec's stderr is discarded, so a vanished container
        // has to be caught before spawning.
        if !self.is_running(name).await? {
            return Err(RuntimeError::NotFound(format!("{name} is not running")));
        }
        Command::new(&self.config.docker_bin)
            .args(["exec", "-w", self.workdir(), name, "sh", "-c"])
            .arg(r#"eval "$1" > "$2" 2>&1"#)
            .args(["sh", command, log_path])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::Unreachable(format!("spawn {}: {e}", self.config.docker_bin)))
    }

    fn log_path(&self, n: u64) -> String {
        format!("/tmp/bg-{n}.log")
    }

    async fn create_dir(&self, name: &str, path: &Path) -> RuntimeResult<()> {
        let path = path.to_string_lossy();
        self.exec_checked(name, r#"mkdir -p -- "$1""#, &[&*path]).await?;
        Ok(())
    }

    async fn write_file(&self, name: &str, path: &Path, content: &[u8]) -> RuntimeResult<()> {
        let path = path.to_string_lossy();
        let output = self
            .exec_script(
                name,
                r#"mkdir -p -- "$(dirname -- "$1")" && cat > "$1""#,
                &[&*path],
                Some(content),
            )
            .await?;
        if !output.success() {
            return Err(RuntimeError::Command(format!(
                "write {path}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn read_tree(&self, name: &str) -> RuntimeResult<Vec<TreeEntry>> {
        let mut entries: Vec<TreeEntry> = self
            .list_null_separated(name, "find . -mindepth 1 -type d -print0")
            .await?
            .into_iter()
            .map(|path| TreeEntry {
                path,
                kind: EntryKind::Folder,
                content: Vec::new(),
            })
            .collect();

        for path in self
            .list_null_separated(name, "find . -type f -print0")
            .await?
        {
            let display = path.to_string_lossy().into_owned();
            let content = self
                .exec_checked(name, r#"cat -- "$1""#, &[display.as_str()])
                .await?;
            entries.push(TreeEntry {
                path,
                kind: EntryKind::File,
                content,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn listening_port(&self, name: &str) -> RuntimeResult<Option<u16>> {
        let output = self
            .exec_script(name, "cat /proc/net/tcp /proc/net/tcp6 2>/dev/null", &[], None)
            .await?;
        let listening = parse_listening_ports(&String::from_utf8_lossy(&output.stdout));
        let Some(port) = self
            .config
            .candidate_ports
            .iter()
            .copied()
            .find(|port| listening.contains(port))
        else {
            return Ok(None);
        };

        let mapping = self
            .cli_ok(&["port".into(), name.to_string(), format!("{port}/tcp")])
            .await?;
        Ok(parse_port_mapping(&mapping))
    }

    async fn list_managed(&self) -> RuntimeResult<Vec<ManagedEnvironment>> {
        let names = self
            .cli_ok(&[
                "ps".into(),
                "-a".into(),
                "--filter".into(),
                format!("label={}", self.config.label),
                "--format".into(),
                "{{.Names}}".into(),
            ])
            .await?;
        let names: Vec<String> = names
            .lines()
            .map(str::trim)
            .filter(|name| name.starts_with(&format!("{}-", self.config.prefix)))
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec![
            "inspect".into(),
            "--format".into(),
            format!(
                "{{{{.Name}}}}|{{{{.Created}}}}|{{{{index .Config.Labels \"{}\"}}}}",
                self.session_label()
            ),
        ];
        args.extend(names);
        // Containers removed between `ps` and `inspect` make inspect exit
        // nonzero while still printing the rest.
        let output = self.cli(&args).await?;
        let mut managed = Vec::new();
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let mut parts = line.splitn(3, '|');
            let (Some(name), Some(created), session) = (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let created_at = match DateTime::parse_from_rfc3339(created.trim()) {
                Ok(at) => at.with_timezone(&Utc),
                Err(err) => {
                    warn!(name, created, error = %err, "unparseable container creation time");
                    continue;
                }
            };
            managed.push(ManagedEnvironment {
                name: name.trim_start_matches('/').to_string(),
                session_id: session
                    .map(str::trim)
                    .filter(|s| !s.is_empty() && *s != "<no value>")
                    .map(str::to_string),
                created_at,
            });
        }
        Ok(managed)
    }

    async fn list_volumes(&self) -> RuntimeResult<Vec<String>> {
        let volumes = self
            .cli_ok(&[
                "volume".into(),
                "ls".into(),
                "--filter".into(),
                format!("label={}", self.config.label),
                "--format".into(),
                "{{.Name}}".into(),
            ])
            .await?;
        let prefix = format!("{}-vol-", self.config.prefix);
        Ok(volumes
            .lines()
            .map(str::trim)
            .filter(|v| v.starts_with(&prefix))
            .map(str::to_string)
            .collect())
    }

    async fn remove_volume(&self, volume: &str) -> RuntimeResult<()> {
        let output = self
            .cli(&["volume".into(), "rm".into(), "-f".into(), volume.to_string()])
            .await?;
        if !output.status.success() && !is_missing(&output.stderr) {
            return Err(RuntimeError::Command(format!(
                "docker volume rm {volume}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn volume_owner(&self, volume: &str) -> Option<String> {
        volume
            .strip_prefix(&format!("{}-vol-", self.config.prefix))
            .map(|session| self.container_name(session))
    }
}
