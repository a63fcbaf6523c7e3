//! Service configuration loaded from an optional TOML file.
//!
//! Every field has a default so an empty file (or no file at all) yields a
//! working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::lifetime::LifetimePolicy;

/// Configuration loading failure.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    pub server: ServerConfig,
    pub lifetime: LifetimeConfig,
    pub runtime: RuntimeConfig,
    pub limiter: LimiterConfig,
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

/// Ceiling, grace and sweep cadence. Shared by every lifetime layer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LifetimeConfig {
    pub ceiling_secs: u64,
    pub grace_secs: u64,
    pub sweep_interval_secs: u64,
    pub idle_after_secs: u64,
}

impl Default for LifetimeConfig {
    fn default() -> Self {
        Self {
            ceiling_secs: 30 * 60,
            grace_secs: 10 * 60,
            sweep_interval_secs: 5 * 60,
            idle_after_secs: 10 * 60,
        }
    }
}

impl LifetimeConfig {
    pub fn policy(&self) -> LifetimePolicy {
        LifetimePolicy {
            ceiling: Duration::from_secs(self.ceiling_secs),
            grace: Duration::from_secs(self.grace_secs),
            idle_after: Duration::from_secs(self.idle_after_secs),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Container runtime settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RuntimeConfig {
    pub docker_bin: String,
    pub image: String,
    pub node_image: String,
    pub python_image: String,
    /// Prefix for container and volume names; the reaper only touches these.
    pub prefix: String,
    pub label: String,
    pub workdir: String,
    pub candidate_ports: Vec<u16>,
    /// Host directory holding simulated environments.
    pub data_dir: PathBuf,
    pub port_poll_interval_ms: u64,
    pub port_poll_attempts: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".into(),
            image: "debian:bookworm-slim".into(),
            node_image: "node:20-bookworm".into(),
            python_image: "python:3.12-slim".into(),
            prefix: "preview".into(),
            label: "preview-sandbox".into(),
            workdir: "/workspace".into(),
            candidate_ports: vec![3000, 5173, 8000, 8080],
            data_dir: std::env::temp_dir().join("preview-sandbox"),
            port_poll_interval_ms: 1000,
            port_poll_attempts: 30,
        }
    }
}

impl RuntimeConfig {
    pub fn port_poll_interval(&self) -> Duration {
        Duration::from_millis(self.port_poll_interval_ms)
    }
}

/// Admission limiter for the exec entry point.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct LimiterConfig {
    pub max_requests: u32,
    pub window_secs: u64,
    pub purge_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_secs: 60,
            purge_interval_secs: 5 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ProxyConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_secs: u64,
    /// Largest request body forwarded upstream.
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 2000,
            request_timeout_secs: 60,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from `path`, or return defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
