//! Shared application state.

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::gateway::{Gateway, PortWatch};
use crate::limiter::AdmissionLimiter;
use crate::provisioner::Provisioner;
use crate::proxy::IngressProxy;
use crate::registry::Registry;
use crate::runtime::{DockerRuntime, LocalRuntime, Runtime};

/// Everything a request handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub provisioner: Provisioner,
    pub gateway: Gateway,
    pub proxy: IngressProxy,
    pub limiter: AdmissionLimiter,
}

impl AppState {
    /// Wire components around explicit runtimes and a fresh registry.
    pub fn new(config: Config, runtime: Arc<dyn Runtime>, simulated: Arc<dyn Runtime>) -> Result<Self> {
        let provisioner = Provisioner::new(
            Registry::new(),
            runtime,
            simulated,
            config.lifetime.policy(),
        );
        let gateway = Gateway::new(
            provisioner.clone(),
            PortWatch {
                interval: config.runtime.port_poll_interval(),
                attempts: config.runtime.port_poll_attempts,
            },
        );
        let proxy = IngressProxy::new(provisioner.clone(), &config.proxy)?;
        let limiter = AdmissionLimiter::from_config(&config.limiter);
        Ok(Self {
            config: Arc::new(config),
            provisioner,
            gateway,
            proxy,
            limiter,
        })
    }

    /// Docker as the real runtime, host directories as the simulated one.
    pub fn from_config(config: Config) -> Result<Self> {
        let runtime: Arc<dyn Runtime> = Arc::new(DockerRuntime::new(config.runtime.clone()));
        let simulated: Arc<dyn Runtime> =
            Arc::new(LocalRuntime::new(config.runtime.data_dir.join("simulated")));
        Self::new(config, runtime, simulated)
    }

    pub fn registry(&self) -> &Registry {
        self.provisioner.registry()
    }
}
