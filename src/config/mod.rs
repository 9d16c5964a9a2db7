//! Control plane configuration
//!
//! A single YAML file selects the cluster backend and configures discovery,
//! the state store and the notification ingress. `${VAR}` references are
//! expanded from the environment before parsing, so credentials can come from
//! a `.env` file.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{
    BackendError, ClusterBackend, KubernetesBackend, KubernetesConfig, LocalBackend, LocalConfig,
    SwarmBackend, SwarmConfig,
};
use crate::discovery::{DiscoveryError, EtcdConfig, EtcdDiscovery, MemoryDiscovery, ServiceDiscovery};
use crate::hub::HubConfig;
use crate::model::is_valid_id;
use crate::store::{FileStore, MemoryStore, StateStore, StoreError};

/// Default config file location: ~/.iothub/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".iothub")
        .join("config.yaml")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to expand environment in config: {0}")]
    ExpandError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Backend setup failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Discovery setup failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("State store setup failed: {0}")]
    Store(#[from] StoreError),
}

/// Cluster backend variants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[serde(alias = "kubernetes")]
    #[value(alias = "kubernetes")]
    ManagedOrchestrator,
    Swarm,
    #[default]
    Local,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DiscoveryConfig {
    #[default]
    None,
    Memory,
    Etcd(EtcdConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    File {
        /// State file; defaults to ~/.iothub/state.json
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::File { path: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8282".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendKind,

    /// Platform network every broker joins
    #[serde(default = "default_network")]
    pub network: String,

    /// Upper bound on a single backend call
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout_secs: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes: Option<KubernetesConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swarm: Option<SwarmConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<LocalConfig>,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub ingress: IngressConfig,
}

fn default_network() -> String {
    "iothub".to_string()
}

fn default_backend_timeout() -> u64 {
    60
}

// ============================================================================
// SBIO: Pure parsing and validation (no I/O)
// ============================================================================

/// Expand `${VAR}` references from the process environment
pub fn expand_env(content: &str) -> Result<String, ConfigError> {
    shellexpand::env(content)
        .map(|s| s.into_owned())
        .map_err(|e| ConfigError::ExpandError(e.to_string()))
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let expanded = expand_env(content)?;
    serde_yaml::from_str(&expanded).map_err(|e| ConfigError::ParseError(e.to_string()))
}

impl Config {
    /// Check that the selected backend is configured and settings are usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.backend {
            BackendKind::ManagedOrchestrator if self.kubernetes.is_none() => {
                return Err(ConfigError::Invalid(
                    "backend 'managed-orchestrator' selected but no 'kubernetes' section"
                        .to_string(),
                ))
            }
            BackendKind::Swarm if self.swarm.is_none() => {
                return Err(ConfigError::Invalid(
                    "backend 'swarm' selected but no 'swarm' section".to_string(),
                ))
            }
            BackendKind::Local if self.local.is_none() => {
                return Err(ConfigError::Invalid(
                    "backend 'local' selected but no 'local' section".to_string(),
                ))
            }
            _ => {}
        }

        if !is_valid_id(&self.network) {
            return Err(ConfigError::Invalid(format!(
                "network name '{}' is not a valid resource name",
                self.network
            )));
        }
        if self.backend_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "backend_timeout_secs must be positive".to_string(),
            ));
        }
        if let Some(local) = &self.local {
            if local.command.trim().is_empty() {
                return Err(ConfigError::Invalid("local.command is empty".to_string()));
            }
            if local.port_range == 0 {
                return Err(ConfigError::Invalid("local.port_range must be positive".to_string()));
            }
        }
        if let Some(k8s) = &self.kubernetes {
            if k8s.image.trim().is_empty() {
                return Err(ConfigError::Invalid("kubernetes.image is empty".to_string()));
            }
        }
        if let Some(swarm) = &self.swarm {
            if swarm.image.trim().is_empty() {
                return Err(ConfigError::Invalid("swarm.image is empty".to_string()));
            }
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Apply command-line overrides
    pub fn with_overrides(mut self, backend: Option<BackendKind>, listen: Option<String>) -> Self {
        if let Some(backend) = backend {
            self.backend = backend;
        }
        if let Some(listen) = listen {
            self.ingress.listen = listen;
        }
        self
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.ingress.listen.parse().map_err(|_| {
            ConfigError::Invalid(format!("invalid ingress address '{}'", self.ingress.listen))
        })
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            network_name: self.network.clone(),
            backend_timeout: Duration::from_secs(self.backend_timeout_secs),
        }
    }

    pub fn state_path(&self) -> Option<PathBuf> {
        match &self.store {
            StoreConfig::Memory => None,
            StoreConfig::File { path: Some(path) } => {
                Some(PathBuf::from(shellexpand::tilde(path).as_ref()))
            }
            StoreConfig::File { path: None } => Some(crate::store::file::default_state_path()),
        }
    }

    // ========================================================================
    // Component construction
    // ========================================================================

    pub fn create_discovery(&self) -> Result<Option<Arc<dyn ServiceDiscovery>>, ConfigError> {
        let registry: Arc<dyn ServiceDiscovery> = match &self.discovery {
            DiscoveryConfig::None => return Ok(None),
            DiscoveryConfig::Memory => Arc::new(MemoryDiscovery::new()),
            DiscoveryConfig::Etcd(etcd) => Arc::new(EtcdDiscovery::new(etcd.clone())?),
        };
        Ok(Some(registry))
    }

    /// Build the selected backend with discovery wired in
    pub fn create_backend(
        &self,
        discovery: Option<Arc<dyn ServiceDiscovery>>,
    ) -> Result<Arc<dyn ClusterBackend>, ConfigError> {
        let mut backend: Box<dyn ClusterBackend> = match self.backend {
            BackendKind::ManagedOrchestrator => {
                let config = self.section(&self.kubernetes, "kubernetes")?;
                Box::new(KubernetesBackend::new(config)?)
            }
            BackendKind::Swarm => Box::new(SwarmBackend::new(self.section(&self.swarm, "swarm")?)),
            BackendKind::Local => Box::new(LocalBackend::new(self.section(&self.local, "local")?)),
        };

        if let Some(registry) = discovery {
            backend.set_service_discovery(registry);
        }
        Ok(Arc::from(backend))
    }

    pub async fn create_store(&self) -> Result<Arc<dyn StateStore>, ConfigError> {
        let store: Arc<dyn StateStore> = match self.state_path() {
            None => Arc::new(MemoryStore::new()),
            Some(path) => Arc::new(FileStore::open(path).await?),
        };
        Ok(store)
    }

    fn section<T: Clone>(&self, section: &Option<T>, name: &str) -> Result<T, ConfigError> {
        section
            .clone()
            .ok_or_else(|| ConfigError::Invalid(format!("missing '{}' section", name)))
    }
}

// ============================================================================
// I/O boundary functions
// ============================================================================

pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    Ok(config)
}
