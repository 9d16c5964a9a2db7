//! Cluster backends
//!
//! A cluster backend exposes network and service lifecycle primitives over one
//! physical substrate. Three variants implement the same [`ClusterBackend`]
//! contract:
//!
//! - [`KubernetesBackend`]: managed container orchestrator, driven through its
//!   HTTP API
//! - [`SwarmBackend`]: swarm-mode docker, driven through the docker CLI
//! - [`LocalBackend`]: local subprocesses, for development and single-node use
//!
//! One variant is selected at startup from configuration and held as
//! `Arc<dyn ClusterBackend>` for the lifetime of the process.

pub mod kubernetes;
pub mod local;
pub mod retry;
pub mod swarm;

pub use kubernetes::{KubernetesBackend, KubernetesConfig};
pub use local::{LocalBackend, LocalConfig};
pub use retry::{retry_on_conflict, DEFAULT_CONFLICT_RETRIES};
pub use swarm::{SwarmBackend, SwarmConfig};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::discovery::{DiscoveryError, ServiceDiscovery};
use crate::model::ServiceSpec;

/// Errors that can occur in a cluster backend
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Backend not available: {0}")]
    Unavailable(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Service '{0}' not found")]
    ServiceNotFound(String),

    #[error("Network '{0}' not found")]
    NetworkNotFound(String),

    #[error("Concurrent modification of '{0}'")]
    Conflict(String),

    /// A resource with the requested name already exists
    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("Gave up on '{resource}' after {attempts} conflicting attempts")]
    RetriesExhausted { resource: String, attempts: u32 },

    #[error("Backend request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("No free port after {0} probes")]
    PortsExhausted(u32),

    #[error("Failed to spawn process: {0}")]
    SpawnError(String),

    #[error("Backend call timed out after {0}s")]
    Timeout(u64),

    /// The service is running but could not be registered for discovery
    #[error("Service '{service_id}' created but discovery registration failed: {source}")]
    DiscoveryPartial {
        service_id: String,
        #[source]
        source: DiscoveryError,
    },

    /// The service was created but reading it back failed
    #[error("Service '{service_id}' created but could not be read back: {source}")]
    ReadBackFailed {
        service_id: String,
        #[source]
        source: Box<BackendError>,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl BackendError {
    /// Id of a service that exists even though its creation reported an error
    pub fn created_service_id(&self) -> Option<&str> {
        match self {
            Self::DiscoveryPartial { service_id, .. } | Self::ReadBackFailed { service_id, .. } => {
                Some(service_id)
            }
            _ => None,
        }
    }
}

#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Short name used in logs ("kubernetes", "swarm", "local")
    fn name(&self) -> &'static str;

    /// One-time setup. Failure is fatal to backend selection.
    async fn initialize(&self) -> Result<(), BackendError>;

    async fn create_network(&self, name: &str) -> Result<String, BackendError>;

    async fn remove_network(&self, name: &str) -> Result<(), BackendError>;

    /// Provision a broker deployment for a tenant and return its service id
    async fn create_service(
        &self,
        tenant_id: &str,
        network_id: &str,
        replicas: u32,
    ) -> Result<String, BackendError>;

    /// Tear down a service. An absent service is an error, never a corruption.
    async fn remove_service(&self, service_id: &str) -> Result<(), BackendError>;

    /// Rescale an existing service
    async fn update_service(&self, service_id: &str, replicas: u32) -> Result<(), BackendError>;

    async fn introspect_service(&self, service_id: &str) -> Result<ServiceSpec, BackendError>;

    /// Wire in the discovery registry used on create/remove
    fn set_service_discovery(&mut self, registry: Arc<dyn ServiceDiscovery>);

    /// Release process-local resources on control plane shutdown.
    ///
    /// Services on a remote substrate outlive the control plane, so the
    /// default does nothing.
    async fn shutdown(&self) {}
}

/// Optional discovery registry held by a backend
#[derive(Clone, Default)]
pub struct DiscoveryHook {
    registry: Option<Arc<dyn ServiceDiscovery>>,
}

impl DiscoveryHook {
    pub fn set(&mut self, registry: Arc<dyn ServiceDiscovery>) {
        self.registry = Some(registry);
    }

    pub fn is_wired(&self) -> bool {
        self.registry.is_some()
    }

    /// Register a created service, replacing an entry left by an earlier
    /// instance of the same name.
    ///
    /// A failure here means the deployment exists but is unreachable through
    /// discovery; it is reported as [`BackendError::DiscoveryPartial`] and the
    /// deployment is left in place.
    pub async fn register(&self, spec: &ServiceSpec) -> Result<(), BackendError> {
        let Some(registry) = &self.registry else {
            return Ok(());
        };
        let result = match registry.register_service(spec).await {
            Err(DiscoveryError::AlreadyExists(key)) => {
                debug!("Replacing stale discovery entry {}", key);
                registry.update_service(spec).await
            }
            other => other,
        };
        result.map_err(|source| BackendError::DiscoveryPartial {
                service_id: spec.service_id.clone(),
                source,
            })
    }

    pub async fn deregister(&self, spec: &ServiceSpec) {
        if let Some(registry) = &self.registry {
            registry.remove_service(spec).await;
        }
    }

    /// Refresh a registration after a rescale. Failures are only logged.
    pub async fn refresh(&self, spec: &ServiceSpec) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.update_service(spec).await {
                warn!(
                    "Failed to refresh discovery entry for {}: {}",
                    spec.service_name, e
                );
            }
        }
    }
}
