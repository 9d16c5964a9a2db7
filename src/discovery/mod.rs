//! Service discovery registry
//!
//! Publishes the reachable endpoints of broker services so other platform
//! components can locate them. Registration must fail loudly; removal is
//! best-effort and never blocks a teardown already in progress.

pub mod etcd;
pub mod memory;

pub use etcd::{EtcdConfig, EtcdDiscovery};
pub use memory::MemoryDiscovery;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::ServiceSpec;

/// Errors that can occur while talking to the discovery registry
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Service '{0}' is already registered")]
    AlreadyExists(String),

    #[error("Service '{0}' is not registered")]
    NotRegistered(String),

    #[error("Registry request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid registry response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Publish `{name, id, endpoints}` for a newly created service
    async fn register_service(&self, service: &ServiceSpec) -> Result<(), DiscoveryError>;

    /// Retract a registration. Failures are logged, never returned.
    async fn remove_service(&self, service: &ServiceSpec);

    /// Refresh endpoints/metadata of an existing registration
    async fn update_service(&self, service: &ServiceSpec) -> Result<(), DiscoveryError>;
}
