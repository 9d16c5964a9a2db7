//! In-process discovery registry for local operation and tests

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::{DiscoveryError, ServiceDiscovery};
use crate::model::ServiceSpec;

/// Registry keyed by service name
#[derive(Default)]
pub struct MemoryDiscovery {
    services: DashMap<String, ServiceSpec>,
}

impl MemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, service_name: &str) -> Option<ServiceSpec> {
        self.services.get(service_name).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

#[async_trait]
impl ServiceDiscovery for MemoryDiscovery {
    async fn register_service(&self, service: &ServiceSpec) -> Result<(), DiscoveryError> {
        use dashmap::mapref::entry::Entry;

        match self.services.entry(service.service_name.clone()) {
            Entry::Occupied(_) => Err(DiscoveryError::AlreadyExists(
                service.service_name.clone(),
            )),
            Entry::Vacant(slot) => {
                debug!(
                    "Registered {} with {} endpoint(s)",
                    service.service_name,
                    service.endpoints.len()
                );
                slot.insert(service.clone());
                Ok(())
            }
        }
    }

    async fn remove_service(&self, service: &ServiceSpec) {
        if self.services.remove(&service.service_name).is_none() {
            debug!("Service {} was not registered", service.service_name);
        }
    }

    async fn update_service(&self, service: &ServiceSpec) -> Result<(), DiscoveryError> {
        let mut entry = self
            .services
            .get_mut(&service.service_name)
            .ok_or_else(|| DiscoveryError::NotRegistered(service.service_name.clone()))?;
        *entry = service.clone();
        Ok(())
    }
}
