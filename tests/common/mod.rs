//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use iothub::backend::{BackendError, ClusterBackend};
use iothub::discovery::ServiceDiscovery;
use iothub::hub::{HubConfig, HubService};
use iothub::model::{service_name_for, Product, ServiceRecord, ServiceSpec, Tenant};
use iothub::store::{MemoryStore, StateStore, StoreError};

/// Backend that keeps services in a map and counts every call.
///
/// With `unique_names` set it behaves like the real substrates: a tenant has
/// at most one service, and creating another adopts the existing one.
#[derive(Default)]
pub struct MockBackend {
    pub create_calls: AtomicUsize,
    pub remove_calls: AtomicUsize,
    pub update_calls: AtomicUsize,
    pub introspect_calls: AtomicUsize,
    pub network_calls: AtomicUsize,
    pub fail_create: AtomicBool,
    pub fail_remove: AtomicBool,
    pub hang_create: AtomicBool,
    /// Create the service, then report that it could not be read back
    pub partial_create: AtomicBool,
    pub fail_introspect: AtomicBool,
    pub unique_names: AtomicBool,
    next_id: AtomicUsize,
    services: Mutex<HashMap<String, (String, u32)>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn creates(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.remove_calls.load(Ordering::SeqCst)
    }

    /// Ids of the services running for a tenant
    pub fn services_of(&self, tenant_id: &str) -> Vec<String> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, (owner, _))| owner == tenant_id)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn live_services(&self) -> usize {
        self.services.lock().unwrap().len()
    }

    pub fn replicas_of(&self, service_id: &str) -> Option<u32> {
        self.services
            .lock()
            .unwrap()
            .get(service_id)
            .map(|(_, replicas)| *replicas)
    }

    /// Pretend a service survived from a previous run
    pub fn adopt(&self, service_id: &str, tenant_id: &str, replicas: u32) {
        self.services
            .lock()
            .unwrap()
            .insert(service_id.to_string(), (tenant_id.to_string(), replicas));
    }

    pub fn set(&self, flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<String, BackendError> {
        self.network_calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("net-{}", name))
    }

    async fn remove_network(&self, _name: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn create_service(
        &self,
        tenant_id: &str,
        _network_id: &str,
        replicas: u32,
    ) -> Result<String, BackendError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_create.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(BackendError::RequestFailed("injected create failure".to_string()));
        }
        if self.unique_names.load(Ordering::SeqCst) {
            if let Some(existing) = self.services_of(tenant_id).into_iter().next() {
                return Ok(existing);
            }
        }
        let id = format!("svc-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.adopt(&id, tenant_id, replicas);
        if self.partial_create.load(Ordering::SeqCst) {
            return Err(BackendError::ReadBackFailed {
                service_id: id,
                source: Box::new(BackendError::Unavailable("injected read-back failure".to_string())),
            });
        }
        Ok(id)
    }

    async fn remove_service(&self, service_id: &str) -> Result<(), BackendError> {
        self.remove_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(BackendError::RequestFailed("injected remove failure".to_string()));
        }
        self.services
            .lock()
            .unwrap()
            .remove(service_id)
            .map(|_| ())
            .ok_or_else(|| BackendError::ServiceNotFound(service_id.to_string()))
    }

    async fn update_service(&self, service_id: &str, replicas: u32) -> Result<(), BackendError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        match self.services.lock().unwrap().get_mut(service_id) {
            Some(entry) => {
                entry.1 = replicas;
                Ok(())
            }
            None => Err(BackendError::ServiceNotFound(service_id.to_string())),
        }
    }

    async fn introspect_service(&self, service_id: &str) -> Result<ServiceSpec, BackendError> {
        self.introspect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_introspect.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("injected introspect failure".to_string()));
        }
        let services = self.services.lock().unwrap();
        let (tenant_id, replicas) = services
            .get(service_id)
            .ok_or_else(|| BackendError::ServiceNotFound(service_id.to_string()))?;
        let mut spec = ServiceSpec::new(service_name_for(tenant_id), service_id);
        spec.replicas = *replicas;
        spec.ready_replicas = *replicas;
        Ok(spec)
    }

    fn set_service_discovery(&mut self, _registry: Arc<dyn ServiceDiscovery>) {}
}

/// Memory store whose product writes can be made to fail
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_create_product: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn get_all_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        self.inner.get_all_tenants().await
    }

    async fn create_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        self.inner.create_tenant(tenant).await
    }

    async fn remove_tenant(&self, tenant_id: &str) -> Result<(), StoreError> {
        self.inner.remove_tenant(tenant_id).await
    }

    async fn create_product(&self, tenant_id: &str, product: &Product) -> Result<(), StoreError> {
        if self.fail_create_product.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("injected write failure")));
        }
        self.inner.create_product(tenant_id, product).await
    }

    async fn remove_product(&self, tenant_id: &str, product_id: &str) -> Result<(), StoreError> {
        self.inner.remove_product(tenant_id, product_id).await
    }

    async fn update_service(
        &self,
        tenant_id: &str,
        record: &ServiceRecord,
    ) -> Result<(), StoreError> {
        self.inner.update_service(tenant_id, record).await
    }
}

pub fn hub_with(backend: Arc<MockBackend>, store: Arc<dyn StateStore>) -> Arc<HubService> {
    Arc::new(HubService::new(backend, store, HubConfig::default()))
}

/// Poll a tenant until `check` accepts it or two seconds pass
pub async fn wait_for_tenant<F>(hub: &HubService, tenant_id: &str, check: F) -> bool
where
    F: Fn(Option<&Tenant>) -> bool,
{
    for _ in 0..200 {
        if check(hub.tenant(tenant_id).await.as_ref()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll `check` until it returns true or two seconds pass
pub async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
