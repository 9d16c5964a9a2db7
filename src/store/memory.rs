//! In-memory state store, for tests and throwaway deployments

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    delete_product, delete_tenant, insert_product, insert_tenant, set_service, StateStore,
    StoreError, TenantTable,
};
use crate::model::{Product, ServiceRecord, Tenant};

#[derive(Default)]
pub struct MemoryStore {
    table: RwLock<TenantTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store, e.g. to simulate state left by a previous run
    pub fn with_tenants(tenants: impl IntoIterator<Item = Tenant>) -> Self {
        let table = tenants
            .into_iter()
            .map(|t| (t.tenant_id.clone(), t))
            .collect();
        Self {
            table: RwLock::new(table),
        }
    }

    pub async fn tenant(&self, tenant_id: &str) -> Option<Tenant> {
        self.table.read().await.get(tenant_id).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_all_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        Ok(self.table.read().await.values().cloned().collect())
    }

    async fn create_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        insert_tenant(&mut *self.table.write().await, tenant)
    }

    async fn remove_tenant(&self, tenant_id: &str) -> Result<(), StoreError> {
        delete_tenant(&mut *self.table.write().await, tenant_id)
    }

    async fn create_product(&self, tenant_id: &str, product: &Product) -> Result<(), StoreError> {
        insert_product(&mut *self.table.write().await, tenant_id, product)
    }

    async fn remove_product(&self, tenant_id: &str, product_id: &str) -> Result<(), StoreError> {
        delete_product(&mut *self.table.write().await, tenant_id, product_id)
    }

    async fn update_service(
        &self,
        tenant_id: &str,
        record: &ServiceRecord,
    ) -> Result<(), StoreError> {
        set_service(&mut *self.table.write().await, tenant_id, record)
    }
}
