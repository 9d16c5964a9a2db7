//! Persistent state store
//!
//! Durable record of tenants, their products and their service metadata. The
//! hub is the only writer; every mutation it makes in memory is mirrored here
//! so a restarted control plane can reload and reconcile.

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{Product, ServiceRecord, Tenant};

/// Errors that can occur in the state store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record '{0}' not found")]
    NotFound(String),

    #[error("Record '{0}' already exists")]
    AlreadyExists(String),

    #[error("Failed to serialize state: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_all_tenants(&self) -> Result<Vec<Tenant>, StoreError>;

    async fn create_tenant(&self, tenant: &Tenant) -> Result<(), StoreError>;

    async fn remove_tenant(&self, tenant_id: &str) -> Result<(), StoreError>;

    /// Add a product to a tenant's product map
    async fn create_product(&self, tenant_id: &str, product: &Product) -> Result<(), StoreError>;

    async fn remove_product(&self, tenant_id: &str, product_id: &str) -> Result<(), StoreError>;

    /// Persist service identity, state, replicas and network of a tenant
    async fn update_service(&self, tenant_id: &str, record: &ServiceRecord)
        -> Result<(), StoreError>;
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Tenants keyed by id; the document both stores operate on
pub type TenantTable = BTreeMap<String, Tenant>;

pub fn insert_tenant(table: &mut TenantTable, tenant: &Tenant) -> Result<(), StoreError> {
    if table.contains_key(&tenant.tenant_id) {
        return Err(StoreError::AlreadyExists(tenant.tenant_id.clone()));
    }
    table.insert(tenant.tenant_id.clone(), tenant.clone());
    Ok(())
}

pub fn delete_tenant(table: &mut TenantTable, tenant_id: &str) -> Result<(), StoreError> {
    table
        .remove(tenant_id)
        .map(|_| ())
        .ok_or_else(|| StoreError::NotFound(tenant_id.to_string()))
}

fn tenant_mut<'a>(table: &'a mut TenantTable, tenant_id: &str) -> Result<&'a mut Tenant, StoreError> {
    table
        .get_mut(tenant_id)
        .ok_or_else(|| StoreError::NotFound(tenant_id.to_string()))
}

pub fn insert_product(
    table: &mut TenantTable,
    tenant_id: &str,
    product: &Product,
) -> Result<(), StoreError> {
    let tenant = tenant_mut(table, tenant_id)?;
    if tenant.products.contains_key(&product.product_id) {
        return Err(StoreError::AlreadyExists(format!(
            "{}/{}",
            tenant_id, product.product_id
        )));
    }
    tenant
        .products
        .insert(product.product_id.clone(), product.clone());
    Ok(())
}

pub fn delete_product(
    table: &mut TenantTable,
    tenant_id: &str,
    product_id: &str,
) -> Result<(), StoreError> {
    let tenant = tenant_mut(table, tenant_id)?;
    tenant
        .products
        .remove(product_id)
        .map(|_| ())
        .ok_or_else(|| StoreError::NotFound(format!("{}/{}", tenant_id, product_id)))
}

pub fn set_service(
    table: &mut TenantTable,
    tenant_id: &str,
    record: &ServiceRecord,
) -> Result<(), StoreError> {
    tenant_mut(table, tenant_id)?.apply_service_record(record);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServiceState;

    #[test]
    fn test_insert_tenant_rejects_duplicate() {
        let mut table = TenantTable::new();
        insert_tenant(&mut table, &Tenant::new("acme")).unwrap();
        assert!(matches!(
            insert_tenant(&mut table, &Tenant::new("acme")),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_product_requires_tenant() {
        let mut table = TenantTable::new();
        assert!(matches!(
            insert_product(&mut table, "ghost", &Product::new("p1")),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_product_add_remove() {
        let mut table = TenantTable::new();
        insert_tenant(&mut table, &Tenant::new("acme")).unwrap();
        insert_product(&mut table, "acme", &Product::new("p1")).unwrap();
        assert!(insert_product(&mut table, "acme", &Product::new("p1")).is_err());

        delete_product(&mut table, "acme", "p1").unwrap();
        assert!(table["acme"].products.is_empty());
        assert!(matches!(
            delete_product(&mut table, "acme", "p1"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_set_service() {
        let mut table = TenantTable::new();
        insert_tenant(&mut table, &Tenant::new("acme")).unwrap();

        let record = ServiceRecord {
            service_id: "svc-1".to_string(),
            service_name: "broker-acme".to_string(),
            service_state: ServiceState::Started,
            instance_replicas: 2,
            network_id: "net-1".to_string(),
        };
        set_service(&mut table, "acme", &record).unwrap();
        assert_eq!(table["acme"].service_record(), record);
    }
}
