//! JSON file state store
//!
//! The whole tenant table is one JSON document. Each mutation is applied to a
//! copy, written to a sibling temp file and renamed over the original; the
//! in-memory copy only advances once the rename succeeded.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    delete_product, delete_tenant, insert_product, insert_tenant, set_service, StateStore,
    StoreError, TenantTable,
};
use crate::model::{Product, ServiceRecord, Tenant};

/// Default state file location: ~/.iothub/state.json
pub fn default_state_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".iothub")
        .join("state.json")
}

pub fn parse_state(content: &str) -> Result<TenantTable, StoreError> {
    if content.trim().is_empty() {
        return Ok(TenantTable::new());
    }
    serde_json::from_str(content).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub fn serialize_state(table: &TenantTable) -> Result<String, StoreError> {
    serde_json::to_string_pretty(table).map_err(|e| StoreError::Serialization(e.to_string()))
}

pub struct FileStore {
    path: PathBuf,
    table: Mutex<TenantTable>,
}

impl FileStore {
    /// Open (or start) the state file at `path`
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let table = match tokio::fs::read_to_string(&path).await {
            Ok(content) => parse_state(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}, starting empty", path.display());
                TenantTable::new()
            }
            Err(e) => return Err(e.into()),
        };
        info!(
            "Loaded {} tenants from {}",
            table.len(),
            path.display()
        );
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, table: &TenantTable) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let content = serialize_state(table)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Apply `mutate` to a copy of the table, persist it, then commit
    async fn mutate<F>(&self, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut TenantTable) -> Result<(), StoreError>,
    {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        mutate(&mut next)?;
        self.write(&next).await?;
        *table = next;
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get_all_tenants(&self) -> Result<Vec<Tenant>, StoreError> {
        Ok(self.table.lock().await.values().cloned().collect())
    }

    async fn create_tenant(&self, tenant: &Tenant) -> Result<(), StoreError> {
        self.mutate(|t| insert_tenant(t, tenant)).await
    }

    async fn remove_tenant(&self, tenant_id: &str) -> Result<(), StoreError> {
        self.mutate(|t| delete_tenant(t, tenant_id)).await
    }

    async fn create_product(&self, tenant_id: &str, product: &Product) -> Result<(), StoreError> {
        self.mutate(|t| insert_product(t, tenant_id, product)).await
    }

    async fn remove_product(&self, tenant_id: &str, product_id: &str) -> Result<(), StoreError> {
        self.mutate(|t| delete_product(t, tenant_id, product_id))
            .await
    }

    async fn update_service(
        &self,
        tenant_id: &str,
        record: &ServiceRecord,
    ) -> Result<(), StoreError> {
        self.mutate(|t| set_service(t, tenant_id, record)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServiceState;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = FileStore::open(&path).await.unwrap();
            store.create_tenant(&Tenant::new("acme")).await.unwrap();
            store
                .create_product("acme", &Product::new("p1"))
                .await
                .unwrap();
            store
                .update_service(
                    "acme",
                    &ServiceRecord {
                        service_id: "svc-1".to_string(),
                        service_name: "broker-acme".to_string(),
                        service_state: ServiceState::Started,
                        instance_replicas: 1,
                        network_id: "net-1".to_string(),
                    },
                )
                .await
                .unwrap();
        }

        let store = FileStore::open(&path).await.unwrap();
        let tenants = store.get_all_tenants().await.unwrap();
        assert_eq!(tenants.len(), 1);
        assert_eq!(tenants[0].service_id, "svc-1");
        assert_eq!(tenants[0].service_state, ServiceState::Started);
        assert!(tenants[0].products.contains_key("p1"));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().join("nested").join("state.json"))
            .await
            .unwrap();
        assert!(store.get_all_tenants().await.unwrap().is_empty());

        store.create_tenant(&Tenant::new("acme")).await.unwrap();
        assert!(store.path().exists());
    }

    #[tokio::test]
    async fn test_failed_mutation_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStore::open(&path).await.unwrap();
        store.create_tenant(&Tenant::new("acme")).await.unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        assert!(matches!(
            store.create_tenant(&Tenant::new("acme")).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            FileStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
    }
}
