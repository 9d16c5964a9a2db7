//! Hub service
//!
//! Owns the in-memory tenant model and keeps it, the cluster backend and the
//! state store in step. Every mutating operation and the recovery pass run
//! under a single async mutex held across backend calls, so operations on the
//! same tenant are totally ordered.
//!
//! Per-tenant service state machine:
//!
//! ```text
//! None ──first product──▶ Started ──last product removed──▶ None
//!                           │  ▲
//!        recovery failed ───┘  └── next product created
//!                        ▼     │
//!                       Stopped
//! ```
//!
//! A `Stopped` tenant keeps the id of the service it lost, so the next start
//! or the final teardown can still remove what is left of it.

pub mod dispatch;

pub use dispatch::{Dispatcher, Handler};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::backend::{BackendError, ClusterBackend};
use crate::model::{is_valid_id, service_name_for, Product, ServiceRecord, ServiceState, Tenant};
use crate::store::{StateStore, StoreError};

/// Errors returned by hub operations
#[derive(Error, Debug)]
pub enum HubError {
    #[error("'{0}' not found")]
    NotFound(String),

    #[error("'{0}' already exists")]
    AlreadyExists(String),

    #[error("Invalid id '{0}': expected lowercase alphanumerics and '-', at most 63 chars")]
    InvalidId(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Name of the platform network every broker joins
    pub network_name: String,
    /// Upper bound on any single backend call
    pub backend_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            network_name: "iothub".to_string(),
            backend_timeout: Duration::from_secs(60),
        }
    }
}

/// A tenant whose service could not be brought back during recovery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryFailure {
    pub tenant_id: String,
    pub reason: String,
}

/// Outcome of one recovery pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// Services found running as recorded
    pub verified: Vec<String>,
    /// Services re-created, on the first or the retry attempt
    pub recreated: Vec<String>,
    pub failures: Vec<RecoveryFailure>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HubStats {
    pub tenants: usize,
    pub products: usize,
    pub services_started: usize,
    pub services_stopped: usize,
}

#[derive(Default)]
struct HubState {
    tenants: HashMap<String, Tenant>,
    network_id: Option<String>,
}

pub struct HubService {
    state: Mutex<HubState>,
    backend: Arc<dyn ClusterBackend>,
    store: Arc<dyn StateStore>,
    config: HubConfig,
    recovery: Notify,
}

fn check_id(id: &str) -> Result<(), HubError> {
    if is_valid_id(id) {
        Ok(())
    } else {
        Err(HubError::InvalidId(id.to_string()))
    }
}

impl HubService {
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        store: Arc<dyn StateStore>,
        config: HubConfig,
    ) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            backend,
            store,
            config,
            recovery: Notify::new(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    // ========================================================================
    // Startup
    // ========================================================================

    /// Load persisted tenants and, if there are any, request a recovery pass.
    ///
    /// Returns the number of tenants loaded.
    pub async fn initialize(&self) -> Result<usize, HubError> {
        let tenants = self.store.get_all_tenants().await?;
        let count = tenants.len();

        let mut state = self.state.lock().await;
        state.tenants = tenants
            .into_iter()
            .map(|t| (t.tenant_id.clone(), t))
            .collect();
        drop(state);

        info!("Loaded {} tenants from state store", count);
        if count > 0 {
            self.recovery.notify_one();
        }
        Ok(count)
    }

    /// Resolves once a recovery pass has been requested
    pub async fn recovery_requested(&self) {
        self.recovery.notified().await
    }

    /// Reconcile every tenant that should have a service against the backend.
    ///
    /// A tenant whose service is missing or not running is re-created with its
    /// persisted replica count. Tenants that fail get exactly one more creation
    /// attempt; those that fail again are marked `Stopped` and reported.
    pub async fn recover(&self) -> RecoveryReport {
        let mut state = self.state.lock().await;
        let mut report = RecoveryReport::default();

        if let Err(e) = self.resolve_network(&mut state).await {
            warn!(
                "Platform network {} unavailable: {}",
                self.config.network_name, e
            );
        }

        let mut candidates: Vec<String> = state
            .tenants
            .values()
            .filter(|t| t.has_service())
            .map(|t| t.tenant_id.clone())
            .collect();
        candidates.sort();

        info!("Recovering {} tenant services", candidates.len());

        let mut retry = Vec::new();
        for tenant_id in candidates {
            let service_id = match state.tenants.get(&tenant_id) {
                Some(t) => t.service_id.clone(),
                None => continue,
            };

            if !service_id.is_empty() {
                match self
                    .call(self.backend.introspect_service(&service_id))
                    .await
                {
                    Ok(spec) if spec.service_state == ServiceState::Started => {
                        debug!("Service {} of '{}' is running", service_id, tenant_id);
                        report.verified.push(tenant_id);
                        continue;
                    }
                    Ok(spec) => warn!(
                        "Service {} of '{}' is {}, re-creating",
                        service_id, tenant_id, spec.service_state
                    ),
                    Err(e) => warn!(
                        "Service {} of '{}' not found ({}), re-creating",
                        service_id, tenant_id, e
                    ),
                }
            }

            match self.recreate_service(&mut state, &tenant_id).await {
                Ok(()) => report.recreated.push(tenant_id),
                Err(e) => {
                    warn!("Recovery of '{}' failed, will retry once: {}", tenant_id, e);
                    retry.push(tenant_id);
                }
            }
        }

        for tenant_id in retry {
            match self.recreate_service(&mut state, &tenant_id).await {
                Ok(()) => report.recreated.push(tenant_id),
                Err(e) => {
                    error!("Recovery of '{}' failed twice: {}", tenant_id, e);
                    self.mark_stopped(&mut state, &tenant_id).await;
                    report.failures.push(RecoveryFailure {
                        tenant_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Recovery complete: {} verified, {} re-created, {} failed",
            report.verified.len(),
            report.recreated.len(),
            report.failures.len()
        );
        report
    }

    // ========================================================================
    // Tenant operations
    // ========================================================================

    pub async fn create_tenant(&self, tenant_id: &str) -> Result<(), HubError> {
        check_id(tenant_id)?;
        let mut state = self.state.lock().await;

        if state.tenants.contains_key(tenant_id) {
            return Err(HubError::AlreadyExists(tenant_id.to_string()));
        }

        let tenant = Tenant::new(tenant_id);
        self.store.create_tenant(&tenant).await?;
        state.tenants.insert(tenant_id.to_string(), tenant);

        info!("Created tenant '{}'", tenant_id);
        Ok(())
    }

    /// Tear down a tenant: its service first, then every product, then the
    /// record. Sub-step failures are logged and the teardown keeps going.
    pub async fn remove_tenant(&self, tenant_id: &str) -> Result<(), HubError> {
        let mut state = self.state.lock().await;

        let tenant = state
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| HubError::NotFound(tenant_id.to_string()))?;

        // Failures are logged by release_service; teardown carries on
        self.release_service(tenant_id, tenant.service_state, &tenant.service_id)
            .await
            .ok();
        if tenant.has_service() {
            tenant.clear_service();
            if let Err(e) = self
                .store
                .update_service(tenant_id, &tenant.service_record())
                .await
            {
                warn!("Failed to persist service reset of '{}': {}", tenant_id, e);
            }
        }

        let product_ids: Vec<String> = tenant.products.keys().cloned().collect();
        for product_id in product_ids {
            if let Err(e) = self
                .remove_product_locked(&mut state, tenant_id, &product_id)
                .await
            {
                warn!(
                    "Failed to remove product '{}' of '{}': {}",
                    product_id, tenant_id, e
                );
            }
        }

        self.store.remove_tenant(tenant_id).await?;
        state.tenants.remove(tenant_id);

        info!("Removed tenant '{}'", tenant_id);
        Ok(())
    }

    /// Rescale a tenant's running service
    pub async fn scale_tenant(&self, tenant_id: &str, replicas: u32) -> Result<(), HubError> {
        if replicas == 0 {
            return Err(HubError::InvalidState(
                "a running service needs at least one replica".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        let tenant = state
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| HubError::NotFound(tenant_id.to_string()))?;

        if tenant.service_state != ServiceState::Started {
            return Err(HubError::InvalidState(format!(
                "tenant '{}' has no running service ({})",
                tenant_id, tenant.service_state
            )));
        }

        let service_id = tenant.service_id.clone();
        self.call(self.backend.update_service(&service_id, replicas))
            .await?;

        let mut record = tenant.service_record();
        record.instance_replicas = replicas;
        self.store.update_service(tenant_id, &record).await?;
        tenant.apply_service_record(&record);

        info!("Scaled '{}' to {} replicas", tenant_id, replicas);
        Ok(())
    }

    // ========================================================================
    // Product operations
    // ========================================================================

    /// Add a product to a tenant, returning the id of the service fronting it.
    ///
    /// The first product of a tenant (or the first after a failed recovery)
    /// creates the tenant's service; if that fails the product is not added.
    pub async fn create_product(
        &self,
        tenant_id: &str,
        product_id: &str,
        replicas: u32,
    ) -> Result<String, HubError> {
        check_id(tenant_id)?;
        check_id(product_id)?;
        let mut state = self.state.lock().await;

        let tenant = state
            .tenants
            .get(tenant_id)
            .ok_or_else(|| HubError::NotFound(tenant_id.to_string()))?;
        if tenant.products.contains_key(product_id) {
            return Err(HubError::AlreadyExists(format!(
                "{}/{}",
                tenant_id, product_id
            )));
        }

        let previous = tenant.service_record();
        let started = if tenant.service_state == ServiceState::Started {
            None
        } else {
            let record = self
                .start_service(&mut state, tenant_id, replicas.max(1))
                .await?;
            if let Err(e) = self.store.update_service(tenant_id, &record).await {
                self.discard_service(&record.service_id).await;
                return Err(e.into());
            }
            Some(record)
        };

        let product = Product::new(product_id);
        if let Err(e) = self.store.create_product(tenant_id, &product).await {
            if let Some(record) = &started {
                self.discard_service(&record.service_id).await;
                if let Err(e) = self.store.update_service(tenant_id, &previous).await {
                    warn!("Failed to roll back service of '{}': {}", tenant_id, e);
                }
            }
            return Err(e.into());
        }
        if let Some(record) = &started {
            self.retire_service(tenant_id, &previous.service_id, &record.service_id)
                .await;
        }

        let tenant = state
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| HubError::NotFound(tenant_id.to_string()))?;
        if let Some(record) = &started {
            tenant.apply_service_record(record);
        }
        tenant.products.insert(product_id.to_string(), product);

        info!(
            "Created product '{}' of '{}' on service {}",
            product_id, tenant_id, tenant.service_id
        );
        Ok(tenant.service_id.clone())
    }

    /// Remove a product. Removing the last one tears down the tenant's service.
    pub async fn remove_product(&self, tenant_id: &str, product_id: &str) -> Result<(), HubError> {
        let mut state = self.state.lock().await;
        self.remove_product_locked(&mut state, tenant_id, product_id)
            .await
    }

    async fn remove_product_locked(
        &self,
        state: &mut HubState,
        tenant_id: &str,
        product_id: &str,
    ) -> Result<(), HubError> {
        let tenant = state
            .tenants
            .get_mut(tenant_id)
            .ok_or_else(|| HubError::NotFound(tenant_id.to_string()))?;
        if !tenant.products.contains_key(product_id) {
            return Err(HubError::NotFound(format!("{}/{}", tenant_id, product_id)));
        }

        self.store.remove_product(tenant_id, product_id).await?;
        tenant.products.remove(product_id);
        info!("Removed product '{}' of '{}'", product_id, tenant_id);

        if !tenant.products.is_empty() || !tenant.has_service() {
            return Ok(());
        }

        // Last product gone: the service goes with it
        let removed = self
            .release_service(tenant_id, tenant.service_state, &tenant.service_id)
            .await;

        tenant.clear_service();
        self.store
            .update_service(tenant_id, &tenant.service_record())
            .await?;
        removed.map_err(HubError::from)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn tenant(&self, tenant_id: &str) -> Option<Tenant> {
        self.state.lock().await.tenants.get(tenant_id).cloned()
    }

    /// All tenants, ordered by id
    pub async fn tenants(&self) -> Vec<Tenant> {
        let state = self.state.lock().await;
        let mut tenants: Vec<Tenant> = state.tenants.values().cloned().collect();
        tenants.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        tenants
    }

    pub async fn stats(&self) -> HubStats {
        let state = self.state.lock().await;
        let mut stats = HubStats {
            tenants: state.tenants.len(),
            ..Default::default()
        };
        for tenant in state.tenants.values() {
            stats.products += tenant.products.len();
            match tenant.service_state {
                ServiceState::Started => stats.services_started += 1,
                ServiceState::Stopped => stats.services_stopped += 1,
                ServiceState::None => {}
            }
        }
        stats
    }

    // ========================================================================
    // Backend helpers (called with the state lock held)
    // ========================================================================

    /// Bound a backend call by the configured timeout
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        match tokio::time::timeout(self.config.backend_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.config.backend_timeout.as_secs())),
        }
    }

    async fn resolve_network(&self, state: &mut HubState) -> Result<String, BackendError> {
        if let Some(network_id) = &state.network_id {
            return Ok(network_id.clone());
        }
        let network_id = self
            .call(self.backend.create_network(&self.config.network_name))
            .await?;
        info!(
            "Using network {} ({}) on {}",
            self.config.network_name,
            network_id,
            self.backend.name()
        );
        state.network_id = Some(network_id.clone());
        Ok(network_id)
    }

    /// Create a tenant's service and describe it as a record to persist.
    ///
    /// A service that came up but could not be registered for discovery is
    /// kept and treated as created.
    async fn start_service(
        &self,
        state: &mut HubState,
        tenant_id: &str,
        replicas: u32,
    ) -> Result<ServiceRecord, HubError> {
        let network_id = self.resolve_network(state).await?;

        let service_id = match self
            .call(self.backend.create_service(tenant_id, &network_id, replicas))
            .await
        {
            Ok(service_id) => service_id,
            // Created with errors: the service exists and stays tracked
            Err(e) => match e.created_service_id() {
                Some(service_id) => {
                    warn!(
                        "Service {} of '{}' created with errors: {}",
                        service_id, tenant_id, e
                    );
                    service_id.to_string()
                }
                None => return Err(e.into()),
            },
        };

        info!(
            "Started service {} for '{}' ({} replicas)",
            service_id, tenant_id, replicas
        );
        Ok(ServiceRecord {
            service_id,
            service_name: service_name_for(tenant_id),
            service_state: ServiceState::Started,
            instance_replicas: replicas,
            network_id,
        })
    }

    async fn recreate_service(&self, state: &mut HubState, tenant_id: &str) -> Result<(), HubError> {
        let (replicas, previous) = state
            .tenants
            .get(tenant_id)
            .map(|t| (t.instance_replicas.max(1), t.service_id.clone()))
            .ok_or_else(|| HubError::NotFound(tenant_id.to_string()))?;

        let record = self.start_service(state, tenant_id, replicas).await?;
        if let Err(e) = self.store.update_service(tenant_id, &record).await {
            self.discard_service(&record.service_id).await;
            return Err(e.into());
        }
        if let Some(tenant) = state.tenants.get_mut(tenant_id) {
            tenant.apply_service_record(&record);
        }
        self.retire_service(tenant_id, &previous, &record.service_id)
            .await;
        Ok(())
    }

    /// Give up on a tenant's service. The last known service id is kept so a
    /// later teardown can still remove whatever is left of it.
    async fn mark_stopped(&self, state: &mut HubState, tenant_id: &str) {
        let Some(tenant) = state.tenants.get_mut(tenant_id) else {
            return;
        };
        tenant.service_state = ServiceState::Stopped;
        if let Err(e) = self
            .store
            .update_service(tenant_id, &tenant.service_record())
            .await
        {
            warn!("Failed to persist stopped state of '{}': {}", tenant_id, e);
        }
    }

    /// Remove a tenant's service on teardown.
    ///
    /// The service of a `Stopped` tenant may already be gone, so its removal
    /// is best-effort and never fails the teardown.
    async fn release_service(
        &self,
        tenant_id: &str,
        service_state: ServiceState,
        service_id: &str,
    ) -> Result<(), BackendError> {
        if service_state == ServiceState::None || service_id.is_empty() {
            return Ok(());
        }

        match self.call(self.backend.remove_service(service_id)).await {
            Ok(()) => {
                info!("Removed service {} of '{}'", service_id, tenant_id);
                Ok(())
            }
            Err(BackendError::ServiceNotFound(_)) if service_state == ServiceState::Stopped => {
                debug!("Stopped service {} of '{}' is already gone", service_id, tenant_id);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Failed to remove service {} of '{}': {}",
                    service_id, tenant_id, e
                );
                if service_state == ServiceState::Stopped {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Best-effort removal of the service a tenant was moved off
    async fn retire_service(&self, tenant_id: &str, previous: &str, current: &str) {
        if previous.is_empty() || previous == current {
            return;
        }
        match self.call(self.backend.remove_service(previous)).await {
            Ok(()) => info!("Removed superseded service {} of '{}'", previous, tenant_id),
            Err(BackendError::ServiceNotFound(_)) => {
                debug!("Superseded service {} of '{}' is already gone", previous, tenant_id)
            }
            Err(e) => warn!(
                "Failed to remove superseded service {} of '{}': {}",
                previous, tenant_id, e
            ),
        }
    }

    /// Best-effort removal of a service that must not outlive a failed operation
    async fn discard_service(&self, service_id: &str) {
        if let Err(e) = self.call(self.backend.remove_service(service_id)).await {
            error!("Failed to discard orphaned service {}: {}", service_id, e);
        }
    }
}
