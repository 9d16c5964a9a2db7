//! Local-process backend
//!
//! Runs each tenant's broker as a subprocess on this machine. Ports come from
//! a private pool (`port_base + random offset`); every service gets its own
//! cancellation token, and cancelling it kills the subprocess.
//!
//! Only one replica per tenant is supported. Larger requests are capped at 1
//! and logged.

use std::collections::HashMap;
use std::net::TcpListener;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BackendError, ClusterBackend, DiscoveryHook};
use crate::discovery::ServiceDiscovery;
use crate::model::{service_name_for, Endpoint, ServiceSpec, ServiceState};

/// Local backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Broker executable
    pub command: String,

    /// Arguments; `{port}` and `{tenant}` are substituted per service
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment passed to every broker
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// Address brokers bind to and are advertised at
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port_base")]
    pub port_base: u16,

    /// Size of the port pool above `port_base`
    #[serde(default = "default_port_range")]
    pub port_range: u16,

    /// Random probes before giving up on finding a free port
    #[serde(default = "default_max_probes")]
    pub max_probes: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port_base() -> u16 {
    10000
}

fn default_port_range() -> u16 {
    1000
}

fn default_max_probes() -> u32 {
    16
}

impl LocalConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            host: default_host(),
            port_base: default_port_base(),
            port_range: default_port_range(),
            max_probes: default_max_probes(),
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_ports(mut self, base: u16, range: u16) -> Self {
        self.port_base = base;
        self.port_range = range;
        self
    }
}

/// Substitute `{port}` and `{tenant}` placeholders in broker arguments
pub fn render_args(args: &[String], tenant_id: &str, port: u16) -> Vec<String> {
    args.iter()
        .map(|a| {
            a.replace("{port}", &port.to_string())
                .replace("{tenant}", tenant_id)
        })
        .collect()
}

struct LocalService {
    spec: ServiceSpec,
    port: u16,
    cancel: CancellationToken,
    exited: Arc<AtomicBool>,
}

#[derive(Default)]
struct LocalState {
    /// port -> service id
    ports: HashMap<u16, String>,
    /// service id -> running service
    services: HashMap<String, LocalService>,
}

pub struct LocalBackend {
    config: LocalConfig,
    state: Mutex<LocalState>,
    discovery: DiscoveryHook,
    shutdown: CancellationToken,
}

impl LocalBackend {
    pub fn new(config: LocalConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LocalState::default()),
            discovery: DiscoveryHook::default(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Pick a port that is neither allocated to a service nor bound by anyone else
    fn allocate_port(&self, state: &LocalState) -> Result<u16, BackendError> {
        let range = self.config.port_range.max(1);
        let mut rng = rand::thread_rng();

        for _ in 0..self.config.max_probes {
            let port = self
                .config
                .port_base
                .saturating_add(rng.gen_range(0..range));
            if state.ports.contains_key(&port) {
                continue;
            }
            if TcpListener::bind((self.config.host.as_str(), port)).is_err() {
                debug!("Port {} is bound by another process", port);
                continue;
            }
            return Ok(port);
        }

        Err(BackendError::PortsExhausted(self.config.max_probes))
    }

    fn spawn_broker(
        &self,
        tenant_id: &str,
        network_id: &str,
        port: u16,
    ) -> Result<Child, BackendError> {
        Command::new(&self.config.command)
            .args(render_args(&self.config.args, tenant_id, port))
            .envs(&self.config.env)
            .env("TENANT_ID", tenant_id)
            .env("NETWORK_ID", network_id)
            .env("PORT", port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackendError::SpawnError(format!("Failed to start {}: {}", self.config.command, e))
            })
    }

    /// Number of services currently tracked
    pub async fn service_count(&self) -> usize {
        self.state.lock().await.services.len()
    }
}

/// Wait for the broker to exit or for its context to be cancelled
async fn supervise(
    mut child: Child,
    cancel: CancellationToken,
    exited: Arc<AtomicBool>,
    service_id: String,
) {
    tokio::select! {
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill local service {}: {}", service_id, e);
            } else {
                debug!("Local service {} stopped", service_id);
            }
        }
        status = child.wait() => {
            match status {
                Ok(status) => warn!("Local service {} exited: {}", service_id, status),
                Err(e) => warn!("Lost track of local service {}: {}", service_id, e),
            }
        }
    }
    exited.store(true, Ordering::SeqCst);
}

/// Drop entries for brokers under `service_name` whose process already exited,
/// freeing their ports
fn release_exited(state: &mut LocalState, service_name: &str) {
    let stale: Vec<String> = state
        .services
        .iter()
        .filter(|(_, s)| s.spec.service_name == service_name && s.exited.load(Ordering::SeqCst))
        .map(|(id, _)| id.clone())
        .collect();

    for service_id in stale {
        if let Some(service) = state.services.remove(&service_id) {
            state.ports.remove(&service.port);
            debug!(
                "Released exited local service {} (port {})",
                service_id, service.port
            );
        }
    }
}

#[async_trait]
impl ClusterBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        if self.config.command.trim().is_empty() {
            return Err(BackendError::ConfigError(
                "local backend requires a broker command".to_string(),
            ));
        }
        if u32::from(self.config.port_base) + u32::from(self.config.port_range) > 65535 {
            return Err(BackendError::ConfigError(format!(
                "port pool {}+{} exceeds 65535",
                self.config.port_base, self.config.port_range
            )));
        }
        info!(
            "Local backend ready: command={}, ports {}..{}",
            self.config.command,
            self.config.port_base,
            u32::from(self.config.port_base) + u32::from(self.config.port_range)
        );
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<String, BackendError> {
        Ok(name.to_string())
    }

    async fn remove_network(&self, _name: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn create_service(
        &self,
        tenant_id: &str,
        network_id: &str,
        replicas: u32,
    ) -> Result<String, BackendError> {
        if replicas > 1 {
            warn!(
                "Local backend runs one replica per tenant; capping {} requested for '{}' to 1",
                replicas, tenant_id
            );
        }

        let service_id = format!("local-{}", Uuid::new_v4().simple());
        let spec = {
            let mut state = self.state.lock().await;
            release_exited(&mut state, &service_name_for(tenant_id));
            let port = self.allocate_port(&state)?;
            let child = self.spawn_broker(tenant_id, network_id, port)?;

            let cancel = self.shutdown.child_token();
            let exited = Arc::new(AtomicBool::new(false));
            tokio::spawn(supervise(
                child,
                cancel.clone(),
                exited.clone(),
                service_id.clone(),
            ));

            let mut spec = ServiceSpec::new(service_name_for(tenant_id), &service_id);
            spec.endpoints
                .push(Endpoint::new(self.config.host.clone(), port));
            spec.replicas = 1;
            spec.ready_replicas = 1;

            state.ports.insert(port, service_id.clone());
            state.services.insert(
                service_id.clone(),
                LocalService {
                    spec: spec.clone(),
                    port,
                    cancel,
                    exited,
                },
            );
            spec
        };

        info!(
            "Started local service {} for '{}' on {}",
            service_id, tenant_id, spec.endpoints[0]
        );

        self.discovery.register(&spec).await?;
        Ok(service_id)
    }

    async fn remove_service(&self, service_id: &str) -> Result<(), BackendError> {
        let service = {
            let mut state = self.state.lock().await;
            let service = state
                .services
                .remove(service_id)
                .ok_or_else(|| BackendError::ServiceNotFound(service_id.to_string()))?;
            state.ports.remove(&service.port);
            service
        };

        service.cancel.cancel();
        info!("Removed local service {}", service_id);

        self.discovery.deregister(&service.spec).await;
        Ok(())
    }

    async fn update_service(&self, service_id: &str, replicas: u32) -> Result<(), BackendError> {
        let state = self.state.lock().await;
        if !state.services.contains_key(service_id) {
            return Err(BackendError::ServiceNotFound(service_id.to_string()));
        }
        if replicas != 1 {
            warn!(
                "Local backend runs one replica per tenant; ignoring rescale of {} to {}",
                service_id, replicas
            );
        }
        Ok(())
    }

    async fn introspect_service(&self, service_id: &str) -> Result<ServiceSpec, BackendError> {
        let state = self.state.lock().await;
        let service = state
            .services
            .get(service_id)
            .ok_or_else(|| BackendError::ServiceNotFound(service_id.to_string()))?;

        let mut spec = service.spec.clone();
        if service.exited.load(Ordering::SeqCst) {
            spec.service_state = ServiceState::Stopped;
            spec.ready_replicas = 0;
        }
        Ok(spec)
    }

    fn set_service_discovery(&mut self, registry: Arc<dyn ServiceDiscovery>) {
        self.discovery.set(registry);
    }

    async fn shutdown(&self) {
        info!("Stopping all local services");
        self.shutdown.cancel();
        let mut state = self.state.lock().await;
        state.ports.clear();
        state.services.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{DiscoveryError, MemoryDiscovery};

    fn sleeper(base: u16, range: u16) -> LocalBackend {
        LocalBackend::new(
            LocalConfig::new("sleep")
                .with_args(&["30"])
                .with_ports(base, range),
        )
    }

    #[test]
    fn test_render_args() {
        let args = vec![
            "--port={port}".to_string(),
            "--client-id".to_string(),
            "{tenant}".to_string(),
        ];
        assert_eq!(
            render_args(&args, "acme", 10042),
            vec!["--port=10042", "--client-id", "acme"]
        );
    }

    #[test]
    fn test_config_defaults() {
        let config: LocalConfig = serde_yaml::from_str("command: mosquitto").unwrap();
        assert_eq!(config.port_base, 10000);
        assert_eq!(config.host, "127.0.0.1");
        assert!(config.args.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_rejects_empty_command() {
        let backend = LocalBackend::new(LocalConfig::new(" "));
        assert!(matches!(
            backend.initialize().await,
            Err(BackendError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_create_and_remove_service() {
        let backend = sleeper(41000, 500);
        let id = backend.create_service("acme", "iothub", 1).await.unwrap();

        let spec = backend.introspect_service(&id).await.unwrap();
        assert_eq!(spec.service_name, "broker-acme");
        assert_eq!(spec.endpoints.len(), 1);
        assert_eq!(spec.service_state, ServiceState::Started);

        backend.remove_service(&id).await.unwrap();
        assert_eq!(backend.service_count().await, 0);
        assert!(matches!(
            backend.introspect_service(&id).await,
            Err(BackendError::ServiceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_replicas_capped_at_one() {
        let backend = sleeper(41500, 500);
        let id = backend.create_service("acme", "iothub", 3).await.unwrap();

        let spec = backend.introspect_service(&id).await.unwrap();
        assert_eq!(spec.replicas, 1);

        backend.remove_service(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_unknown_service() {
        let backend = sleeper(42000, 500);
        let result = backend.remove_service("local-missing").await;
        assert!(matches!(result, Err(BackendError::ServiceNotFound(_))));
    }

    #[tokio::test]
    async fn test_concurrent_creation_uses_distinct_ports() {
        let backend = sleeper(42500, 500);
        let (a, b) = tokio::join!(
            backend.create_service("acme", "iothub", 1),
            backend.create_service("globex", "iothub", 1)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        let port_a = backend.introspect_service(&a).await.unwrap().endpoints[0].port;
        let port_b = backend.introspect_service(&b).await.unwrap().endpoints[0].port;
        assert_ne!(port_a, port_b);

        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_pool_exhaustion() {
        let mut config = LocalConfig::new("sleep")
            .with_args(&["30"])
            .with_ports(43000, 1);
        config.max_probes = 3;
        let backend = LocalBackend::new(config);

        let first = backend.create_service("acme", "iothub", 1).await.unwrap();
        let second = backend.create_service("globex", "iothub", 1).await;
        assert!(matches!(second, Err(BackendError::PortsExhausted(3))));

        backend.remove_service(&first).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_nothing() {
        let backend = LocalBackend::new(
            LocalConfig::new("/nonexistent/broker-binary").with_ports(43500, 500),
        );
        let result = backend.create_service("acme", "iothub", 1).await;
        assert!(matches!(result, Err(BackendError::SpawnError(_))));
        assert_eq!(backend.service_count().await, 0);
    }

    #[tokio::test]
    async fn test_registers_with_discovery() {
        let registry = Arc::new(MemoryDiscovery::new());
        let mut backend = sleeper(44000, 500);
        backend.set_service_discovery(registry.clone());

        let id = backend.create_service("acme", "iothub", 1).await.unwrap();
        let entry = registry.lookup("broker-acme").unwrap();
        assert_eq!(entry.service_id, id);

        backend.remove_service(&id).await.unwrap();
        assert!(registry.lookup("broker-acme").is_none());
    }

    struct UnreachableRegistry;

    #[async_trait]
    impl ServiceDiscovery for UnreachableRegistry {
        async fn register_service(&self, _service: &ServiceSpec) -> Result<(), DiscoveryError> {
            Err(DiscoveryError::RequestFailed("connection refused".to_string()))
        }

        async fn remove_service(&self, _service: &ServiceSpec) {}

        async fn update_service(&self, _service: &ServiceSpec) -> Result<(), DiscoveryError> {
            Err(DiscoveryError::RequestFailed("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_discovery_failure_is_partial() {
        let mut backend = sleeper(44500, 500);
        backend.set_service_discovery(Arc::new(UnreachableRegistry));

        let result = backend.create_service("acme", "iothub", 1).await;
        let service_id = match result {
            Err(BackendError::DiscoveryPartial { service_id, .. }) => service_id,
            other => panic!("expected partial failure, got {:?}", other),
        };

        // The deployment stays up even though discovery failed
        assert!(backend.introspect_service(&service_id).await.is_ok());
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_recreate_replaces_stale_registration() {
        let registry = Arc::new(MemoryDiscovery::new());
        registry
            .register_service(&ServiceSpec::new("broker-acme", "stale"))
            .await
            .unwrap();

        let mut backend = sleeper(44700, 200);
        backend.set_service_discovery(registry.clone());

        let id = backend.create_service("acme", "iothub", 1).await.unwrap();
        assert_eq!(registry.lookup("broker-acme").unwrap().service_id, id);
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn test_recreate_releases_exited_broker() {
        let backend = LocalBackend::new(LocalConfig::new("true").with_ports(44900, 100));
        let first = backend.create_service("acme", "iothub", 1).await.unwrap();

        let mut exited = false;
        for _ in 0..200 {
            let spec = backend.introspect_service(&first).await.unwrap();
            if spec.service_state == ServiceState::Stopped {
                exited = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(exited);

        let second = backend.create_service("acme", "iothub", 1).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(backend.service_count().await, 1);
        assert_eq!(backend.state.lock().await.ports.len(), 1);
        assert!(matches!(
            backend.introspect_service(&first).await,
            Err(BackendError::ServiceNotFound(_))
        ));
        backend.shutdown().await;
    }
}
