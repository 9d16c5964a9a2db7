//! Swarm-mode docker backend
//!
//! Drives a docker swarm through the `docker` CLI. Each tenant gets one
//! replicated service attached to an overlay network; the swarm's own restart
//! policy (`on-failure`, bounded delay and attempts) is the only retry this
//! adapter relies on for running brokers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::retry::{retry_on_conflict, DEFAULT_CONFLICT_RETRIES};
use super::{BackendError, ClusterBackend, DiscoveryHook};
use crate::discovery::ServiceDiscovery;
use crate::model::{service_name_for, Endpoint, ServiceSpec, ServiceState};

/// Swarm backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Broker image (validated once at initialize)
    pub image: String,

    /// Docker CLI binary
    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    /// Port the broker listens on inside the container
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,

    /// Shared infrastructure endpoints handed to every broker
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,

    /// Driver for tenant networks
    #[serde(default = "default_network_driver")]
    pub network_driver: String,

    #[serde(default = "default_restart_delay")]
    pub restart_delay: String,

    #[serde(default = "default_restart_max_attempts")]
    pub restart_max_attempts: u32,

    /// Attempts for a rescale that races with another update
    #[serde(default = "default_update_retries")]
    pub update_retries: u32,
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_network_driver() -> String {
    "overlay".to_string()
}

fn default_restart_delay() -> String {
    "5s".to_string()
}

fn default_restart_max_attempts() -> u32 {
    3
}

fn default_update_retries() -> u32 {
    DEFAULT_CONFLICT_RETRIES
}

impl SwarmConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            docker_bin: default_docker_bin(),
            broker_port: default_broker_port(),
            environment: HashMap::new(),
            network_driver: default_network_driver(),
            restart_delay: default_restart_delay(),
            restart_max_attempts: default_restart_max_attempts(),
            update_retries: default_update_retries(),
        }
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// `docker info` query for the local node's swarm state
pub fn generate_swarm_state_args() -> Vec<String> {
    vec![
        "info".to_string(),
        "--format".to_string(),
        "{{.Swarm.LocalNodeState}}".to_string(),
    ]
}

pub fn generate_image_inspect_args(image: &str) -> Vec<String> {
    vec![
        "image".to_string(),
        "inspect".to_string(),
        "--format".to_string(),
        "{{.Id}}".to_string(),
        image.to_string(),
    ]
}

/// Exact-name network lookup (docker's name filter matches substrings)
pub fn generate_network_lookup_args(name: &str) -> Vec<String> {
    vec![
        "network".to_string(),
        "ls".to_string(),
        "--filter".to_string(),
        format!("name=^{}$", name),
        "--format".to_string(),
        "{{.ID}}".to_string(),
    ]
}

pub fn generate_network_create_args(name: &str, driver: &str) -> Vec<String> {
    vec![
        "network".to_string(),
        "create".to_string(),
        "--driver".to_string(),
        driver.to_string(),
        "--attachable".to_string(),
        name.to_string(),
    ]
}

pub fn generate_network_rm_args(name: &str) -> Vec<String> {
    vec!["network".to_string(), "rm".to_string(), name.to_string()]
}

/// Generate `docker service create` arguments for a tenant's broker
pub fn generate_service_create_args(
    config: &SwarmConfig,
    tenant_id: &str,
    network_id: &str,
    replicas: u32,
) -> Vec<String> {
    let mut args = vec![
        "service".to_string(),
        "create".to_string(),
        "--detach".to_string(),
        "--quiet".to_string(),
        "--name".to_string(),
        service_name_for(tenant_id),
        "--network".to_string(),
        network_id.to_string(),
        "--replicas".to_string(),
        replicas.to_string(),
        "--endpoint-mode".to_string(),
        "vip".to_string(),
        "--label".to_string(),
        format!("iothub.tenant={}", tenant_id),
        "--restart-condition".to_string(),
        "on-failure".to_string(),
        "--restart-delay".to_string(),
        config.restart_delay.clone(),
        "--restart-max-attempts".to_string(),
        config.restart_max_attempts.to_string(),
    ];

    args.push("-e".to_string());
    args.push(format!("TENANT_ID={}", tenant_id));

    args.push("-e".to_string());
    args.push(format!("BROKER_PORT={}", config.broker_port));

    // Sorted so the command line is stable
    let mut env: Vec<_> = config.environment.iter().collect();
    env.sort();
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    args.push(config.image.clone());
    args
}

pub fn generate_service_rm_args(service_id: &str) -> Vec<String> {
    vec!["service".to_string(), "rm".to_string(), service_id.to_string()]
}

pub fn generate_service_inspect_args(service_id: &str) -> Vec<String> {
    vec![
        "service".to_string(),
        "inspect".to_string(),
        service_id.to_string(),
    ]
}

pub fn generate_service_scale_args(service_id: &str, replicas: u32) -> Vec<String> {
    vec![
        "service".to_string(),
        "update".to_string(),
        "--detach".to_string(),
        "--replicas".to_string(),
        replicas.to_string(),
        service_id.to_string(),
    ]
}

/// Map docker CLI stderr to a backend error
pub fn classify_docker_error(resource: &str, stderr: &str) -> BackendError {
    let lower = stderr.to_lowercase();
    if lower.contains("update out of sequence") {
        BackendError::Conflict(resource.to_string())
    } else if lower.contains("name conflicts") || lower.contains("already exists") {
        BackendError::AlreadyExists(resource.to_string())
    } else if lower.contains("no such service") || lower.contains("service not found") {
        BackendError::ServiceNotFound(resource.to_string())
    } else if lower.contains("no such network") || lower.contains("network not found") {
        BackendError::NetworkNotFound(resource.to_string())
    } else if lower.contains("cannot connect to the docker daemon") {
        BackendError::Unavailable(stderr.trim().to_string())
    } else {
        BackendError::RequestFailed(stderr.trim().to_string())
    }
}

/// Parse `docker service inspect` output into a service spec.
///
/// Every virtual IP is paired with every target port the service exposes; if
/// the service publishes no ports, the configured broker port is used.
pub fn parse_service_inspect(output: &str, broker_port: u16) -> Result<ServiceSpec, BackendError> {
    let value: Value = serde_json::from_str(output)
        .map_err(|e| BackendError::InvalidResponse(format!("service inspect: {}", e)))?;

    let service = value
        .as_array()
        .and_then(|a| a.first())
        .ok_or_else(|| BackendError::InvalidResponse("empty service inspect output".to_string()))?;

    let id = service["ID"]
        .as_str()
        .ok_or_else(|| BackendError::InvalidResponse("service without ID".to_string()))?;
    let name = service["Spec"]["Name"].as_str().unwrap_or_default();
    let replicas = service["Spec"]["Mode"]["Replicated"]["Replicas"]
        .as_u64()
        .unwrap_or(0) as u32;

    let mut ports: Vec<u16> = service["Endpoint"]["Ports"]
        .as_array()
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| p["TargetPort"].as_u64())
                .filter_map(|p| u16::try_from(p).ok())
                .collect()
        })
        .unwrap_or_default();
    if ports.is_empty() {
        ports.push(broker_port);
    }

    let mut spec = ServiceSpec::new(name, id);
    spec.replicas = replicas;
    if let Some(vips) = service["Endpoint"]["VirtualIPs"].as_array() {
        for vip in vips {
            let Some(addr) = vip["Addr"].as_str() else {
                continue;
            };
            // Addresses come in CIDR form, e.g. "10.0.1.5/24"
            let ip = addr.split('/').next().unwrap_or(addr);
            for port in &ports {
                spec.endpoints.push(Endpoint::new(ip, *port));
            }
        }
    }

    // `docker service inspect` does not report task health
    spec.ready_replicas = replicas;
    spec.service_state = ServiceState::Started;
    Ok(spec)
}

pub struct SwarmBackend {
    config: SwarmConfig,
    discovery: DiscoveryHook,
}

impl SwarmBackend {
    pub fn new(config: SwarmConfig) -> Self {
        Self {
            config,
            discovery: DiscoveryHook::default(),
        }
    }

    /// Run a docker CLI command and return its trimmed stdout
    async fn docker(&self, resource: &str, args: &[String]) -> Result<String, BackendError> {
        debug!("{} {:?}", self.config.docker_bin, args);

        let output = Command::new(&self.config.docker_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                BackendError::Unavailable(format!(
                    "Failed to run {}: {}",
                    self.config.docker_bin, e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_docker_error(resource, &stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn inspect(&self, service_id: &str) -> Result<ServiceSpec, BackendError> {
        let output = self
            .docker(service_id, &generate_service_inspect_args(service_id))
            .await?;
        parse_service_inspect(&output, self.config.broker_port)
    }

    /// Take over the service already running under a tenant's name.
    ///
    /// Docker accepts the name wherever it takes an id, so a failed inspect
    /// hands the name back as the service id.
    async fn adopt(&self, name: &str, replicas: u32) -> Result<String, BackendError> {
        let spec = self
            .inspect(name)
            .await
            .map_err(|e| BackendError::ReadBackFailed {
                service_id: name.to_string(),
                source: Box::new(e),
            })?;
        warn!(
            "Swarm service {} already exists as {}, adopting it",
            name, spec.service_id
        );

        if spec.replicas != replicas {
            if let Err(e) = self.update_service(&spec.service_id, replicas).await {
                warn!(
                    "Adopted service {} stays at {} replicas: {}",
                    spec.service_id, spec.replicas, e
                );
            }
        }
        Ok(spec.service_id)
    }
}

#[async_trait]
impl ClusterBackend for SwarmBackend {
    fn name(&self) -> &'static str {
        "swarm"
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        let state = self.docker("swarm", &generate_swarm_state_args()).await?;
        if state != "active" {
            return Err(BackendError::Unavailable(format!(
                "docker is not part of an active swarm (state: {})",
                state
            )));
        }

        self.docker(
            &self.config.image,
            &generate_image_inspect_args(&self.config.image),
        )
        .await
        .map_err(|e| {
            BackendError::ConfigError(format!(
                "broker image '{}' is not resolvable: {}",
                self.config.image, e
            ))
        })?;

        info!("Swarm backend ready, broker image {}", self.config.image);
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<String, BackendError> {
        let existing = self
            .docker(name, &generate_network_lookup_args(name))
            .await?;
        if let Some(id) = existing.lines().next().filter(|l| !l.is_empty()) {
            debug!("Network {} already exists as {}", name, id);
            return Ok(id.to_string());
        }

        let id = self
            .docker(
                name,
                &generate_network_create_args(name, &self.config.network_driver),
            )
            .await?;
        info!("Created network {} ({})", name, id);
        Ok(id)
    }

    async fn remove_network(&self, name: &str) -> Result<(), BackendError> {
        self.docker(name, &generate_network_rm_args(name)).await?;
        Ok(())
    }

    async fn create_service(
        &self,
        tenant_id: &str,
        network_id: &str,
        replicas: u32,
    ) -> Result<String, BackendError> {
        let name = service_name_for(tenant_id);
        let args = generate_service_create_args(&self.config, tenant_id, network_id, replicas);
        let service_id = match self.docker(&name, &args).await {
            Ok(service_id) => {
                info!(
                    "Created swarm service {} for '{}' ({} replicas)",
                    service_id, tenant_id, replicas
                );
                service_id
            }
            Err(BackendError::AlreadyExists(_)) => self.adopt(&name, replicas).await?,
            Err(e) => return Err(e),
        };

        if self.discovery.is_wired() {
            let spec = self
                .inspect(&service_id)
                .await
                .map_err(|e| BackendError::ReadBackFailed {
                    service_id: service_id.clone(),
                    source: Box::new(e),
                })?;
            self.discovery.register(&spec).await?;
        }

        Ok(service_id)
    }

    async fn remove_service(&self, service_id: &str) -> Result<(), BackendError> {
        // Capture the name for deregistration before the service disappears
        let spec = self.inspect(service_id).await.ok();

        self.docker(service_id, &generate_service_rm_args(service_id))
            .await?;
        info!("Removed swarm service {}", service_id);

        if let Some(spec) = spec {
            self.discovery.deregister(&spec).await;
        }
        Ok(())
    }

    async fn update_service(&self, service_id: &str, replicas: u32) -> Result<(), BackendError> {
        retry_on_conflict(service_id, self.config.update_retries, || async {
            self.inspect(service_id).await?;
            self.docker(service_id, &generate_service_scale_args(service_id, replicas))
                .await
        })
        .await?;

        if let Ok(spec) = self.inspect(service_id).await {
            self.discovery.refresh(&spec).await;
        }
        info!("Scaled swarm service {} to {} replicas", service_id, replicas);
        Ok(())
    }

    async fn introspect_service(&self, service_id: &str) -> Result<ServiceSpec, BackendError> {
        self.inspect(service_id).await
    }

    fn set_service_discovery(&mut self, registry: Arc<dyn ServiceDiscovery>) {
        self.discovery.set(registry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::MemoryDiscovery;

    const INSPECT: &str = r#"[{
        "ID": "k2lnq1b0s9x",
        "Spec": {
            "Name": "broker-acme",
            "Mode": {"Replicated": {"Replicas": 3}}
        },
        "Endpoint": {
            "Ports": [{"Protocol": "tcp", "TargetPort": 1883}],
            "VirtualIPs": [
                {"NetworkID": "n1", "Addr": "10.0.1.5/24"},
                {"NetworkID": "n2", "Addr": "10.0.2.7/24"}
            ]
        }
    }]"#;

    #[test]
    fn test_generate_service_create_args() {
        let mut config = SwarmConfig::new("registry.local/broker:1.4");
        config
            .environment
            .insert("MQ_ADDR".to_string(), "nats://bus:4222".to_string());

        let args = generate_service_create_args(&config, "acme", "iothub", 3);

        assert_eq!(&args[..3], &["service", "create", "--detach"]);
        assert!(args.windows(2).any(|w| w == ["--name", "broker-acme"]));
        assert!(args.windows(2).any(|w| w == ["--network", "iothub"]));
        assert!(args.windows(2).any(|w| w == ["--replicas", "3"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--restart-condition", "on-failure"]));
        assert!(args.windows(2).any(|w| w == ["--restart-max-attempts", "3"]));
        assert!(args.iter().any(|a| a == "TENANT_ID=acme"));
        assert!(args.iter().any(|a| a == "MQ_ADDR=nats://bus:4222"));
        assert_eq!(args.last().unwrap(), "registry.local/broker:1.4");
    }

    #[test]
    fn test_generate_network_args() {
        assert_eq!(
            generate_network_lookup_args("iothub"),
            vec!["network", "ls", "--filter", "name=^iothub$", "--format", "{{.ID}}"]
        );
        assert_eq!(
            generate_network_create_args("iothub", "overlay"),
            vec!["network", "create", "--driver", "overlay", "--attachable", "iothub"]
        );
    }

    #[test]
    fn test_generate_scale_args() {
        assert_eq!(
            generate_service_scale_args("k2lnq", 5),
            vec!["service", "update", "--detach", "--replicas", "5", "k2lnq"]
        );
    }

    #[test]
    fn test_parse_service_inspect() {
        let spec = parse_service_inspect(INSPECT, 1883).unwrap();

        assert_eq!(spec.service_id, "k2lnq1b0s9x");
        assert_eq!(spec.service_name, "broker-acme");
        assert_eq!(spec.replicas, 3);
        assert_eq!(
            spec.endpoints,
            vec![Endpoint::new("10.0.1.5", 1883), Endpoint::new("10.0.2.7", 1883)]
        );
    }

    #[test]
    fn test_parse_inspect_without_ports_uses_broker_port() {
        let output = r#"[{"ID": "abc", "Spec": {"Name": "broker-x"},
            "Endpoint": {"VirtualIPs": [{"Addr": "10.0.0.9/24"}]}}]"#;
        let spec = parse_service_inspect(output, 8883).unwrap();
        assert_eq!(spec.endpoints, vec![Endpoint::new("10.0.0.9", 8883)]);
    }

    #[test]
    fn test_parse_inspect_empty() {
        assert!(matches!(
            parse_service_inspect("[]", 1883),
            Err(BackendError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_service_inspect("not json", 1883),
            Err(BackendError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_classify_docker_error() {
        assert!(matches!(
            classify_docker_error("s", "Error response from daemon: update out of sequence"),
            BackendError::Conflict(_)
        ));
        assert!(matches!(
            classify_docker_error("s", "Error: No such service: s"),
            BackendError::ServiceNotFound(_)
        ));
        assert!(matches!(
            classify_docker_error("n", "Error: No such network: n"),
            BackendError::NetworkNotFound(_)
        ));
        assert!(matches!(
            classify_docker_error(
                "broker-acme",
                "Error response from daemon: rpc error: code = AlreadyExists \
                 desc = name conflicts with an existing object"
            ),
            BackendError::AlreadyExists(_)
        ));
        assert!(matches!(
            classify_docker_error("s", "something else"),
            BackendError::RequestFailed(_)
        ));
    }

    #[test]
    fn test_config_defaults() {
        let config: SwarmConfig = serde_yaml::from_str("image: broker:latest").unwrap();
        assert_eq!(config.docker_bin, "docker");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.restart_max_attempts, 3);
        assert_eq!(config.update_retries, DEFAULT_CONFLICT_RETRIES);
    }

    #[tokio::test]
    async fn test_missing_docker_binary_is_unavailable() {
        let mut config = SwarmConfig::new("broker:latest");
        config.docker_bin = "/nonexistent/docker".to_string();
        let backend = SwarmBackend::new(config);

        assert!(matches!(
            backend.initialize().await,
            Err(BackendError::Unavailable(_))
        ));
    }

    /// Write an executable stand-in for the docker CLI
    #[cfg(unix)]
    fn fake_docker(dir: &std::path::Path, script: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("docker");
        std::fs::write(&path, format!("#!/bin/sh\n{}", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    fn backend_with(docker_bin: String) -> (SwarmBackend, Arc<MemoryDiscovery>) {
        let mut config = SwarmConfig::new("broker:latest");
        config.docker_bin = docker_bin;
        let registry = Arc::new(MemoryDiscovery::new());
        let mut backend = SwarmBackend::new(config);
        backend.set_service_discovery(registry.clone());
        (backend, registry)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_read_back_keeps_service_id() {
        let dir = tempfile::tempdir().unwrap();
        let docker = fake_docker(
            dir.path(),
            r#"case "$1 $2" in
  "service create") echo svc123 ;;
  *) echo "error during connect: connection refused" >&2; exit 1 ;;
esac
"#,
        );
        let (backend, registry) = backend_with(docker);

        match backend.create_service("acme", "iothub", 1).await {
            Err(e @ BackendError::ReadBackFailed { .. }) => {
                assert_eq!(e.created_service_id(), Some("svc123"));
            }
            other => panic!("expected a read-back failure, got {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_name_conflict_adopts_existing_service() {
        let dir = tempfile::tempdir().unwrap();
        let updates = dir.path().join("updates");
        let docker = fake_docker(
            dir.path(),
            &format!(
                r#"case "$1 $2" in
  "service create") echo "Error response from daemon: rpc error: code = AlreadyExists desc = name conflicts with an existing object" >&2; exit 1 ;;
  "service inspect") cat <<'JSON'
{}
JSON
  ;;
  "service update") echo "$@" >> {} ;;
  *) exit 1 ;;
esac
"#,
                INSPECT,
                updates.display()
            ),
        );
        let (backend, registry) = backend_with(docker);

        let service_id = backend.create_service("acme", "iothub", 3).await.unwrap();
        assert_eq!(service_id, "k2lnq1b0s9x");
        assert_eq!(registry.lookup("broker-acme").unwrap().service_id, "k2lnq1b0s9x");
        // Replica count already matches, so no rescale is issued
        assert!(!updates.exists());

        let service_id = backend.create_service("acme", "iothub", 5).await.unwrap();
        assert_eq!(service_id, "k2lnq1b0s9x");
        let issued = std::fs::read_to_string(&updates).unwrap();
        assert!(issued.contains("--replicas 5 k2lnq1b0s9x"));
    }
}
