//! Managed-orchestrator backend (Kubernetes)
//!
//! Talks to the Kubernetes API server over HTTPS. A tenant's broker is an
//! `apps/v1` Deployment fronted by a ClusterIP Service of the same name; the
//! "network" a tenant runs in is a namespace. Service ids have the form
//! `<namespace>/<name>`.
//!
//! Rescaling is a read-modify-write of the Deployment; the API server rejects
//! a write carrying a stale `resourceVersion` with 409, which is retried with
//! a fresh read through [`retry_on_conflict`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::retry::{retry_on_conflict, DEFAULT_CONFLICT_RETRIES};
use super::{BackendError, ClusterBackend, DiscoveryHook};
use crate::discovery::ServiceDiscovery;
use crate::model::{service_name_for, Endpoint, ServiceSpec, ServiceState};

/// In-cluster service account token location
pub const SERVICE_ACCOUNT_TOKEN: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Kubernetes backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubernetesConfig {
    /// API server URL
    #[serde(default = "default_api_server")]
    pub api_server: String,

    /// Bearer token; takes precedence over `token_file`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// File holding the bearer token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,

    /// PEM bundle used to verify the API server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_file: Option<String>,

    #[serde(default)]
    pub accept_invalid_certs: bool,

    /// Broker image
    pub image: String,

    #[serde(default = "default_broker_port")]
    pub broker_port: u16,

    /// Shared infrastructure endpoints handed to every broker
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,

    /// Attempts for a rescale that races with another writer
    #[serde(default = "default_update_retries")]
    pub update_retries: u32,

    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_api_server() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

fn default_update_retries() -> u32 {
    DEFAULT_CONFLICT_RETRIES
}

fn default_timeout() -> u64 {
    30
}

impl KubernetesConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            api_server: default_api_server(),
            token: None,
            token_file: None,
            ca_cert_file: None,
            accept_invalid_certs: false,
            image: image.into(),
            broker_port: default_broker_port(),
            environment: HashMap::new(),
            update_retries: default_update_retries(),
            timeout_secs: default_timeout(),
        }
    }
}

// ============================================================================
// SBIO: Manifest construction and parsing (no I/O)
// ============================================================================

pub fn namespace_manifest(name: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": name,
            "labels": { "app.kubernetes.io/managed-by": "iothub" }
        }
    })
}

fn labels(tenant_id: &str) -> Value {
    json!({
        "app.kubernetes.io/name": "broker",
        "app.kubernetes.io/managed-by": "iothub",
        "iothub/tenant": tenant_id
    })
}

/// Deployment (replica set) for a tenant's broker
pub fn deployment_manifest(
    config: &KubernetesConfig,
    tenant_id: &str,
    namespace: &str,
    replicas: u32,
) -> Value {
    let name = service_name_for(tenant_id);

    let mut env = vec![
        json!({ "name": "TENANT_ID", "value": tenant_id }),
        json!({ "name": "BROKER_PORT", "value": config.broker_port.to_string() }),
    ];
    let mut extra: Vec<_> = config.environment.iter().collect();
    extra.sort();
    for (key, value) in extra {
        env.push(json!({ "name": key, "value": value }));
    }

    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": labels(tenant_id)
        },
        "spec": {
            "replicas": replicas,
            "selector": { "matchLabels": { "iothub/tenant": tenant_id } },
            "template": {
                "metadata": { "labels": labels(tenant_id) },
                "spec": {
                    "containers": [{
                        "name": "broker",
                        "image": config.image,
                        "env": env,
                        "ports": [{ "name": "mqtt", "containerPort": config.broker_port }]
                    }]
                }
            }
        }
    })
}

/// ClusterIP service giving the deployment a stable virtual IP
pub fn service_manifest(config: &KubernetesConfig, tenant_id: &str, namespace: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": service_name_for(tenant_id),
            "namespace": namespace,
            "labels": labels(tenant_id)
        },
        "spec": {
            "type": "ClusterIP",
            "selector": { "iothub/tenant": tenant_id },
            "ports": [{
                "name": "mqtt",
                "port": config.broker_port,
                "targetPort": config.broker_port
            }]
        }
    })
}

/// Split a `<namespace>/<name>` service id
pub fn parse_service_id(service_id: &str) -> Result<(&str, &str), BackendError> {
    match service_id.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok((ns, name)),
        _ => Err(BackendError::ServiceNotFound(service_id.to_string())),
    }
}

pub fn set_replicas(deployment: &mut Value, replicas: u32) {
    deployment["spec"]["replicas"] = json!(replicas);
}

/// Build a service spec from a Deployment and (optionally) its Service
pub fn spec_from_resources(service_id: &str, deployment: &Value, service: Option<&Value>) -> ServiceSpec {
    let name = deployment["metadata"]["name"].as_str().unwrap_or_default();
    let mut spec = ServiceSpec::new(name, service_id);
    spec.replicas = deployment["spec"]["replicas"].as_u64().unwrap_or(0) as u32;
    spec.ready_replicas = deployment["status"]["readyReplicas"].as_u64().unwrap_or(0) as u32;
    spec.service_state = ServiceState::Started;

    if let Some(service) = service {
        let ip = service["spec"]["clusterIP"].as_str().unwrap_or_default();
        if !ip.is_empty() && ip != "None" {
            for port in service["spec"]["ports"].as_array().into_iter().flatten() {
                if let Some(port) = port["port"].as_u64().and_then(|p| u16::try_from(p).ok()) {
                    spec.endpoints.push(Endpoint::new(ip, port));
                }
            }
        }
    }
    spec
}

fn deployments_path(namespace: &str) -> String {
    format!("/apis/apps/v1/namespaces/{}/deployments", namespace)
}

fn services_path(namespace: &str) -> String {
    format!("/api/v1/namespaces/{}/services", namespace)
}

pub struct KubernetesBackend {
    config: KubernetesConfig,
    client: Client,
    token: Option<String>,
    discovery: DiscoveryHook,
}

impl KubernetesBackend {
    pub fn new(config: KubernetesConfig) -> Result<Self, BackendError> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(path) = &config.ca_cert_file {
            let pem = std::fs::read(path)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| BackendError::ConfigError(format!("invalid CA bundle {}: {}", path, e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| BackendError::ConfigError(e.to_string()))?;

        let token = match (&config.token, &config.token_file) {
            (Some(token), _) => Some(token.clone()),
            (None, Some(path)) => Some(std::fs::read_to_string(path)?.trim().to_string()),
            (None, None) => None,
        };

        Ok(Self {
            config,
            client,
            token,
            discovery: DiscoveryHook::default(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.api_server.trim_end_matches('/'), path);
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, BackendError> {
        builder
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))
    }

    /// Turn a response into JSON, mapping API status codes to backend errors
    async fn json(resource: &str, resp: Response) -> Result<Value, BackendError> {
        let status = resp.status();
        if status.is_success() {
            return resp
                .json::<Value>()
                .await
                .map_err(|e| BackendError::InvalidResponse(e.to_string()));
        }

        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => BackendError::ServiceNotFound(resource.to_string()),
            StatusCode::CONFLICT => BackendError::Conflict(resource.to_string()),
            _ => BackendError::RequestFailed(format!("{} returned {}: {}", resource, status, body)),
        })
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Value, BackendError> {
        let path = format!("{}/{}", deployments_path(namespace), name);
        let resp = self.send(self.request(Method::GET, &path)).await?;
        Self::json(name, resp).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Value, BackendError> {
        let path = format!("{}/{}", services_path(namespace), name);
        let resp = self.send(self.request(Method::GET, &path)).await?;
        Self::json(name, resp).await
    }

    async fn delete(&self, path: &str, resource: &str) -> Result<(), BackendError> {
        let resp = self
            .send(
                self.request(Method::DELETE, path)
                    .json(&json!({ "propagationPolicy": "Foreground" })),
            )
            .await?;
        Self::json(resource, resp).await.map(|_| ())
    }

    async fn describe(&self, service_id: &str) -> Result<ServiceSpec, BackendError> {
        let (namespace, name) = parse_service_id(service_id)?;
        let deployment = self.get_deployment(namespace, name).await?;
        let service = match self.get_service(namespace, name).await {
            Ok(service) => Some(service),
            Err(e) => {
                debug!("No service object for {}: {}", service_id, e);
                None
            }
        };
        Ok(spec_from_resources(service_id, &deployment, service.as_ref()))
    }

    /// Take over a deployment left behind under the tenant's name.
    ///
    /// The deployment is known to exist, so a failed read still hands its id
    /// back to the caller.
    async fn adopt(&self, service_id: &str, replicas: u32) -> Result<(), BackendError> {
        let (namespace, name) = parse_service_id(service_id)?;
        let deployment = self.get_deployment(namespace, name).await.map_err(|e| {
            BackendError::ReadBackFailed {
                service_id: service_id.to_string(),
                source: Box::new(e),
            }
        })?;
        warn!("Deployment {} already exists, adopting it", service_id);

        let current = deployment["spec"]["replicas"].as_u64().unwrap_or(0);
        if current != u64::from(replicas) {
            if let Err(e) = self.update_service(service_id, replicas).await {
                warn!(
                    "Adopted deployment {} stays at {} replicas: {}",
                    service_id, current, e
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterBackend for KubernetesBackend {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        let resp = self.send(self.request(Method::GET, "/version")).await?;
        let version = Self::json("version", resp).await?;
        info!(
            "Connected to Kubernetes {} at {}",
            version["gitVersion"].as_str().unwrap_or("unknown"),
            self.config.api_server
        );
        Ok(())
    }

    async fn create_network(&self, name: &str) -> Result<String, BackendError> {
        let resp = self
            .send(
                self.request(Method::POST, "/api/v1/namespaces")
                    .json(&namespace_manifest(name)),
            )
            .await?;

        match Self::json(name, resp).await {
            Ok(_) => info!("Created namespace {}", name),
            Err(BackendError::Conflict(_)) => debug!("Namespace {} already exists", name),
            Err(e) => return Err(e),
        }
        Ok(name.to_string())
    }

    async fn remove_network(&self, name: &str) -> Result<(), BackendError> {
        self.delete(&format!("/api/v1/namespaces/{}", name), name)
            .await
            .map_err(|e| match e {
                BackendError::ServiceNotFound(n) => BackendError::NetworkNotFound(n),
                other => other,
            })
    }

    async fn create_service(
        &self,
        tenant_id: &str,
        network_id: &str,
        replicas: u32,
    ) -> Result<String, BackendError> {
        let name = service_name_for(tenant_id);
        let service_id = format!("{}/{}", network_id, name);

        let resp = self
            .send(
                self.request(Method::POST, &deployments_path(network_id))
                    .json(&deployment_manifest(&self.config, tenant_id, network_id, replicas)),
            )
            .await?;
        match Self::json(&name, resp).await {
            Ok(_) => info!(
                "Created deployment {} for '{}' ({} replicas)",
                service_id, tenant_id, replicas
            ),
            Err(BackendError::Conflict(_)) => self.adopt(&service_id, replicas).await?,
            Err(e) => return Err(e),
        }

        let resp = self
            .send(
                self.request(Method::POST, &services_path(network_id))
                    .json(&service_manifest(&self.config, tenant_id, network_id)),
            )
            .await?;
        match Self::json(&name, resp).await {
            Ok(_) => {}
            Err(BackendError::Conflict(_)) => {
                debug!("Service object for {} already exists", service_id)
            }
            Err(e) => {
                warn!(
                    "Service object for {} failed, removing deployment: {}",
                    service_id, e
                );
                let path = format!("{}/{}", deployments_path(network_id), name);
                if let Err(cleanup) = self.delete(&path, &name).await {
                    warn!("Failed to clean up deployment {}: {}", service_id, cleanup);
                }
                return Err(e);
            }
        }

        if self.discovery.is_wired() {
            let spec = self
                .describe(&service_id)
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
        let (namespace, name) = parse_service_id(service_id)?;

        self.delete(&format!("{}/{}", deployments_path(namespace), name), service_id)
            .await?;

        match self
            .delete(&format!("{}/{}", services_path(namespace), name), service_id)
            .await
        {
            Ok(()) | Err(BackendError::ServiceNotFound(_)) => {}
            Err(e) => warn!("Failed to delete service object {}: {}", service_id, e),
        }

        info!("Removed deployment {}", service_id);
        self.discovery
            .deregister(&ServiceSpec::new(name, service_id))
            .await;
        Ok(())
    }

    async fn update_service(&self, service_id: &str, replicas: u32) -> Result<(), BackendError> {
        let (namespace, name) = parse_service_id(service_id)?;
        let path = format!("{}/{}", deployments_path(namespace), name);

        retry_on_conflict(service_id, self.config.update_retries, || async {
            let mut deployment = self.get_deployment(namespace, name).await?;
            set_replicas(&mut deployment, replicas);

            let resp = self
                .send(self.request(Method::PUT, &path).json(&deployment))
                .await?;
            Self::json(service_id, resp).await
        })
        .await?;

        info!("Scaled deployment {} to {} replicas", service_id, replicas);
        if let Ok(spec) = self.describe(service_id).await {
            self.discovery.refresh(&spec).await;
        }
        Ok(())
    }

    async fn introspect_service(&self, service_id: &str) -> Result<ServiceSpec, BackendError> {
        self.describe(service_id).await
    }

    fn set_service_discovery(&mut self, registry: Arc<dyn ServiceDiscovery>) {
        self.discovery.set(registry);
    }
}
