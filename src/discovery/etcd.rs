//! Discovery registry backed by etcd's v3 JSON gateway
//!
//! Each registered service is one key at `<prefix>/<service_name>` whose value
//! is the JSON-encoded [`ServiceSpec`]. Registration is create-only: a
//! transaction compares the key's create revision against zero, so an
//! existing node surfaces as [`DiscoveryError::AlreadyExists`].

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{DiscoveryError, ServiceDiscovery};
use crate::model::ServiceSpec;

/// Connection settings for the coordination service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtcdConfig {
    /// Gateway URL (e.g., "http://127.0.0.1:2379")
    pub endpoint: String,

    /// Key prefix under which services are registered
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_prefix() -> String {
    "/iothub/services".to_string()
}

fn default_timeout() -> u64 {
    10
}

// ============================================================================
// SBIO: Pure request/response shaping (no I/O)
// ============================================================================

/// Node path for a service
pub fn service_key(prefix: &str, service_name: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), service_name)
}

/// Body of a create-only put transaction
pub fn create_txn_body(key: &str, value: &[u8]) -> Value {
    let key = STANDARD.encode(key);
    json!({
        "compare": [{
            "key": key,
            "result": "EQUAL",
            "target": "CREATE",
            "create_revision": "0"
        }],
        "success": [{
            "request_put": { "key": key, "value": STANDARD.encode(value) }
        }]
    })
}

/// Body of a put that only succeeds when the key already exists
pub fn update_txn_body(key: &str, value: &[u8]) -> Value {
    let key = STANDARD.encode(key);
    json!({
        "compare": [{
            "key": key,
            "result": "GREATER",
            "target": "CREATE",
            "create_revision": "0"
        }],
        "success": [{
            "request_put": { "key": key, "value": STANDARD.encode(value) }
        }]
    })
}

pub fn delete_body(key: &str) -> Value {
    json!({ "key": STANDARD.encode(key) })
}

#[derive(Debug, Deserialize)]
struct TxnResponse {
    #[serde(default)]
    succeeded: bool,
}

/// Registry client for an etcd cluster
pub struct EtcdDiscovery {
    config: EtcdConfig,
    client: Client,
}

impl EtcdDiscovery {
    pub fn new(config: EtcdConfig) -> Result<Self, DiscoveryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DiscoveryError::RequestFailed(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, DiscoveryError> {
        let resp = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|e| DiscoveryError::RequestFailed(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(DiscoveryError::RequestFailed(format!(
                "{} returned {}: {}",
                path, status, text
            )));
        }

        resp.json::<Value>()
            .await
            .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))
    }

    async fn txn(&self, body: &Value) -> Result<bool, DiscoveryError> {
        let value = self.post("/v3/kv/txn", body).await?;
        let resp: TxnResponse = serde_json::from_value(value)
            .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;
        Ok(resp.succeeded)
    }

    fn encode(service: &ServiceSpec) -> Result<Vec<u8>, DiscoveryError> {
        serde_json::to_vec(service).map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ServiceDiscovery for EtcdDiscovery {
    async fn register_service(&self, service: &ServiceSpec) -> Result<(), DiscoveryError> {
        let key = service_key(&self.config.prefix, &service.service_name);
        let value = Self::encode(service)?;

        if !self.txn(&create_txn_body(&key, &value)).await? {
            return Err(DiscoveryError::AlreadyExists(key));
        }

        debug!("Registered {} at {}", service.service_id, key);
        Ok(())
    }

    async fn remove_service(&self, service: &ServiceSpec) {
        let key = service_key(&self.config.prefix, &service.service_name);
        if let Err(e) = self.post("/v3/kv/deleterange", &delete_body(&key)).await {
            warn!("Failed to deregister {} from discovery: {}", key, e);
        }
    }

    async fn update_service(&self, service: &ServiceSpec) -> Result<(), DiscoveryError> {
        let key = service_key(&self.config.prefix, &service.service_name);
        let value = Self::encode(service)?;

        if !self.txn(&update_txn_body(&key, &value)).await? {
            return Err(DiscoveryError::NotRegistered(key));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_key() {
        assert_eq!(
            service_key("/iothub/services/", "broker-acme"),
            "/iothub/services/broker-acme"
        );
        assert_eq!(service_key("/svc", "broker-acme"), "/svc/broker-acme");
    }

    #[test]
    fn test_create_txn_body_is_create_only() {
        let body = create_txn_body("/svc/broker-acme", b"{}");
        let compare = &body["compare"][0];
        assert_eq!(compare["target"], "CREATE");
        assert_eq!(compare["result"], "EQUAL");
        assert_eq!(compare["create_revision"], "0");
        assert_eq!(compare["key"], STANDARD.encode("/svc/broker-acme"));
        assert_eq!(
            body["success"][0]["request_put"]["value"],
            STANDARD.encode("{}")
        );
    }

    #[test]
    fn test_update_txn_requires_existing_key() {
        let body = update_txn_body("/svc/broker-acme", b"{}");
        assert_eq!(body["compare"][0]["result"], "GREATER");
    }

    #[test]
    fn test_delete_body_encodes_key() {
        let body = delete_body("/svc/broker-acme");
        assert_eq!(body["key"], STANDARD.encode("/svc/broker-acme"));
    }

    #[test]
    fn test_txn_response_defaults_to_failure() {
        let resp: TxnResponse = serde_json::from_str(r#"{"header": {}}"#).unwrap();
        assert!(!resp.succeeded);
    }

    #[test]
    fn test_config_defaults() {
        let config: EtcdConfig = serde_yaml::from_str("endpoint: http://etcd:2379").unwrap();
        assert_eq!(config.prefix, "/iothub/services");
        assert_eq!(config.timeout_secs, 10);
    }
}
