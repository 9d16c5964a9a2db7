//! Tenant, product and service resources
//!
//! A Tenant is the top-level account. It owns zero or more Products and, while
//! at least one Product exists, exactly one broker service running on the
//! active cluster backend.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Lifecycle state of a tenant's broker service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    /// No service exists (tenant has no products)
    #[default]
    None,
    /// The service was created and is expected to be running
    Started,
    /// The service is known to be missing on the backend
    Stopped,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::None => write!(f, "None"),
            ServiceState::Started => write!(f, "Started"),
            ServiceState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// A logical device fleet belonging to a tenant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub product_id: String,
    pub created_at: DateTime<Utc>,
}

impl Product {
    pub fn new(product_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// A platform tenant and the service fronting its products
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub tenant_id: String,

    #[serde(default)]
    pub products: HashMap<String, Product>,

    /// Backend identifier of the broker service, empty when none exists
    #[serde(default)]
    pub service_id: String,

    #[serde(default)]
    pub service_name: String,

    #[serde(default)]
    pub service_state: ServiceState,

    /// Desired replica count for the broker service
    #[serde(default)]
    pub instance_replicas: u32,

    #[serde(default)]
    pub network_id: String,

    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            products: HashMap::new(),
            service_id: String::new(),
            service_name: String::new(),
            service_state: ServiceState::None,
            instance_replicas: 0,
            network_id: String::new(),
            created_at: Utc::now(),
        }
    }

    pub fn has_service(&self) -> bool {
        self.service_state != ServiceState::None
    }

    /// Snapshot of the service-related fields for persistence
    pub fn service_record(&self) -> ServiceRecord {
        ServiceRecord {
            service_id: self.service_id.clone(),
            service_name: self.service_name.clone(),
            service_state: self.service_state,
            instance_replicas: self.instance_replicas,
            network_id: self.network_id.clone(),
        }
    }

    pub fn apply_service_record(&mut self, record: &ServiceRecord) {
        self.service_id = record.service_id.clone();
        self.service_name = record.service_name.clone();
        self.service_state = record.service_state;
        self.instance_replicas = record.instance_replicas;
        self.network_id = record.network_id.clone();
    }

    /// Forget the service (state `None`, identity cleared)
    pub fn clear_service(&mut self) {
        self.service_id.clear();
        self.service_name.clear();
        self.service_state = ServiceState::None;
    }

    /// `service_state == None` iff there are no products iff `service_id` is empty.
    ///
    /// A `Stopped` tenant keeps its products and may keep the id of the
    /// service it could not verify.
    pub fn is_consistent(&self) -> bool {
        match self.service_state {
            ServiceState::None => self.products.is_empty() && self.service_id.is_empty(),
            ServiceState::Started => !self.products.is_empty() && !self.service_id.is_empty(),
            ServiceState::Stopped => !self.products.is_empty(),
        }
    }
}

/// Service-related tenant fields as persisted by the state store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub service_id: String,
    pub service_name: String,
    pub service_state: ServiceState,
    pub instance_replicas: u32,
    pub network_id: String,
}

/// A reachable address of a deployed service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub virtual_ip: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(virtual_ip: impl Into<String>, port: u16) -> Self {
        Self {
            virtual_ip: virtual_ip.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.virtual_ip, self.port)
    }
}

/// Backend-observed description of a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub service_name: String,
    pub service_id: String,
    pub service_state: ServiceState,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub ready_replicas: u32,
}

impl ServiceSpec {
    pub fn new(service_name: impl Into<String>, service_id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_id: service_id.into(),
            service_state: ServiceState::Started,
            endpoints: Vec::new(),
            replicas: 0,
            ready_replicas: 0,
        }
    }
}

/// Name of the broker service fronting a tenant.
///
/// Every backend derives resource names from this so discovery paths stay stable
/// across backends.
pub fn service_name_for(tenant_id: &str) -> String {
    format!("broker-{}", tenant_id)
}

/// Check that an id can be embedded in backend resource names
pub fn is_valid_id(id: &str) -> bool {
    static ID_RE: OnceLock<Regex> = OnceLock::new();
    let re = ID_RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static id pattern")
    });
    id.len() <= 63 && re.is_match(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_tenant_has_no_service() {
        let tenant = Tenant::new("acme");
        assert_eq!(tenant.service_state, ServiceState::None);
        assert!(tenant.products.is_empty());
        assert!(tenant.service_id.is_empty());
        assert!(tenant.is_consistent());
    }

    #[test]
    fn test_consistency_detects_orphan_service() {
        let mut tenant = Tenant::new("acme");
        tenant.service_id = "svc-1".to_string();
        tenant.service_state = ServiceState::Started;
        assert!(!tenant.is_consistent());

        tenant
            .products
            .insert("sensors".to_string(), Product::new("sensors"));
        assert!(tenant.is_consistent());

        tenant.clear_service();
        assert!(!tenant.is_consistent());
    }

    #[test]
    fn test_service_record_roundtrip_on_tenant() {
        let mut tenant = Tenant::new("acme");
        let record = ServiceRecord {
            service_id: "svc-1".to_string(),
            service_name: service_name_for("acme"),
            service_state: ServiceState::Started,
            instance_replicas: 3,
            network_id: "net-1".to_string(),
        };
        tenant.apply_service_record(&record);
        assert_eq!(tenant.service_record(), record);
    }

    #[test]
    fn test_tenant_deserializes_with_defaults() {
        let json = r#"{"tenantId": "acme", "createdAt": "2024-01-01T00:00:00Z"}"#;
        let tenant: Tenant = serde_json::from_str(json).unwrap();
        assert_eq!(tenant.tenant_id, "acme");
        assert_eq!(tenant.service_state, ServiceState::None);
        assert!(tenant.products.is_empty());
    }

    #[test]
    fn test_valid_ids() {
        assert!(is_valid_id("acme"));
        assert!(is_valid_id("sensor-fleet-2"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("-acme"));
        assert!(!is_valid_id("Acme"));
        assert!(!is_valid_id("acme_corp"));
        assert!(!is_valid_id(&"a".repeat(64)));
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("10.0.0.5", 1883).to_string(), "10.0.0.5:1883");
    }
}
