//! Notification bus
//!
//! Platform components announce tenant and product lifecycle changes as JSON
//! payloads on two topics. The in-process [`MessageBus`] fans a published
//! payload out to every subscriber of its topic; the hub dispatcher is the
//! main subscriber.

pub mod ingress;

pub use ingress::{create_ingress_router, serve, IngressState};

use std::fmt;
use std::str::FromStr;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Errors that can occur while decoding or publishing notifications
#[derive(Error, Debug)]
pub enum NotificationError {
    #[error("Unknown topic '{0}'")]
    UnknownTopic(String),

    #[error("Malformed {topic} notification: {reason}")]
    Decode { topic: Topic, reason: String },

    #[error("Failed to encode notification: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Tenant,
    Product,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::Tenant, Topic::Product];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Tenant => "tenant",
            Topic::Product => "product",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = NotificationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tenant" | "tenants" => Ok(Topic::Tenant),
            "product" | "products" => Ok(Topic::Product),
            _ => Err(NotificationError::UnknownTopic(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[serde(alias = "create", alias = "Register", alias = "Create")]
    Register,
    #[serde(alias = "remove", alias = "Unregister", alias = "Remove")]
    Unregister,
}

/// Payload of the tenant topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantNotification {
    #[serde(alias = "Action")]
    pub action: Action,
    #[serde(alias = "TenantId")]
    pub tenant_id: String,
}

/// Payload of the product topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductNotification {
    #[serde(alias = "Action")]
    pub action: Action,
    #[serde(alias = "TenantId")]
    pub tenant_id: String,
    #[serde(alias = "ProductId")]
    pub product_id: String,
    /// Broker replicas to start with when this product creates the service
    #[serde(default = "default_replicas", alias = "Replicas")]
    pub replicas: u32,
}

fn default_replicas() -> u32 {
    1
}

/// A payload type bound to one topic
pub trait TopicMessage: DeserializeOwned + Serialize + Send + 'static {
    const TOPIC: Topic;

    fn decode(payload: &[u8]) -> Result<Self, NotificationError> {
        serde_json::from_slice(payload).map_err(|e| NotificationError::Decode {
            topic: Self::TOPIC,
            reason: e.to_string(),
        })
    }
}

impl TopicMessage for TenantNotification {
    const TOPIC: Topic = Topic::Tenant;
}

impl TopicMessage for ProductNotification {
    const TOPIC: Topic = Topic::Product;
}

/// Any notification, decoded according to the topic it arrived on
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Tenant(TenantNotification),
    Product(ProductNotification),
}

impl Notification {
    pub fn decode(topic: Topic, payload: &[u8]) -> Result<Self, NotificationError> {
        match topic {
            Topic::Tenant => TenantNotification::decode(payload).map(Notification::Tenant),
            Topic::Product => ProductNotification::decode(payload).map(Notification::Product),
        }
    }

    pub fn topic(&self) -> Topic {
        match self {
            Notification::Tenant(_) => Topic::Tenant,
            Notification::Product(_) => Topic::Product,
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, NotificationError> {
        match self {
            Notification::Tenant(n) => serde_json::to_vec(n),
            Notification::Product(n) => serde_json::to_vec(n),
        }
        .map_err(|e| NotificationError::Encode(e.to_string()))
    }
}

/// In-process publish/subscribe, one subscriber list per topic
#[derive(Default)]
pub struct MessageBus {
    subscribers: DashMap<Topic, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: Topic) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.entry(topic).or_default().push(tx);
        rx
    }

    /// Deliver a raw payload; returns the number of live subscribers reached
    pub fn publish(&self, topic: Topic, payload: Vec<u8>) -> usize {
        let Some(mut subscribers) = self.subscribers.get_mut(&topic) else {
            debug!("No subscribers on {}, dropping message", topic);
            return 0;
        };
        subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        subscribers.len()
    }

    pub fn publish_notification(&self, notification: &Notification) -> Result<usize, NotificationError> {
        Ok(self.publish(notification.topic(), notification.to_payload()?))
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers.get(&topic).map(|s| s.len()).unwrap_or(0)
    }
}
