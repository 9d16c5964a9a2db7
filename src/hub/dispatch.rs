//! Notification dispatch
//!
//! Maps each bus topic to a typed handler and runs one consumer task per
//! topic, plus a supervisor that runs recovery passes when the hub asks for
//! one. All tasks stop when the shutdown signal flips.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::HubService;
use crate::bus::{Action, MessageBus, ProductNotification, TenantNotification, Topic, TopicMessage};

/// Type-erased handler for the raw payloads of one topic
pub type Handler = Arc<dyn Fn(Arc<HubService>, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A notification the hub knows how to act on
trait Handle: TopicMessage {
    fn handle(self, hub: Arc<HubService>) -> BoxFuture<'static, ()>;
}

impl Handle for TenantNotification {
    fn handle(self, hub: Arc<HubService>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let result = match self.action {
                Action::Register => hub.create_tenant(&self.tenant_id).await,
                Action::Unregister => hub.remove_tenant(&self.tenant_id).await,
            };
            if let Err(e) = result {
                error!("Tenant {:?} '{}' failed: {}", self.action, self.tenant_id, e);
            }
        })
    }
}

impl Handle for ProductNotification {
    fn handle(self, hub: Arc<HubService>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let result = match self.action {
                Action::Register => hub
                    .create_product(&self.tenant_id, &self.product_id, self.replicas)
                    .await
                    .map(|service_id| {
                        debug!("Product '{}' served by {}", self.product_id, service_id);
                    }),
                Action::Unregister => hub.remove_product(&self.tenant_id, &self.product_id).await,
            };
            if let Err(e) = result {
                error!(
                    "Product {:?} '{}/{}' failed: {}",
                    self.action, self.tenant_id, self.product_id, e
                );
            }
        })
    }
}

fn route<M: Handle>() -> (Topic, Handler) {
    let handler: Handler = Arc::new(
        |hub: Arc<HubService>, payload: Vec<u8>| -> BoxFuture<'static, ()> {
            match M::decode(&payload) {
                Ok(message) => message.handle(hub),
                Err(e) => {
                    warn!("Dropping notification: {}", e);
                    Box::pin(async {})
                }
            }
        },
    );
    (M::TOPIC, handler)
}

/// Topic → handler table
pub fn routes() -> HashMap<Topic, Handler> {
    [route::<TenantNotification>(), route::<ProductNotification>()]
        .into_iter()
        .collect()
}

pub struct Dispatcher {
    hub: Arc<HubService>,
    bus: Arc<MessageBus>,
    routes: HashMap<Topic, Handler>,
}

impl Dispatcher {
    pub fn new(hub: Arc<HubService>, bus: Arc<MessageBus>) -> Self {
        Self {
            hub,
            bus,
            routes: routes(),
        }
    }

    /// Subscribe to every routed topic and spawn the consumer and supervisor
    /// tasks.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.routes.len() + 1);

        for (topic, handler) in self.routes {
            let rx = self.bus.subscribe(topic);
            handles.push(tokio::spawn(consume(
                topic,
                rx,
                handler,
                self.hub.clone(),
                shutdown.clone(),
            )));
        }
        handles.push(tokio::spawn(supervise(self.hub, shutdown)));

        handles
    }
}

async fn consume(
    topic: Topic,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    handler: Handler,
    hub: Arc<HubService>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Consuming {} notifications", topic);
    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(payload) => handler(hub.clone(), payload).await,
                None => {
                    debug!("{} topic closed", topic);
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("{} consumer shutting down", topic);
                    break;
                }
            }
        }
    }
}

async fn supervise(hub: Arc<HubService>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = hub.recovery_requested() => {
                let report = hub.recover().await;
                for failure in &report.failures {
                    error!(
                        "Tenant '{}' left without a service: {}",
                        failure.tenant_id, failure.reason
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Hub supervisor shutting down");
                    break;
                }
            }
        }
    }
}
