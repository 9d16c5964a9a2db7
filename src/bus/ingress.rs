//! Notification ingress
//!
//! HTTP front door onto the message bus:
//! - `POST /v1/topics/{topic}`: validate a payload against its topic and publish it
//! - `GET /v1/status`: tenant/product/service counts
//! - `GET /health`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::{MessageBus, Notification, Topic};
use crate::hub::{HubService, HubStats};

/// Upper bound on in-flight ingress requests
const MAX_CONCURRENT_REQUESTS: usize = 256;

#[derive(Clone)]
pub struct IngressState {
    pub bus: Arc<MessageBus>,
    pub hub: Arc<HubService>,
}

impl IngressState {
    pub fn new(bus: Arc<MessageBus>, hub: Arc<HubService>) -> Self {
        Self { bus, hub }
    }
}

pub fn create_ingress_router(state: IngressState) -> Router {
    Router::new()
        .route("/v1/status", get(status))
        .route("/v1/topics/{topic}", post(publish))
        .route("/health", get(health_check))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_REQUESTS))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the ingress until the shutdown signal flips
pub async fn serve(
    addr: SocketAddr,
    state: IngressState,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Notification ingress listening on {}", listener.local_addr()?);

    axum::serve(listener, create_ingress_router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
}

#[derive(Serialize)]
struct PublishResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    delivered: Option<usize>,
}

impl PublishResponse {
    fn accepted(topic: Topic, delivered: usize) -> Self {
        Self {
            success: true,
            message: format!("Published on {}", topic),
            delivered: Some(delivered),
        }
    }

    fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            delivered: None,
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    backend: String,
    stats: HubStats,
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

async fn status(State(state): State<IngressState>) -> impl IntoResponse {
    Json(StatusResponse {
        status: "ok".to_string(),
        backend: state.hub.backend_name().to_string(),
        stats: state.hub.stats().await,
    })
}

async fn publish(
    State(state): State<IngressState>,
    Path(topic): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let topic: Topic = match topic.parse() {
        Ok(topic) => topic,
        Err(e) => {
            return (
                StatusCode::NOT_FOUND,
                Json(PublishResponse::rejected(e.to_string())),
            )
        }
    };

    if let Err(e) = Notification::decode(topic, &body) {
        warn!("Rejected notification: {}", e);
        return (
            StatusCode::BAD_REQUEST,
            Json(PublishResponse::rejected(e.to_string())),
        );
    }

    let delivered = state.bus.publish(topic, body.to_vec());
    (
        StatusCode::ACCEPTED,
        Json(PublishResponse::accepted(topic, delivered)),
    )
}
