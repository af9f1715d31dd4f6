pub mod api;
pub mod error;
pub mod webhook;

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use chrono::Duration;
use tokio::net::TcpListener;
use tracing::info;

use crate::db::models::ChangeType;
use crate::notifications::{LifecycleProcessor, NotificationDispatcher};
use crate::subscriptions::manager::{LIFECYCLE_PATH, NOTIFY_PATH};
use crate::subscriptions::SubscriptionManager;

#[derive(Debug, Clone)]
pub struct SubscriptionDefaults {
    pub resource: Option<String>,
    pub change_type: ChangeType,
    pub ttl: Duration,
}

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SubscriptionManager>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub lifecycle: Arc<LifecycleProcessor>,
    pub defaults: Arc<SubscriptionDefaults>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            NOTIFY_PATH,
            get(webhook::notify_validation).post(webhook::notify),
        )
        .route(
            LIFECYCLE_PATH,
            get(webhook::notify_validation).post(webhook::lifecycle),
        )
        .route("/healthz", get(webhook::healthz))
        .route(
            "/api/subscriptions",
            get(api::list_subscriptions).post(api::create_subscription),
        )
        .route(
            "/api/subscriptions/{id}",
            get(api::get_subscription).delete(api::retire_subscription),
        )
        .route("/api/subscriptions/{id}/renew", post(api::renew_subscription))
        .with_state(state)
}

pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "notification receiver listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}
