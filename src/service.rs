//! Wires configuration into a running receiver: store, Graph client,
//! subscription manager, notification pipeline, and renewal scheduler.

use std::sync::Arc;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{Config, GraphMode, StoreLocation};
use crate::db::{InMemoryStore, SqliteStore, StoreError, SubscriptionStore};
use crate::graph::{
    ClientCredentialsTokenProvider, GraphSubscriptionClient, MockSubscriptionApi,
    SubscriptionApi, TokenProvider,
};
use crate::http::{self, AppState, SubscriptionDefaults};
use crate::notifications::{
    DedupCache, LifecycleProcessor, LogHandler, NotificationDispatcher, NotificationHandler,
    NotificationValidator,
};
use crate::subscriptions::{CallbackUrls, RenewalScheduler, SubscriptionManager};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

pub struct Runtime {
    config: Config,
    clock: Arc<dyn Clock>,
    store: Arc<dyn SubscriptionStore>,
    manager: Arc<SubscriptionManager>,
    scheduler: Arc<RenewalScheduler>,
}

impl Runtime {
    pub fn build(config: Config) -> Result<Self, ServiceError> {
        let store: Arc<dyn SubscriptionStore> = match &config.store {
            StoreLocation::Memory => Arc::new(InMemoryStore::new()),
            StoreLocation::File(path) => Arc::new(SqliteStore::open(path)?),
        };
        let api: Arc<dyn SubscriptionApi> = match config.graph_mode {
            GraphMode::Mock => {
                info!("using in-process mock graph api");
                Arc::new(MockSubscriptionApi::new())
            }
            GraphMode::Live => {
                let client = GraphSubscriptionClient::http_client()?;
                let tokens: Arc<dyn TokenProvider> = Arc::new(ClientCredentialsTokenProvider::new(
                    client.clone(),
                    config.credentials.clone(),
                    config.resolved_token_url().unwrap_or_default(),
                ));
                Arc::new(GraphSubscriptionClient::new(
                    client,
                    tokens,
                    config.graph_api_base.clone(),
                ))
            }
        };
        Ok(Self::from_parts(config, store, api, Arc::new(SystemClock)))
    }

    /// Assembles a runtime around caller-supplied parts. Tests use this with
    /// a mock api and a manual clock.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn SubscriptionStore>,
        api: Arc<dyn SubscriptionApi>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let callbacks = config.public_url.as_deref().map(CallbackUrls::from_base);
        let manager = Arc::new(SubscriptionManager::new(
            Arc::clone(&store),
            api,
            Arc::clone(&clock),
            config.renewal.clone(),
            callbacks,
        ));
        let scheduler = Arc::new(RenewalScheduler::new(
            Arc::clone(&manager),
            Arc::clone(&clock),
        ));
        Self {
            config,
            clock,
            store,
            manager,
            scheduler,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<SubscriptionManager> {
        &self.manager
    }

    pub fn scheduler(&self) -> &Arc<RenewalScheduler> {
        &self.scheduler
    }

    pub fn app_state(&self, handler: Arc<dyn NotificationHandler>) -> AppState {
        let validator = NotificationValidator::new(Arc::clone(&self.store), Arc::clone(&self.clock));
        let dedup = Arc::new(DedupCache::new(
            self.config.dedup.ttl,
            self.config.dedup.capacity,
        ));
        let dispatcher = NotificationDispatcher::new(
            validator.clone(),
            dedup,
            handler,
            self.config.dispatch.concurrency,
            self.config.dispatch.acquire_timeout,
            Arc::clone(&self.clock),
        );
        let lifecycle = LifecycleProcessor::new(validator, Arc::clone(&self.manager));
        AppState {
            manager: Arc::clone(&self.manager),
            dispatcher: Arc::new(dispatcher),
            lifecycle: Arc::new(lifecycle),
            defaults: Arc::new(SubscriptionDefaults {
                resource: self.config.default_resource(),
                change_type: self.config.change_type.clone(),
                ttl: self.config.subscription_ttl,
            }),
        }
    }

    pub fn router(&self, handler: Arc<dyn NotificationHandler>) -> Router {
        http::router(self.app_state(handler))
    }

    /// Ensures the configured mailbox subscription exists. Failures are logged,
    /// not fatal: the receiver still serves and the API can retry.
    pub async fn ensure_default_subscription(&self) {
        let Some(resource) = self.config.default_resource() else {
            warn!("AZURE_USER_ID not set; skipping automatic subscription");
            return;
        };
        match self
            .manager
            .ensure(&resource, &self.config.change_type, self.config.subscription_ttl)
            .await
        {
            Ok(subscription) => info!(
                id = %subscription.id,
                expires_at = %subscription.expires_at,
                "default subscription ready"
            ),
            Err(error) => warn!(resource = %resource, error = %error, "could not ensure default subscription"),
        }
    }

    pub async fn serve(self: Arc<Self>) -> Result<(), ServiceError> {
        let addr = self.config.bind;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServiceError::Bind { addr, source })?;
        if let Err(error) = self.manager.recover_interrupted_renewals() {
            warn!(error = %error, "could not release stale renewal claims");
        }
        let app = self.router(Arc::new(LogHandler));
        let scheduler = Arc::clone(&self.scheduler).spawn();

        if self.config.auto_subscribe {
            // Graph validates the callback during creation, so the listener
            // must already be accepting.
            let runtime = Arc::clone(&self);
            tokio::spawn(async move { runtime.ensure_default_subscription().await });
        }

        let served = http::serve(listener, app, shutdown_signal()).await;
        scheduler.shutdown().await;
        served.map_err(ServiceError::Serve)
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
