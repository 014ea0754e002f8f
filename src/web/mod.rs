use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use salvo::catch_panic::CatchPanic;
use salvo::prelude::*;
use salvo::request_id::RequestId;
use salvo::server::ServerHandle;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::BridgeCore;
use crate::config::BridgeConfig;
use crate::db::DatabaseManager;

pub mod handlers;
pub mod metrics;
pub mod middleware;

use self::handlers::{
    HealthHandler, ListMembersHandler, ListRoomsHandler, MetricsHandler, ReadyHandler,
    WebhookHandler,
};
use self::metrics::BridgeMetrics;
use self::middleware::{expose_request_id, webhook_rate_limiter};

/// Everything the HTTP handlers need, passed in at construction.
#[derive(Clone)]
pub struct WebState {
    pub bridge: Arc<BridgeCore>,
    pub db: DatabaseManager,
    pub metrics: Arc<BridgeMetrics>,
    pub max_body_bytes: usize,
    /// Per-client webhook allowance and its refill window.
    pub webhook_rate_limit: Option<(usize, Duration)>,
}

pub fn create_router(state: WebState) -> Router {
    let webhook = WebhookHandler::new(state.bridge, state.max_body_bytes);
    let mut webhooks = Router::new();
    if let Some((limit, window)) = state.webhook_rate_limit {
        webhooks = webhooks.hoop(webhook_rate_limiter(limit, window));
    }
    let webhooks = webhooks
        .push(Router::with_path("webhook").post(webhook.clone()))
        .push(Router::with_path("viber/webhook").post(webhook));

    Router::new()
        .hoop(CatchPanic::new())
        .hoop(RequestId::new())
        .hoop(expose_request_id)
        .push(webhooks)
        .push(Router::with_path("health").get(HealthHandler))
        .push(Router::with_path("ready").get(ReadyHandler::new(state.db.clone())))
        .push(Router::with_path("metrics").get(MetricsHandler::new(state.metrics, state.db.clone())))
        .push(Router::with_path("_bridge/rooms").get(ListRoomsHandler::new(state.db.clone())))
        .push(
            Router::with_path("_bridge/chats/{chat_id}/members")
                .get(ListMembersHandler::new(state.db)),
        )
}

pub struct WebServer {
    handle: ServerHandle,
    task: JoinHandle<()>,
    grace: Duration,
}

impl WebServer {
    /// Binds and starts serving in the background.
    pub async fn start(config: &BridgeConfig, router: Router) -> Result<Self> {
        let bind_addr = config.listen_address();
        let acceptor = TcpListener::new(bind_addr.clone())
            .try_bind()
            .await
            .with_context(|| format!("failed to bind http listener on {bind_addr}"))?;
        info!("web server listening on {}", bind_addr);

        let server = Server::new(acceptor);
        let handle = server.handle();
        let task = tokio::spawn(async move {
            server.serve(router).await;
        });

        Ok(Self {
            handle,
            task,
            grace: config.shutdown_grace(),
        })
    }

    /// Stops accepting connections and waits for in-flight requests.
    pub async fn shutdown(self) {
        info!("stopping web server grace={}s", self.grace.as_secs());
        self.handle.stop_graceful(Some(self.grace));
        if let Err(err) = self.task.await {
            warn!("web server task ended abnormally: {err}");
        }
    }
}
