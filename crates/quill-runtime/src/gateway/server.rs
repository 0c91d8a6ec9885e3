use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use quill_core::config::WebhookConfig;

use super::auth::{auth_middleware, BrokerAuth};
use super::tracing::tracing_middleware;
use super::webhook::{advance, cancel_run, discover, get_run, ingest, WebhookState};
use crate::jobs::{Dispatcher, Executor, FunctionRegistry};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// HTTP server exposing the webhook endpoint.
pub struct WebhookServer {
    config: WebhookConfig,
    state: Arc<WebhookState>,
}

impl WebhookServer {
    pub fn new(
        config: WebhookConfig,
        app: impl Into<String>,
        registry: Arc<FunctionRegistry>,
        dispatcher: Arc<Dispatcher>,
        executor: Arc<Executor>,
    ) -> Self {
        let state = Arc::new(WebhookState {
            app: app.into(),
            registry,
            dispatcher,
            executor,
            ingest_timeout: Duration::from_secs(config.request_timeout_secs),
        });
        Self { config, state }
    }

    /// Build the router.
    ///
    /// `/health` is open; the webhook routes require a broker token when a
    /// signing key is configured.
    pub fn router(&self) -> Router {
        let path = normalize_path(&self.config.path);
        let auth = Arc::new(BrokerAuth::new(self.config.signing_key.as_deref()));

        let webhook = Router::new()
            .route(&path, get(discover).post(ingest).put(advance))
            .route(&format!("{path}/runs/{{id}}"), get(get_run))
            .route(&format!("{path}/runs/{{id}}/cancel"), post(cancel_run))
            .route_layer(middleware::from_fn_with_state(auth, auth_middleware))
            .with_state(self.state.clone());

        Router::new()
            .route("/health", get(health_handler))
            .merge(webhook)
            .layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn(tracing_middleware))
                    .layer(TraceLayer::new_for_http()),
            )
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.config.port))
    }

    /// Serve until the token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        let addr = self.addr();
        let router = self.router();
        let listener = tokio::net::TcpListener::bind(addr).await?;

        tracing::info!(%addr, path = %self.config.path, "Webhook server listening");
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
