//! Axum server setup and router construction.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use toolbatch::service::BatchService;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::api::{self, AppState};

/// Build the full axum router.
///
/// The tool routes are mounted twice: under `/v1/sdk/tools` and under the
/// legacy `/v1/tools` prefix.
pub fn build_router(service: Arc<BatchService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let tools: Router<AppState> = Router::new()
        .route("/get_observation", post(api::get_observation))
        .route("/health", get(api::health))
        .route("/metrics", get(api::metrics))
        .route("/config", get(api::config));

    Router::new()
        .nest("/v1/sdk/tools", tools.clone())
        .nest("/v1/tools", tools)
        .with_state(AppState { service })
        .layer(cors)
}

/// Bind `bind_addr`, serve `router` on a background task, and return the
/// bound address.
pub async fn start_server(router: Router, bind_addr: SocketAddr) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("Server on {addr} stopped: {e}");
        }
    });

    Ok(addr)
}
