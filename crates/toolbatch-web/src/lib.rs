//! HTTP surface for the `toolbatch` scheduler.
//!
//! `toolbatch-web` wraps a shared [`BatchService`] in an axum router that
//! exposes batch execution plus health, metrics and config endpoints.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use toolbatch::prelude::*;
//! use toolbatch_web::{WebConfig, spawn_web};
//!
//! let registry = Arc::new(ToolRegistry::new().with_builtin_tools());
//! let service = Arc::new(BatchService::from_registry(registry, SchedulerConfig::default()));
//! let addr = spawn_web(service, WebConfig::default()).await?;
//! println!("Listening on http://{addr}");
//! ```
//!
//! # Routes
//!
//! Every route is mounted under `/v1/sdk/tools` and the legacy `/v1/tools`:
//!
//! | Method | Path | Body |
//! |--------|------|------|
//! | POST | `/get_observation` | [`BatchRequest`](toolbatch::batch::BatchRequest) in, [`BatchResponse`](toolbatch::batch::BatchResponse) out |
//! | GET | `/health` | liveness plus a config subset |
//! | GET | `/metrics` | gate, cache and pool counters |
//! | GET | `/config` | resolved scheduler configuration |

mod api;
mod server;

pub use api::{CACHE_STATUS_HEADER, PROCESSING_TIME_HEADER, TRACE_ID_HEADER};
pub use server::build_router;

use std::net::SocketAddr;
use std::sync::Arc;

use toolbatch::service::BatchService;

/// Configuration for the web server.
pub struct WebConfig {
    /// Address to bind to. Default: `127.0.0.1:8000`.
    pub bind_addr: SocketAddr,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
        }
    }
}

/// Spawn the web server on a Tokio task and return the bound address.
///
/// The server runs until the Tokio runtime shuts down. Call
/// [`BatchService::shutdown`] on the shared service to start refusing
/// batches with `503`.
pub async fn spawn_web(
    service: Arc<BatchService>,
    config: WebConfig,
) -> std::io::Result<SocketAddr> {
    let router = server::build_router(service);
    server::start_server(router, config.bind_addr).await
}
