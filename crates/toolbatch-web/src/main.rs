//! Batch scheduler HTTP server.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p toolbatch-web
//! cargo run -p toolbatch-web -- --port 9000 --max-concurrent-requests 16
//! RUST_LOG=toolbatch=debug cargo run -p toolbatch-web -- --no-cache
//! ```
//!
//! Then submit a batch:
//!
//! ```bash
//! curl -s localhost:8000/v1/sdk/tools/get_observation \
//!     -H 'content-type: application/json' \
//!     -d '{"trajectory_ids":["t0"],"actions":["{\"a\":1,\"b\":2}"],"extra_fields":[{"tool":"math.add"}]}'
//! ```

use std::net::IpAddr;
use std::sync::Arc;

use clap::Parser;
use toolbatch::cli::{SchedulerArgs, init_tracing};
use toolbatch::prelude::*;
use toolbatch::worker;
use toolbatch_web::{WebConfig, spawn_web};
use tracing::info;

/// Batch scheduler HTTP server.
#[derive(Parser)]
#[command(name = "toolbatch-web", about = "Serve the batch tool scheduler over HTTP")]
struct Args {
    /// Address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on.
    #[arg(long, default_value_t = 8000)]
    port: u16,

    #[command(flatten)]
    scheduler: SchedulerArgs,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let args = Args::parse();
    init_tracing("info");

    let registry = ToolRegistry::new()
        .with_arg_validation(args.scheduler.arg_validation)
        .with_builtin_tools();
    if args.scheduler.worker {
        return worker::serve(&registry);
    }
    let service = Arc::new(BatchService::from_registry(
        Arc::new(registry),
        args.scheduler.to_config(),
    ));

    let config = WebConfig {
        bind_addr: (args.host, args.port).into(),
    };
    let addr = spawn_web(service.clone(), config)
        .await
        .map_err(|e| format!("failed to bind {}:{}: {e}", args.host, args.port))?;
    info!("Listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for shutdown signal: {e}"))?;
    service.shutdown();
    Ok(())
}
