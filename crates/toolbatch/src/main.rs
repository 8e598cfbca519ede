//! Run one batch from the command line.
//!
//! # Usage
//!
//! ```bash
//! cargo run -p toolbatch -- --input batch.json
//! echo '{"trajectory_ids":["t0"],"actions":["{\"a\":1,\"b\":2}"],"extra_fields":[{"tool":"math.add"}]}' \
//!     | cargo run -p toolbatch
//! RUST_LOG=debug cargo run -p toolbatch -- --input batch.json --no-cache
//! ```
//!
//! The response JSON goes to stdout; trace and cache metadata go to stderr.
//! Heavy tools run in child processes of this same binary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use toolbatch::cli::{SchedulerArgs, init_tracing, read_request};
use toolbatch::prelude::*;
use toolbatch::worker;

/// Batch tool-execution scheduler.
#[derive(Parser)]
#[command(name = "toolbatch", about = "Execute a batch of tool actions")]
struct Cli {
    /// Batch request JSON file. Reads stdin when omitted.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Pretty-print the response.
    #[arg(long)]
    pretty: bool,

    #[command(flatten)]
    scheduler: SchedulerArgs,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing("info");

    let registry = ToolRegistry::new()
        .with_arg_validation(cli.scheduler.arg_validation)
        .with_builtin_tools();
    if cli.scheduler.worker {
        return match worker::serve(&registry) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Error: {e}");
                ExitCode::FAILURE
            }
        };
    }

    let request = match read_request(cli.input.as_deref()) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let service = BatchService::from_registry(Arc::new(registry), cli.scheduler.to_config());

    let result = service.execute(request).await;
    service.shutdown();

    let (response, meta) = match result {
        Ok(done) => done,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&response)
    } else {
        serde_json::to_string(&response)
    };
    match rendered {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("Error: failed to encode response: {e}");
            return ExitCode::FAILURE;
        }
    }

    let cache = meta.cache.header_value().unwrap_or("disabled");
    eprintln!(
        "trace_id={} cache={cache} processing_time_ms={:.2}",
        meta.trace_id, meta.processing_time_ms
    );
    ExitCode::SUCCESS
}
