//! Command-line plumbing shared by the `toolbatch` and `toolbatch-web`
//! binaries: scheduler flags, worker mode and tracing setup.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use clap::Args;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::batch::BatchRequest;
use crate::config::{CacheConfig, DEFAULT_PARSE_CHUNK_SIZE, SchedulerConfig};
use crate::worker::WorkerCommand;

/// Scheduler tuning flags.
#[derive(Debug, Clone, Args)]
pub struct SchedulerArgs {
    /// Maximum batches executing at once.
    #[arg(long, default_value_t = 100)]
    pub max_concurrent_requests: usize,

    /// Per-batch deadline in seconds.
    #[arg(long, default_value = "30", value_parser = parse_seconds)]
    pub request_timeout: Duration,

    /// Light blocking workers (default: min(32, cpus + 4)).
    #[arg(long)]
    pub thread_pool_size: Option<usize>,

    /// Heavy workers (default: min(8, max(1, cpus / 4))).
    #[arg(long)]
    pub process_pool_size: Option<usize>,

    /// Tool detection workers (default: min(16, max(4, cpus / 2))).
    #[arg(long)]
    pub parse_pool_size: Option<usize>,

    /// Unspecified actions per detection chunk.
    #[arg(long, default_value_t = DEFAULT_PARSE_CHUNK_SIZE)]
    pub parse_chunk_size: usize,

    /// Slug keyword routing blocking tools to the heavy lane. Repeatable;
    /// replaces the default set.
    #[arg(long = "heavy-keyword")]
    pub heavy_keywords: Vec<String>,

    /// Run a cooperative tool's actions concurrently within its group.
    #[arg(long)]
    pub concurrent_within_group: bool,

    /// Disable whole-batch result caching.
    #[arg(long)]
    pub no_cache: bool,

    /// Cache capacity before eviction.
    #[arg(long, default_value_t = 1000)]
    pub cache_max_entries: usize,

    /// Cache entry time-to-live in seconds.
    #[arg(long, default_value_t = 3600)]
    pub cache_ttl: u64,

    /// Validate tool arguments against their JSON Schema.
    #[arg(long)]
    pub arg_validation: bool,

    /// Serve one heavy-lane job on stdin/stdout and exit.
    #[arg(long, hide = true)]
    pub worker: bool,
}

impl SchedulerArgs {
    pub fn to_config(&self) -> SchedulerConfig {
        let defaults = CacheConfig::default();
        let cache = CacheConfig {
            enabled: !self.no_cache,
            max_entries: self.cache_max_entries,
            ttl: Duration::from_secs(self.cache_ttl),
            ..defaults
        };
        let mut config = SchedulerConfig::default()
            .with_max_concurrent_requests(self.max_concurrent_requests)
            .with_request_timeout(self.request_timeout)
            .with_parse_chunk_size(self.parse_chunk_size)
            .with_concurrent_within_group(self.concurrent_within_group)
            .with_cache(cache);
        config.thread_pool_size = self.thread_pool_size;
        config.process_pool_size = self.process_pool_size;
        config.parse_pool_size = self.parse_pool_size;
        if !self.heavy_keywords.is_empty() {
            config = config.with_heavy_keywords(self.heavy_keywords.clone());
        }
        // Workers rebuild the registry themselves and must validate the same way.
        if self.arg_validation
            && let Some(command) = WorkerCommand::current_exe()
        {
            config = config.with_worker(command.with_arg("--arg-validation"));
        }
        config
    }
}

/// Parse a positive, finite number of seconds.
fn parse_seconds(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{raw}' is not a number of seconds"))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err("must be a positive number of seconds".to_string());
    }
    Duration::try_from_secs_f64(secs).map_err(|e| format!("'{raw}' is out of range: {e}"))
}

/// Install the global subscriber: `fmt` to stderr, filtered by `RUST_LOG`
/// (falling back to `default_filter`).
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Read a batch request from `path`, or from stdin when `None`.
pub fn read_request(path: Option<&Path>) -> Result<BatchRequest, String> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read {}: {e}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .map_err(|e| format!("failed to read stdin: {e}"))?;
            buf
        }
    };
    serde_json::from_str(&raw).map_err(|e| format!("invalid batch request: {e}"))
}
