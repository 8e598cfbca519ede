//! Configuration for the batch scheduler.
//!
//! All settings have working defaults. Override them through
//! [`SchedulerConfig`] struct fields or the `with_*()` builder methods.
//!
//! ```ignore
//! let config = SchedulerConfig::default()
//!     .with_max_concurrent_requests(32)
//!     .with_request_timeout(Duration::from_secs(10))
//!     .with_cache(CacheConfig::disabled());
//! ```
//!
//! Pool sizes left as `None` are derived from the host CPU count by the
//! `resolved_*` methods.
//!
//! Heavy tools run in worker processes. Unless [`SchedulerConfig::worker`]
//! says otherwise, the worker is the running executable started with
//! [`WORKER_FLAG`](crate::worker::WORKER_FLAG), so a binary that embeds the
//! scheduler must hand that flag to [`worker::serve`](crate::worker::serve).

use std::time::Duration;

use crate::worker::WorkerCommand;

/// Slug keywords that route a blocking handler to the heavy lane.
pub const DEFAULT_HEAVY_KEYWORDS: &[&str] = &[
    "image_processing",
    "ml_inference",
    "data_analysis",
    "geospatial_compute",
    "statistical_compute",
];

/// Default number of unspecified actions classified per parse job.
pub const DEFAULT_PARSE_CHUNK_SIZE: usize = 50;

// ── Cache config ──────────────────────────────────────────────────

/// Configuration for the whole-batch result cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Whether request hashing and result caching are enabled.
    pub enabled: bool,
    /// Number of entries above which `store` starts evicting.
    pub max_entries: usize,
    /// Time-to-live for each stored response.
    pub ttl: Duration,
    /// Extra entries removed below `max_entries` when capacity eviction runs,
    /// so that a burst of stores does not evict on every call.
    pub evict_slack: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_entries: 1000,
            ttl: Duration::from_secs(3600),
            evict_slack: 100,
        }
    }
}

impl CacheConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

// ── Scheduler config ──────────────────────────────────────────────

/// Configuration for a [`BatchService`](crate::service::BatchService) and the
/// [`ToolManager`](crate::manager::ToolManager) it drives.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of batches executing at once. Default: `100`.
    pub max_concurrent_requests: usize,
    /// Deadline for the grouping-through-aggregation pipeline. Default: 30s.
    pub request_timeout: Duration,
    /// Worker threads for light blocking handlers. `None` derives from CPUs.
    pub thread_pool_size: Option<usize>,
    /// Worker processes for heavy (CPU-bound) handlers. `None` derives from
    /// CPUs.
    pub process_pool_size: Option<usize>,
    /// Command that starts a worker process. `None` re-runs the current
    /// executable in worker mode.
    pub worker: Option<WorkerCommand>,
    /// Workers for chunked tool detection. `None` derives from CPUs.
    pub parse_pool_size: Option<usize>,
    /// Unspecified actions per detection chunk. Default: `50`.
    pub parse_chunk_size: usize,
    /// Slug keywords that promote a light blocking handler to the heavy lane.
    pub heavy_keywords: Vec<String>,
    /// Run a cooperative group's actions concurrently instead of one at a
    /// time. Default: `false` (sequential, in index order).
    pub concurrent_within_group: bool,
    /// Whole-batch result cache.
    pub cache: CacheConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 100,
            request_timeout: Duration::from_secs(30),
            thread_pool_size: None,
            process_pool_size: None,
            worker: None,
            parse_pool_size: None,
            parse_chunk_size: DEFAULT_PARSE_CHUNK_SIZE,
            heavy_keywords: DEFAULT_HEAVY_KEYWORDS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            concurrent_within_group: false,
            cache: CacheConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_thread_pool_size(mut self, size: usize) -> Self {
        self.thread_pool_size = Some(size);
        self
    }

    pub fn with_process_pool_size(mut self, size: usize) -> Self {
        self.process_pool_size = Some(size);
        self
    }

    pub fn with_worker(mut self, command: WorkerCommand) -> Self {
        self.worker = Some(command);
        self
    }

    pub fn with_parse_pool_size(mut self, size: usize) -> Self {
        self.parse_pool_size = Some(size);
        self
    }

    pub fn with_parse_chunk_size(mut self, size: usize) -> Self {
        self.parse_chunk_size = size;
        self
    }

    /// Replace the heavy-lane keyword set.
    pub fn with_heavy_keywords(mut self, keywords: Vec<String>) -> Self {
        self.heavy_keywords = keywords;
        self
    }

    pub fn with_concurrent_within_group(mut self, enabled: bool) -> Self {
        self.concurrent_within_group = enabled;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Light blocking pool size: explicit, or `min(32, cpus + 4)`.
    pub fn resolved_thread_pool(&self) -> usize {
        self.thread_pool_size
            .unwrap_or_else(|| (cpu_count() + 4).min(32))
            .max(1)
    }

    /// Heavy pool size: explicit, or `min(8, max(1, cpus / 4))`.
    pub fn resolved_process_pool(&self) -> usize {
        self.process_pool_size
            .unwrap_or_else(|| (cpu_count() / 4).clamp(1, 8))
            .max(1)
    }

    /// Worker command: explicit, or the current executable with `--worker`.
    pub fn resolved_worker(&self) -> Option<WorkerCommand> {
        self.worker.clone().or_else(WorkerCommand::current_exe)
    }

    /// Detection pool size: explicit, or `min(16, max(4, cpus / 2))`.
    pub fn resolved_parse_pool(&self) -> usize {
        self.parse_pool_size
            .unwrap_or_else(|| (cpu_count() / 2).clamp(4, 16))
            .max(1)
    }

    /// Chunk size, never zero.
    pub fn resolved_chunk_size(&self) -> usize {
        self.parse_chunk_size.max(1)
    }
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
