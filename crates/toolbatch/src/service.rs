//! The batch service: validation, caching, admission and deadline around
//! a [`ToolManager`].
//!
//! ```ignore
//! let registry = Arc::new(ToolRegistry::new().with_builtin_tools());
//! let service = BatchService::from_registry(registry, SchedulerConfig::default());
//! let (response, meta) = service.execute(request).await?;
//! ```

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::batch::{BatchRequest, BatchResponse};
use crate::cache::{BatchCache, CacheStats, cache_key};
use crate::config::SchedulerConfig;
use crate::connection::ConnectionResolver;
use crate::error::BatchError;
use crate::gate::{ConcurrencyGate, GateStats};
use crate::manager::{ManagerStats, ToolManager};
use crate::registry::ToolRegistry;
use crate::trace::{elapsed_ms, resolve_trace_id, unix_timestamp};

/// Whether a response came from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Caching is turned off; no lookup happened.
    Disabled,
}

impl CacheStatus {
    /// Value for the `X-Cache-Status` header, if one should be sent.
    pub fn header_value(self) -> Option<&'static str> {
        match self {
            CacheStatus::Hit => Some("hit"),
            CacheStatus::Miss => Some("miss"),
            CacheStatus::Disabled => None,
        }
    }
}

/// Out-of-band facts about a response, surfaced as transport headers.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseMeta {
    pub trace_id: String,
    pub cache: CacheStatus,
    pub processing_time_ms: f64,
}

// ── Status snapshots ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct HealthConfig {
    pub max_concurrent_requests: usize,
    /// Seconds.
    pub request_timeout: f64,
    pub hash_requests: bool,
    pub cache_max_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub timestamp: f64,
    pub config: HealthConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub timestamp: f64,
    pub concurrency: GateStats,
    pub cache: CacheStats,
    pub pools: ManagerStats,
}

/// The resolved configuration, as reported by the config endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSnapshot {
    pub max_concurrent_requests: usize,
    /// Seconds.
    pub request_timeout: f64,
    pub thread_pool_size: usize,
    pub process_pool_size: usize,
    pub parse_pool_size: usize,
    pub parse_chunk_size: usize,
    pub heavy_keywords: Vec<String>,
    pub concurrent_within_group: bool,
    pub hash_requests: bool,
    /// Seconds.
    pub cache_ttl: f64,
    pub cache_max_size: usize,
}

// ── BatchService ──────────────────────────────────────────────────

/// Executes batch requests with caching and admission control.
#[derive(Debug)]
pub struct BatchService {
    manager: ToolManager,
    cache: BatchCache,
    gate: ConcurrencyGate,
    config: SchedulerConfig,
}

impl BatchService {
    pub fn new(manager: ToolManager, config: SchedulerConfig) -> Self {
        Self {
            manager,
            cache: BatchCache::new(config.cache.clone()),
            gate: ConcurrencyGate::new(config.max_concurrent_requests, config.request_timeout),
            config,
        }
    }

    /// Build a service whose manager uses `registry` for handlers and
    /// toolkit discovery.
    pub fn from_registry(registry: Arc<ToolRegistry>, config: SchedulerConfig) -> Self {
        let manager = ToolManager::from_registry(registry, &config);
        Self::new(manager, config)
    }

    /// Enable connection resolution (builder pattern).
    pub fn with_resolver(mut self, resolver: Arc<dyn ConnectionResolver>) -> Self {
        self.manager = self.manager.with_resolver(resolver);
        self
    }

    pub fn manager(&self) -> &ToolManager {
        &self.manager
    }

    pub fn cache(&self) -> &BatchCache {
        &self.cache
    }

    /// Execute a batch.
    ///
    /// Identical batches within the cache TTL are answered from the cache
    /// with a fresh trace ID, before admission. Otherwise the batch waits
    /// for a concurrency slot and runs under the configured deadline.
    pub async fn execute(
        &self,
        mut request: BatchRequest,
    ) -> Result<(BatchResponse, ResponseMeta), BatchError> {
        let start = Instant::now();
        let trace_id = resolve_trace_id(request.trace_id.as_deref());

        if let Err(e) = request.validate() {
            warn!("[{trace_id}] Rejected request: {e}");
            return Err(e);
        }
        request.fill_default_extra_fields();

        info!(
            "[{trace_id}] Received batch of {} actions (user: {})",
            request.len(),
            request.user_id.as_deref().unwrap_or("-")
        );

        let key = self.cache.is_enabled().then(|| {
            cache_key(
                &request.actions,
                &request.extra_fields,
                request.user_id.as_deref(),
            )
        });

        if let Some(key) = &key
            && let Some(mut cached) = self.cache.lookup(key)
        {
            info!("[{trace_id}] Cache hit for request");
            cached.trace_id = trace_id.clone();
            let meta = ResponseMeta {
                trace_id,
                cache: CacheStatus::Hit,
                processing_time_ms: elapsed_ms(start),
            };
            return Ok((cached, meta));
        }

        let slot = self.gate.admit().await?;
        let result = self
            .gate
            .run(self.manager.process_actions(
                &request.actions,
                &request.extra_fields,
                request.user_id.as_deref(),
                &trace_id,
            ))
            .await;
        slot.release();

        let outcomes = match result {
            Ok(outcomes) => outcomes,
            Err(e) => {
                error!("[{trace_id}] {e}");
                return Err(e);
            }
        };

        let processing_time_ms = elapsed_ms(start);
        let response = BatchResponse::from_outcomes(outcomes, trace_id.clone(), processing_time_ms);

        let cache = match key {
            Some(key) => {
                self.cache.store(key, response.clone());
                CacheStatus::Miss
            }
            None => CacheStatus::Disabled,
        };

        info!(
            "[{trace_id}] Request completed in {processing_time_ms:.2}ms ({} invalid)",
            response.invalid_count()
        );
        let meta = ResponseMeta {
            trace_id,
            cache,
            processing_time_ms,
        };
        Ok((response, meta))
    }

    pub fn health(&self) -> HealthStatus {
        HealthStatus {
            status: "healthy",
            timestamp: unix_timestamp(),
            config: HealthConfig {
                max_concurrent_requests: self.config.max_concurrent_requests,
                request_timeout: self.config.request_timeout.as_secs_f64(),
                hash_requests: self.config.cache.enabled,
                cache_max_size: self.config.cache.max_entries,
            },
        }
    }

    pub fn metrics(&self) -> Metrics {
        Metrics {
            timestamp: unix_timestamp(),
            concurrency: self.gate.stats(),
            cache: self.cache.stats(),
            pools: self.manager.stats(),
        }
    }

    pub fn config(&self) -> ConfigSnapshot {
        let c = &self.config;
        ConfigSnapshot {
            max_concurrent_requests: c.max_concurrent_requests,
            request_timeout: c.request_timeout.as_secs_f64(),
            thread_pool_size: c.resolved_thread_pool(),
            process_pool_size: c.resolved_process_pool(),
            parse_pool_size: c.resolved_parse_pool(),
            parse_chunk_size: c.resolved_chunk_size(),
            heavy_keywords: c.heavy_keywords.clone(),
            concurrent_within_group: c.concurrent_within_group,
            hash_requests: c.cache.enabled,
            cache_ttl: c.cache.ttl.as_secs_f64(),
            cache_max_size: c.cache.max_entries,
        }
    }

    /// Stop admitting batches and close the worker pools.
    pub fn shutdown(&self) {
        info!("Shutting down batch service");
        self.gate.close();
        self.manager.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Metadata, tool_hint};
    use crate::config::CacheConfig;
    use crate::registry::{ToolDescriptor, ToolHandler};
    use serde_json::json;

    fn service(config: SchedulerConfig) -> BatchService {
        let registry = ToolRegistry::new().with(
            ToolDescriptor::new("math.inc", "Increment", json!({})),
            ToolHandler::cooperative(|args, _| async move {
                Ok(json!(args["n"].as_i64().unwrap_or(0) + 1))
            }),
        );
        BatchService::from_registry(Arc::new(registry), config)
    }

    fn request(n: i64) -> BatchRequest {
        BatchRequest::from_actions([format!(r#"{{"n":{n}}}"#)])
            .with_extra_fields(vec![tool_hint("math.inc")])
    }

    #[tokio::test]
    async fn invalid_request_is_rejected() {
        let svc = service(SchedulerConfig::default());
        let mut req = request(1);
        req.trajectory_ids.clear();
        let err = svc.execute(req).await.unwrap_err();
        assert!(matches!(err, BatchError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn missing_trace_id_is_minted_as_uuid() {
        let svc = service(SchedulerConfig::default());
        let (resp, meta) = svc.execute(request(1)).await.unwrap();
        assert_eq!(resp.trace_id, meta.trace_id);
        let parsed = uuid::Uuid::parse_str(&resp.trace_id).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[tokio::test]
    async fn second_identical_request_hits_cache() {
        let svc = service(SchedulerConfig::default());
        let (first, meta1) = svc.execute(request(1).with_trace_id("t-1")).await.unwrap();
        assert_eq!(meta1.cache, CacheStatus::Miss);
        assert_eq!(first.trace_id, "t-1");

        let mut again = request(1).with_trace_id("t-2");
        again.trajectory_ids = vec!["other".into()];
        let (second, meta2) = svc.execute(again).await.unwrap();
        assert_eq!(meta2.cache, CacheStatus::Hit);
        assert_eq!(second.trace_id, "t-2");
        assert_eq!(second.observations, first.observations);
    }

    #[tokio::test]
    async fn omitted_extra_fields_share_a_key_with_empty_maps() {
        let svc = service(SchedulerConfig::default());
        let bare = BatchRequest::from_actions(["noop"]);
        let explicit = BatchRequest::from_actions(["noop"]).with_extra_fields(vec![Metadata::new()]);
        assert_eq!(svc.execute(bare).await.unwrap().1.cache, CacheStatus::Miss);
        assert_eq!(svc.execute(explicit).await.unwrap().1.cache, CacheStatus::Hit);
    }

    #[tokio::test]
    async fn disabled_cache_reports_no_status() {
        let svc = service(SchedulerConfig::default().with_cache(CacheConfig::disabled()));
        let (_, meta) = svc.execute(request(1)).await.unwrap();
        assert_eq!(meta.cache, CacheStatus::Disabled);
        assert_eq!(meta.cache.header_value(), None);
        let (_, meta) = svc.execute(request(1)).await.unwrap();
        assert_eq!(meta.cache, CacheStatus::Disabled);
    }

    #[tokio::test]
    async fn slot_is_released_after_each_batch() {
        let svc = service(SchedulerConfig::default().with_max_concurrent_requests(1));
        for n in 0..3 {
            svc.execute(request(n)).await.unwrap();
        }
        assert_eq!(svc.metrics().concurrency.available_slots, 1);
    }

    #[tokio::test]
    async fn shutdown_refuses_new_batches() {
        let svc = service(SchedulerConfig::default());
        svc.shutdown();
        let err = svc.execute(request(5)).await.unwrap_err();
        assert!(matches!(err, BatchError::Unavailable(_)));
    }

    #[tokio::test]
    async fn snapshots_reflect_config() {
        let svc = service(
            SchedulerConfig::default()
                .with_max_concurrent_requests(7)
                .with_thread_pool_size(3),
        );
        let health = svc.health();
        assert_eq!(health.status, "healthy");
        assert_eq!(health.config.max_concurrent_requests, 7);
        assert!(health.config.hash_requests);
        let config = svc.config();
        assert_eq!(config.thread_pool_size, 3);
        assert_eq!(config.request_timeout, 30.0);
        let metrics = svc.metrics();
        assert_eq!(metrics.concurrency.total_slots, 7);
        assert_eq!(metrics.pools.thread_pool.size, 3);
    }
}
