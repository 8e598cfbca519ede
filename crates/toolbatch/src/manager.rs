//! The batch pipeline: group, resolve connections, dispatch, aggregate.
//!
//! [`ToolManager`] owns the worker pools and the detection rules. It never
//! fails as a whole: anything that escapes the pipeline is broadened into a
//! uniform failure for every index of the batch.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::aggregate::{PendingGroup, ResultAggregator, broadcast_failure};
use crate::batch::{Metadata, Outcome, RESERVED_KEYS};
use crate::config::SchedulerConfig;
use crate::connection::{ConnectionResolver, ResolvedConnection, resolve_group};
use crate::grouper::{Grouping, RuleTable, group_actions};
use crate::lanes::{ActionInput, BlockingPool, LaneDispatcher, PoolStats, join_error_message, panic_message};
use crate::registry::{ActionContext, HandlerRegistry, ToolRegistry, ToolkitCatalog};
use crate::trace::{elapsed_ms, unix_timestamp};
use crate::worker::ProcessPool;

/// Sizes and free workers of the three pools.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub thread_pool: PoolStats,
    pub process_pool: PoolStats,
    pub parse_pool: PoolStats,
}

/// Runs batches of actions against a handler registry.
pub struct ToolManager {
    handlers: Arc<dyn HandlerRegistry>,
    catalog: Option<Arc<dyn ToolkitCatalog>>,
    resolver: Option<Arc<dyn ConnectionResolver>>,
    rules: Arc<RuleTable>,
    parse_pool: BlockingPool,
    dispatcher: LaneDispatcher,
    chunk_size: usize,
}

impl std::fmt::Debug for ToolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolManager")
            .field("rules", &self.rules.len())
            .field("has_catalog", &self.catalog.is_some())
            .field("has_resolver", &self.resolver.is_some())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl ToolManager {
    /// Create a manager over any handler registry, sized from `config`.
    pub fn new(handlers: Arc<dyn HandlerRegistry>, config: &SchedulerConfig) -> Self {
        let dispatcher = LaneDispatcher::new(
            BlockingPool::new("thread", config.resolved_thread_pool()),
            ProcessPool::new(config.resolved_process_pool(), config.resolved_worker()),
            config.heavy_keywords.clone(),
            config.concurrent_within_group,
        );
        Self {
            handlers,
            catalog: None,
            resolver: None,
            rules: Arc::new(RuleTable::default()),
            parse_pool: BlockingPool::new("parse", config.resolved_parse_pool()),
            dispatcher,
            chunk_size: config.resolved_chunk_size(),
        }
    }

    /// Create a manager whose registry also serves as the toolkit catalog.
    pub fn from_registry(registry: Arc<ToolRegistry>, config: &SchedulerConfig) -> Self {
        let catalog: Arc<dyn ToolkitCatalog> = registry.clone();
        Self::new(registry, config).with_catalog(catalog)
    }

    /// Replace the detection rules.
    pub fn with_rules(mut self, rules: RuleTable) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    /// Enable connection resolution for batches that carry a user ID.
    pub fn with_resolver(mut self, resolver: Arc<dyn ConnectionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn ToolkitCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Run a batch. Always returns exactly one outcome per action.
    pub async fn process_actions(
        &self,
        actions: &[String],
        metadata: &[Metadata],
        user_id: Option<&str>,
        trace_id: &str,
    ) -> Vec<Outcome> {
        let n = actions.len();
        info!("[{trace_id}] Starting batch processing: {n} actions");
        if n == 0 {
            return Vec::new();
        }
        let start = Instant::now();

        let pipeline = AssertUnwindSafe(self.run_pipeline(actions, metadata, user_id, trace_id));
        let outcomes = match pipeline.catch_unwind().await {
            Ok(Ok(outcomes)) => outcomes,
            Ok(Err(e)) => {
                error!("[{trace_id}] Batch processing failed: {e}");
                broadcast_failure(n, &e, trace_id)
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!("[{trace_id}] Batch processing panicked: {msg}");
                broadcast_failure(n, &msg, trace_id)
            }
        };

        info!(
            "[{trace_id}] Batch processing completed in {:.2}ms",
            elapsed_ms(start)
        );
        outcomes
    }

    async fn run_pipeline(
        &self,
        actions: &[String],
        metadata: &[Metadata],
        user_id: Option<&str>,
        trace_id: &str,
    ) -> Result<Vec<Outcome>, String> {
        if metadata.len() != actions.len() {
            return Err(format!(
                "metadata has {} entries for {} actions",
                metadata.len(),
                actions.len()
            ));
        }

        let grouping = group_actions(
            actions,
            metadata,
            &self.rules,
            &self.parse_pool,
            self.chunk_size,
            trace_id,
        )
        .await;

        let mut connections = match (user_id, &self.resolver) {
            (Some(user), Some(resolver)) => {
                self.resolve_connections(&grouping, metadata, user, Arc::clone(resolver), trace_id)
                    .await?
            }
            _ => HashMap::new(),
        };

        let mut aggregator = ResultAggregator::new(actions.len(), trace_id);
        aggregator.record_grouping_failures(&grouping);

        let mut pending = Vec::with_capacity(grouping.groups.len());
        for (slug, indices) in grouping.groups {
            let inputs = indices
                .iter()
                .map(|&idx| ActionInput {
                    raw: actions[idx].clone(),
                    context: build_context(&metadata[idx], user_id, connections.remove(&idx), trace_id),
                })
                .collect();
            let task = self
                .dispatcher
                .dispatch(&slug, self.handlers.get(&slug), inputs, trace_id);
            pending.push(PendingGroup {
                slug,
                indices,
                task,
            });
        }

        aggregator.collect(pending).await;
        Ok(aggregator.finish())
    }

    /// Resolve connections for every known group off the runtime threads.
    async fn resolve_connections(
        &self,
        grouping: &Grouping,
        metadata: &[Metadata],
        user_id: &str,
        resolver: Arc<dyn ConnectionResolver>,
        trace_id: &str,
    ) -> Result<HashMap<usize, ResolvedConnection>, String> {
        info!("[{trace_id}] Resolving connections for user {user_id}");
        let groups = grouping.groups.clone();
        let metadata = metadata.to_vec();
        let catalog = self.catalog.clone();
        let user = user_id.to_string();
        let trace = trace_id.to_string();

        tokio::task::spawn_blocking(move || {
            let mut resolved = HashMap::new();
            for (slug, indices) in &groups {
                resolved.extend(resolve_group(
                    slug,
                    indices,
                    &metadata,
                    &user,
                    resolver.as_ref(),
                    catalog.as_deref(),
                    &trace,
                ));
            }
            debug!("[{trace}] Resolved {} connections", resolved.len());
            resolved
        })
        .await
        .map_err(|e| format!("connection resolution failed: {}", join_error_message(e)))
    }

    /// Close the worker pools. Groups dispatched afterwards to a blocking
    /// lane fail as a whole, and unspecified actions fail detection.
    pub fn shutdown(&self) {
        info!("Shutting down tool manager pools");
        self.dispatcher.shutdown();
        self.parse_pool.close();
    }

    pub fn stats(&self) -> ManagerStats {
        let [thread_pool, process_pool] = self.dispatcher.pool_stats();
        ManagerStats {
            thread_pool,
            process_pool,
            parse_pool: self.parse_pool.stats(),
        }
    }
}

/// Build an action's context from its metadata and resolved connection.
fn build_context(
    meta: &Metadata,
    user_id: Option<&str>,
    resolved: Option<ResolvedConnection>,
    trace_id: &str,
) -> ActionContext {
    let passthrough = meta
        .iter()
        .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let (connection_id, connection) = match resolved {
        Some(r) => (Some(r.id), r.connection),
        None => (None, None),
    };
    ActionContext {
        trace_id: trace_id.to_string(),
        timestamp: unix_timestamp(),
        user_id: user_id.map(str::to_string),
        connection_id,
        connection,
        metadata: passthrough,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::tool_hint;
    use crate::connection::{Connection, StaticConnections};
    use crate::registry::{ToolDescriptor, ToolHandler};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_context_registry() -> Arc<ToolRegistry> {
        Arc::new(
            ToolRegistry::new().with_toolkit("github", "GitHub").with(
                ToolDescriptor::new("github.whoami", "Echo the context", json!({})),
                ToolHandler::blocking(|_, ctx| Ok(json!({ "obs": ctx.to_value() }))),
            ),
        )
    }

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn context_drops_reserved_keys() {
        let mut meta = tool_hint("a.b");
        meta.insert("app_key".into(), json!("github"));
        meta.insert("connection".into(), json!("c1"));
        meta.insert("locale".into(), json!("fr"));
        let ctx = build_context(&meta, Some("u1"), None, "tr");
        assert_eq!(ctx.metadata.len(), 1);
        assert_eq!(ctx.metadata["locale"], "fr");
        assert_eq!(ctx.user_id.as_deref(), Some("u1"));
        assert!(ctx.connection_id.is_none());
    }

    #[tokio::test]
    async fn empty_batch_returns_immediately() {
        let manager = ToolManager::from_registry(echo_context_registry(), &SchedulerConfig::default());
        assert!(manager.process_actions(&[], &[], None, "tr").await.is_empty());
    }

    #[tokio::test]
    async fn metadata_mismatch_fails_whole_batch() {
        let manager = ToolManager::from_registry(echo_context_registry(), &SchedulerConfig::default());
        let out = manager
            .process_actions(&strings(&["{}", "{}"]), &[Metadata::new()], None, "tr")
            .await;
        assert_eq!(out.len(), 2);
        for o in out {
            let err = o.observation["error"].as_str().unwrap();
            assert!(err.starts_with("Batch processing failed:"));
            assert!(o.done && !o.valid);
        }
    }

    #[tokio::test]
    async fn connection_reaches_handler_context() {
        let resolver = Arc::new(StaticConnections::new().with(Connection::new("c-gh", "u1", "github")));
        let manager = ToolManager::from_registry(echo_context_registry(), &SchedulerConfig::default())
            .with_resolver(resolver);
        let mut explicit = tool_hint("github.whoami");
        explicit.insert("connection".into(), json!("manual"));
        let metadata = vec![tool_hint("github.whoami"), explicit];
        let out = manager
            .process_actions(&strings(&["{}", "{}"]), &metadata, Some("u1"), "tr")
            .await;
        assert_eq!(out[0].observation["connection_id"], "c-gh");
        assert_eq!(out[0].observation["connection"]["app_key"], "github");
        assert_eq!(out[1].observation["connection_id"], "manual");
        assert_eq!(out[1].observation["user_id"], "u1");
    }

    #[tokio::test]
    async fn no_user_means_no_resolution() {
        let resolver = Arc::new(StaticConnections::new().with(Connection::new("c-gh", "u1", "github")));
        let manager = ToolManager::from_registry(echo_context_registry(), &SchedulerConfig::default())
            .with_resolver(resolver);
        let out = manager
            .process_actions(&strings(&["{}"]), &[tool_hint("github.whoami")], None, "tr")
            .await;
        assert!(out[0].observation.get("connection_id").is_none());
        assert_eq!(out[0].observation["trace_id"], "tr");
    }

    #[tokio::test]
    async fn custom_rules_route_unspecified_actions() {
        let registry = Arc::new(ToolRegistry::new().with(
            ToolDescriptor::new("net.ping", "Ping", json!({})),
            ToolHandler::cooperative(|_, _| async move { Ok(Value::from("pong")) }),
        ));
        let rules = RuleTable::from_patterns(&[(r"^ping\b", "net.ping")]).unwrap();
        let manager = ToolManager::from_registry(registry, &SchedulerConfig::default()).with_rules(rules);
        let out = manager
            .process_actions(
                &strings(&["ping host", "pong"]),
                &[Metadata::new(), Metadata::new()],
                None,
                "tr",
            )
            .await;
        assert_eq!(out[0].observation, json!("pong"));
        assert_eq!(out[1].observation["invalid_reason"], "no tool specified");
    }

    #[tokio::test]
    async fn default_rules_run_detected_actions_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = Arc::new(ToolRegistry::new().with(
            ToolDescriptor::new("search_engine", "Search", json!({})),
            ToolHandler::cooperative(move |args, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(args) }
            }),
        ));
        let manager = ToolManager::from_registry(registry, &SchedulerConfig::default());
        let out = manager
            .process_actions(
                &strings(&["search(x)", "gibberish"]),
                &[Metadata::new(), Metadata::new()],
                None,
                "tr",
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out[0].observation["action"], "search(x)");
        assert!(out[0].valid);
        assert_eq!(out[1].observation["invalid_reason"], "no tool specified");
        assert!(!out[1].valid);
    }

    #[tokio::test]
    async fn stats_report_pool_sizes() {
        let config = SchedulerConfig::default()
            .with_thread_pool_size(3)
            .with_process_pool_size(2)
            .with_parse_pool_size(4);
        let manager = ToolManager::from_registry(echo_context_registry(), &config);
        let stats = manager.stats();
        assert_eq!(stats.thread_pool.size, 3);
        assert_eq!(stats.process_pool.size, 2);
        assert_eq!(stats.parse_pool.available, 4);
        manager.shutdown();
        assert!(manager.stats().thread_pool.closed);
        assert!(manager.stats().process_pool.closed);
    }
}
