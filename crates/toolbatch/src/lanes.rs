//! Lane selection and per-group execution.
//!
//! Every tool group becomes exactly one [`GroupTask`]. Cooperative handlers
//! run as a spawned task on the runtime; light blocking handlers run on a
//! bounded [`BlockingPool`] of threads; heavy handlers, picked by the
//! handler's kind and the configured heavy keywords, run in a worker process
//! from the [`ProcessPool`]. Inside a group each action is isolated: an error
//! or panic turns into a failed [`Outcome`] for that index only.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error};

use crate::batch::Outcome;
use crate::registry::{ActionContext, BlockingFn, CooperativeFn, ToolHandler};
use crate::trace::unix_timestamp;
use crate::worker::{ProcessPool, WorkerJob};

// ── Worker pools ──────────────────────────────────────────────────

/// A bounded pool of blocking workers.
///
/// Jobs wait for a permit, then run on tokio's blocking thread pool, so at
/// most `size` jobs from this pool execute at once. Closing the pool makes
/// every pending and future job fail instead of running.
#[derive(Debug)]
pub struct BlockingPool {
    name: &'static str,
    permits: Arc<Semaphore>,
    size: usize,
}

/// Point-in-time view of a pool for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: &'static str,
    pub size: usize,
    pub available: usize,
    pub closed: bool,
}

impl BlockingPool {
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Run `job` on the pool once a worker is free.
    pub fn spawn<F, T>(&self, job: F) -> JoinHandle<Result<T, String>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let name = self.name;
        tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| format!("{name} pool is shut down"))?;
            tokio::task::spawn_blocking(job)
                .await
                .map_err(join_error_message)
        })
    }

    /// Stop accepting work. Jobs still waiting for a permit fail.
    pub fn close(&self) {
        self.permits.close();
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name,
            size: self.size,
            available: self.permits.available_permits(),
            closed: self.permits.is_closed(),
        }
    }
}

// ── Lanes ─────────────────────────────────────────────────────────

/// Execution context for a tool group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Cooperative,
    Light,
    Heavy,
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Lane::Cooperative => "cooperative",
            Lane::Light => "thread",
            Lane::Heavy => "heavy",
        })
    }
}

/// Pick the lane for a handler. A light blocking handler is promoted to the
/// heavy lane when its slug contains one of `heavy_keywords`.
pub fn select_lane(handler: &ToolHandler, slug: &str, heavy_keywords: &[String]) -> Lane {
    match handler {
        ToolHandler::Cooperative(_) => Lane::Cooperative,
        ToolHandler::Blocking { heavy: true, .. } => Lane::Heavy,
        ToolHandler::Blocking { heavy: false, .. } => {
            let slug = slug.to_lowercase();
            if heavy_keywords
                .iter()
                .any(|kw| !kw.is_empty() && slug.contains(&kw.to_lowercase()))
            {
                Lane::Heavy
            } else {
                Lane::Light
            }
        }
    }
}

/// One action ready for execution: the raw payload and its context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionInput {
    pub raw: String,
    pub context: ActionContext,
}

/// The single awaitable produced for a tool group.
#[derive(Debug)]
pub enum GroupTask {
    /// Outcomes known without running anything.
    Ready(Vec<Outcome>),
    /// A spawned task yielding outcomes in the group's local order.
    Running(JoinHandle<Result<Vec<Outcome>, String>>),
}

impl GroupTask {
    /// Wait for the group. `Err` means the group failed as a whole.
    pub async fn wait(self) -> Result<Vec<Outcome>, String> {
        match self {
            GroupTask::Ready(outcomes) => Ok(outcomes),
            GroupTask::Running(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(join_error_message(e)),
            },
        }
    }
}

// ── Dispatcher ────────────────────────────────────────────────────

/// Routes tool groups to their lane.
#[derive(Debug)]
pub struct LaneDispatcher {
    light: BlockingPool,
    heavy: ProcessPool,
    heavy_keywords: Vec<String>,
    concurrent_within_group: bool,
}

impl LaneDispatcher {
    pub fn new(
        light: BlockingPool,
        heavy: ProcessPool,
        heavy_keywords: Vec<String>,
        concurrent_within_group: bool,
    ) -> Self {
        Self {
            light,
            heavy,
            heavy_keywords,
            concurrent_within_group,
        }
    }

    /// Produce the group's task. `handler` is `None` when the slug is not
    /// registered, in which case every member fails immediately.
    pub fn dispatch(
        &self,
        slug: &str,
        handler: Option<ToolHandler>,
        inputs: Vec<ActionInput>,
        trace_id: &str,
    ) -> GroupTask {
        let Some(handler) = handler else {
            error!("[{trace_id}] Tool '{slug}' not found");
            let failure = Outcome::error(format!("tool not found: {slug}"), trace_id);
            return GroupTask::Ready(vec![failure; inputs.len()]);
        };

        let lane = select_lane(&handler, slug, &self.heavy_keywords);
        debug!(
            "[{trace_id}] Using {lane} lane for tool {slug} ({} actions)",
            inputs.len()
        );

        let slug = slug.to_string();
        let trace_id = trace_id.to_string();
        match handler {
            ToolHandler::Cooperative(call) => {
                let concurrent = self.concurrent_within_group;
                GroupTask::Running(tokio::spawn(async move {
                    let outcomes = if concurrent {
                        join_all(
                            inputs
                                .into_iter()
                                .map(|input| run_cooperative(&call, input, &slug, &trace_id)),
                        )
                        .await
                    } else {
                        let mut outcomes = Vec::with_capacity(inputs.len());
                        for input in inputs {
                            outcomes.push(run_cooperative(&call, input, &slug, &trace_id).await);
                        }
                        outcomes
                    };
                    Ok(outcomes)
                }))
            }
            ToolHandler::Blocking { .. } if lane == Lane::Heavy => {
                GroupTask::Running(self.heavy.run(WorkerJob {
                    slug,
                    trace_id,
                    actions: inputs,
                }))
            }
            ToolHandler::Blocking { call, .. } => GroupTask::Running(self.light.spawn(move || {
                inputs
                    .into_iter()
                    .map(|input| run_blocking(&call, input, &slug, &trace_id))
                    .collect::<Vec<Outcome>>()
            })),
        }
    }

    /// Close the thread and process pools.
    pub fn shutdown(&self) {
        self.light.close();
        self.heavy.close();
    }

    pub fn pool_stats(&self) -> [PoolStats; 2] {
        [self.light.stats(), self.heavy.stats()]
    }
}

// ── Per-action execution ──────────────────────────────────────────

async fn run_cooperative(
    call: &CooperativeFn,
    input: ActionInput,
    slug: &str,
    trace_id: &str,
) -> Outcome {
    let args = parse_action_args(&input.raw);
    let mut context = input.context;
    context.timestamp = unix_timestamp();
    let result = AssertUnwindSafe(async move { call(args, context).await })
        .catch_unwind()
        .await;
    settle(result, slug, trace_id)
}

pub(crate) fn run_blocking(
    call: &BlockingFn,
    input: ActionInput,
    slug: &str,
    trace_id: &str,
) -> Outcome {
    let args = parse_action_args(&input.raw);
    let mut context = input.context;
    context.timestamp = unix_timestamp();
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| call(args, context)));
    settle(result, slug, trace_id)
}

fn settle(
    result: Result<Result<Value, String>, Box<dyn Any + Send>>,
    slug: &str,
    trace_id: &str,
) -> Outcome {
    match result {
        Ok(Ok(value)) => {
            debug!("[{trace_id}] Tool {slug} executed successfully");
            normalize_output(value)
        }
        Ok(Err(e)) => {
            error!("[{trace_id}] Tool {slug} execution failed: {e}");
            Outcome::error(e, trace_id)
        }
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            error!("[{trace_id}] Tool {slug} panicked: {msg}");
            Outcome::error(format!("handler panicked: {msg}"), trace_id)
        }
    }
}

/// Parse an action payload as JSON, falling back to `{"action": raw}`.
pub fn parse_action_args(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| json!({ "action": raw }))
}

/// Turn a handler's return value into an [`Outcome`].
///
/// A map may carry `obs`, `done` and `valid`; missing `obs` means the whole
/// map is the observation. Anything else is a bare observation with
/// `done = false` and `valid = true`.
pub fn normalize_output(value: Value) -> Outcome {
    match value {
        Value::Object(mut map) => {
            let done = map.get("done").is_some_and(truthy);
            let valid = map.get("valid").is_none_or(truthy);
            let observation = match map.remove("obs") {
                Some(obs) => obs,
                None => Value::Object(map),
            };
            Outcome {
                observation,
                done,
                valid,
            }
        }
        other => Outcome::value(other),
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(crate) fn join_error_message(err: JoinError) -> String {
    if err.is_panic() {
        format!("task panicked: {}", panic_message(err.into_panic().as_ref()))
    } else {
        "task was cancelled".to_string()
    }
}
