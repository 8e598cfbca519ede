//! Convenience re-exports for common `toolbatch` types.
//!
//! ```ignore
//! use toolbatch::prelude::*;
//! ```
//!
//! Covers building a registry, configuring and running a
//! [`BatchService`], and reading its results. Pipeline internals (grouping,
//! lanes, aggregation) are left out; import those from their modules.

// ── Wire types ──────────────────────────────────────────────────────
pub use crate::batch::{BatchRequest, BatchResponse, Metadata, Outcome, tool_hint};
pub use crate::error::BatchError;
pub use crate::json_schema_for;

// ── Registry and collaborators ──────────────────────────────────────
pub use crate::connection::{Connection, ConnectionResolver, StaticConnections};
pub use crate::registry::{
    ActionContext, HandlerKind, HandlerRegistry, ToolDescriptor, ToolHandler, ToolRegistry,
    Toolkit, ToolkitCatalog,
};

// ── Scheduling ──────────────────────────────────────────────────────
pub use crate::config::{CacheConfig, SchedulerConfig};
pub use crate::grouper::{DetectionRule, RuleTable};
pub use crate::manager::ToolManager;
pub use crate::service::{BatchService, CacheStatus, ResponseMeta};
pub use crate::worker::WorkerCommand;
