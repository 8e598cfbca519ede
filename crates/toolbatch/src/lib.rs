//! Batch tool-execution scheduler.
//!
//! `toolbatch` takes a large list of heterogeneous tool actions, works out
//! which tool each one belongs to, runs every tool group in the right
//! execution lane, and hands back results aligned to the caller's order.
//! Whole batches are memoized behind a TTL- and capacity-bounded cache, and
//! a concurrency gate bounds how many batches run at once under a deadline.
//!
//! ```ignore
//! use std::sync::Arc;
//! use toolbatch::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BatchError> {
//!     let registry = Arc::new(ToolRegistry::new().with_builtin_tools());
//!     let service = BatchService::from_registry(registry, SchedulerConfig::default());
//!
//!     let request = BatchRequest::from_actions([r#"{"a":1,"b":2}"#])
//!         .with_extra_fields(vec![tool_hint("math.add")]);
//!     let (response, meta) = service.execute(request).await?;
//!     println!("{:?} (cache: {:?})", response.observations, meta.cache);
//!     Ok(())
//! }
//! ```
//!
//! # Pipeline
//!
//! | Stage | Module |
//! |-------|--------|
//! | Tool detection and grouping | [`grouper`] |
//! | Connection resolution | [`connection`] |
//! | Lane selection and execution | [`lanes`], [`worker`] |
//! | Index-aligned fan-in | [`aggregate`] |
//! | The whole pipeline | [`manager`] |
//! | Cache, admission, deadline | [`cache`], [`gate`], [`service`] |
//!
//! # Failure isolation
//!
//! The narrowest failure wins. A handler error or panic fails one index; a
//! group whose task dies fails that group's indices; anything escaping the
//! pipeline fails every index. Only validation, the deadline, and a closed
//! gate surface as a [`BatchError`](error::BatchError).

pub mod aggregate;
pub mod batch;
pub mod builtin;
pub mod cache;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod gate;
pub mod grouper;
pub mod lanes;
pub mod manager;
pub mod prelude;
pub mod registry;
pub mod service;
pub mod trace;
pub mod worker;

pub use schemars;

use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;

/// Derive the draft-07 JSON Schema for a tool's argument type.
///
/// # Example
///
/// ```
/// use toolbatch::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct SearchArgs {
///     query: String,
///     #[serde(default)]
///     limit: Option<u32>,
/// }
///
/// let schema = json_schema_for::<SearchArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"query".into()));
/// assert_eq!(schema["title"], "SearchArgs");
/// assert_eq!(schema["$schema"], "http://json-schema.org/draft-07/schema#");
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = SchemaSettings::draft07()
        .into_generator()
        .into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}
