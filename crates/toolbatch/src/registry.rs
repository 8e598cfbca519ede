//! Tool handlers and the registry that maps slugs to them.
//!
//! A handler is registered together with its [`HandlerKind`], so lane
//! selection is a plain match on the variant rather than an inspection of
//! the callable. Constructors tie the kind to the closure shape: async
//! closures are cooperative, sync closures are blocking.
//!
//! ```ignore
//! let registry = ToolRegistry::new()
//!     .with_toolkit("math", "Arithmetic helpers")
//!     .with(
//!         ToolDescriptor::new("math.add", "Add two numbers", json_schema_for::<AddArgs>()),
//!         ToolHandler::cooperative(|args, _ctx| async move { add(args) }),
//!     );
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::batch::Metadata;
use crate::connection::Connection;

/// Boxed future returned by a cooperative handler.
pub type ActionFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;

/// Shared cooperative handler callable.
pub type CooperativeFn = Arc<dyn Fn(Value, ActionContext) -> ActionFuture + Send + Sync>;
/// Shared blocking handler callable.
pub type BlockingFn = Arc<dyn Fn(Value, ActionContext) -> Result<Value, String> + Send + Sync>;

// ── Handler contract ──────────────────────────────────────────────

/// Per-action execution context handed to every handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionContext {
    pub trace_id: String,
    /// Seconds since the Unix epoch when the action started.
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<Connection>,
    /// Passthrough metadata with the scheduler's reserved keys removed.
    #[serde(flatten)]
    pub metadata: Metadata,
}

impl ActionContext {
    /// Flat JSON view, with passthrough metadata merged at the top level.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// How a handler must be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    /// Awaited on the runtime as a spawned task.
    Cooperative,
    /// Synchronous; runs on the light worker-thread pool.
    BlockingLight,
    /// Synchronous and CPU-bound; runs on the heavy worker pool.
    BlockingHeavy,
}

/// A type-erased tool handler.
#[derive(Clone)]
pub enum ToolHandler {
    Cooperative(CooperativeFn),
    Blocking { heavy: bool, call: BlockingFn },
}

impl ToolHandler {
    /// Wrap an async closure as a cooperative handler.
    pub fn cooperative<F, Fut>(handler: F) -> Self
    where
        F: Fn(Value, ActionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let erased = move |args: Value, ctx: ActionContext| -> ActionFuture {
            Box::pin(handler(args, ctx))
        };
        ToolHandler::Cooperative(Arc::new(erased))
    }

    /// Wrap a sync closure as a light blocking handler.
    pub fn blocking<F>(handler: F) -> Self
    where
        F: Fn(Value, ActionContext) -> Result<Value, String> + Send + Sync + 'static,
    {
        ToolHandler::Blocking {
            heavy: false,
            call: Arc::new(handler),
        }
    }

    /// Wrap a sync closure as a heavy (CPU-bound) blocking handler.
    pub fn heavy<F>(handler: F) -> Self
    where
        F: Fn(Value, ActionContext) -> Result<Value, String> + Send + Sync + 'static,
    {
        ToolHandler::Blocking {
            heavy: true,
            call: Arc::new(handler),
        }
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            ToolHandler::Cooperative(_) => HandlerKind::Cooperative,
            ToolHandler::Blocking { heavy: false, .. } => HandlerKind::BlockingLight,
            ToolHandler::Blocking { heavy: true, .. } => HandlerKind::BlockingHeavy,
        }
    }

    /// Run `check` on the arguments before the wrapped handler sees them.
    fn guarded(self, check: Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>) -> Self {
        match self {
            ToolHandler::Cooperative(inner) => {
                let erased = move |args: Value, ctx: ActionContext| -> ActionFuture {
                    if let Err(e) = check(&args) {
                        return Box::pin(async move { Err(e) });
                    }
                    inner(args, ctx)
                };
                ToolHandler::Cooperative(Arc::new(erased))
            }
            ToolHandler::Blocking { heavy, call } => ToolHandler::Blocking {
                heavy,
                call: Arc::new(move |args: Value, ctx: ActionContext| {
                    check(&args)?;
                    call(args, ctx)
                }),
            },
        }
    }
}

impl fmt::Debug for ToolHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolHandler")
            .field("kind", &self.kind())
            .finish()
    }
}

// ── Descriptors ───────────────────────────────────────────────────

/// Static description of a registered tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    /// Namespaced identifier, `toolkit.tool`.
    pub slug: String,
    pub name: String,
    pub description: String,
    /// JSON Schema for the argument map.
    pub parameters: Value,
    /// Whether the handler expects a resolved connection.
    pub requires_connection: bool,
}

impl ToolDescriptor {
    pub fn new(slug: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        let slug = slug.into();
        let name = slug.rsplit('.').next().unwrap_or(slug.as_str()).to_string();
        Self {
            slug,
            name,
            description: description.into(),
            parameters,
            requires_connection: false,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn requires_connection(mut self, required: bool) -> Self {
        self.requires_connection = required;
        self
    }

    /// Toolkit prefix of the slug, if it is namespaced.
    pub fn toolkit(&self) -> Option<&str> {
        self.slug.split_once('.').map(|(toolkit, _)| toolkit)
    }
}

/// A named group of tools sharing a connection type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Toolkit {
    pub name: String,
    pub description: String,
}

// ── Collaborator traits ───────────────────────────────────────────

/// Slug to handler lookup used by the lane dispatcher.
pub trait HandlerRegistry: Send + Sync {
    fn get(&self, slug: &str) -> Option<ToolHandler>;
}

/// Toolkit listing used for connection auto-resolution.
pub trait ToolkitCatalog: Send + Sync {
    fn list_toolkits(&self) -> Vec<Toolkit>;
    fn list_tools(&self, toolkit: &str) -> Vec<ToolDescriptor>;
}

// ── ToolRegistry ──────────────────────────────────────────────────

struct RegisteredTool {
    descriptor: ToolDescriptor,
    handler: ToolHandler,
    validator: Option<Arc<jsonschema::Validator>>,
}

/// In-memory registry implementing both [`HandlerRegistry`] and
/// [`ToolkitCatalog`].
pub struct ToolRegistry {
    toolkits: BTreeMap<String, Toolkit>,
    tools: HashMap<String, RegisteredTool>,
    /// Whether to validate arguments against each tool's JSON Schema.
    validate_args: bool,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("toolkits", &self.toolkits.keys().collect::<Vec<_>>())
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("validate_args", &self.validate_args)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            toolkits: BTreeMap::new(),
            tools: HashMap::new(),
            validate_args: false,
        }
    }

    /// Enable JSON Schema argument validation before handler invocation.
    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    pub fn register_toolkit(&mut self, name: impl Into<String>, description: impl Into<String>) {
        let name = name.into();
        self.toolkits.insert(
            name.clone(),
            Toolkit {
                name,
                description: description.into(),
            },
        );
    }

    /// Register a toolkit (builder pattern).
    pub fn with_toolkit(mut self, name: impl Into<String>, description: impl Into<String>) -> Self {
        self.register_toolkit(name, description);
        self
    }

    /// Register a tool. Replaces any existing tool with the same slug.
    pub fn register(&mut self, descriptor: ToolDescriptor, handler: ToolHandler) {
        let validator = match jsonschema::validator_for(&descriptor.parameters) {
            Ok(v) => Some(Arc::new(v)),
            Err(e) => {
                warn!("Tool {} has an unusable parameter schema: {e}", descriptor.slug);
                None
            }
        };
        self.tools.insert(
            descriptor.slug.clone(),
            RegisteredTool {
                descriptor,
                handler,
                validator,
            },
        );
    }

    /// Register a tool (builder pattern).
    pub fn with(mut self, descriptor: ToolDescriptor, handler: ToolHandler) -> Self {
        self.register(descriptor, handler);
        self
    }

    pub fn descriptor(&self, slug: &str) -> Option<&ToolDescriptor> {
        self.tools.get(slug).map(|t| &t.descriptor)
    }

    /// All descriptors, sorted by slug.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut all: Vec<_> = self.tools.values().map(|t| t.descriptor.clone()).collect();
        all.sort_by(|a, b| a.slug.cmp(&b.slug));
        all
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry for ToolRegistry {
    fn get(&self, slug: &str) -> Option<ToolHandler> {
        let tool = self.tools.get(slug)?;
        match (&tool.validator, self.validate_args) {
            (Some(validator), true) => {
                let validator = Arc::clone(validator);
                let slug = slug.to_string();
                let check = move |args: &Value| validate_arguments(&validator, &slug, args);
                Some(tool.handler.clone().guarded(Arc::new(check)))
            }
            _ => Some(tool.handler.clone()),
        }
    }
}

impl ToolkitCatalog for ToolRegistry {
    fn list_toolkits(&self) -> Vec<Toolkit> {
        self.toolkits.values().cloned().collect()
    }

    fn list_tools(&self, toolkit: &str) -> Vec<ToolDescriptor> {
        self.descriptors()
            .into_iter()
            .filter(|d| d.toolkit() == Some(toolkit))
            .collect()
    }
}

/// Check arguments against a compiled schema, listing every violation.
fn validate_arguments(
    validator: &jsonschema::Validator,
    slug: &str,
    args: &Value,
) -> Result<(), String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| format!("  - {}: {e}", e.instance_path()))
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "argument validation failed for tool '{slug}':\n{}",
            errors.join("\n")
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ActionContext {
        ActionContext {
            trace_id: "tr-test".into(),
            timestamp: 0.0,
            user_id: None,
            connection_id: None,
            connection: None,
            metadata: Metadata::new(),
        }
    }

    fn number_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "a": { "type": "number" } },
            "required": ["a"]
        })
    }

    #[test]
    fn kind_follows_constructor() {
        let coop = ToolHandler::cooperative(|args, _| async move { Ok(args) });
        let light = ToolHandler::blocking(|args, _| Ok(args));
        let heavy = ToolHandler::heavy(|args, _| Ok(args));
        assert_eq!(coop.kind(), HandlerKind::Cooperative);
        assert_eq!(light.kind(), HandlerKind::BlockingLight);
        assert_eq!(heavy.kind(), HandlerKind::BlockingHeavy);
    }

    #[test]
    fn descriptor_name_and_toolkit_from_slug() {
        let d = ToolDescriptor::new("github.create_issue", "Open an issue", json!({}));
        assert_eq!(d.name, "create_issue");
        assert_eq!(d.toolkit(), Some("github"));

        let bare = ToolDescriptor::new("echo", "Echo", json!({}));
        assert_eq!(bare.name, "echo");
        assert_eq!(bare.toolkit(), None);
    }

    #[test]
    fn get_unknown_slug_is_none() {
        let registry = ToolRegistry::new();
        assert!(registry.get("ghost.tool").is_none());
    }

    #[test]
    fn list_tools_filters_by_prefix() {
        let registry = ToolRegistry::new()
            .with_toolkit("math", "Arithmetic")
            .with_toolkit("text", "Strings")
            .with(
                ToolDescriptor::new("math.add", "Add", json!({})),
                ToolHandler::blocking(|args, _| Ok(args)),
            )
            .with(
                ToolDescriptor::new("text.echo", "Echo", json!({})),
                ToolHandler::blocking(|args, _| Ok(args)),
            );
        let toolkits = registry.list_toolkits();
        assert_eq!(toolkits.len(), 2);
        let math = registry.list_tools("math");
        assert_eq!(math.len(), 1);
        assert_eq!(math[0].slug, "math.add");
        assert!(registry.list_tools("mathx").is_empty());
    }

    #[test]
    fn validation_rejects_bad_args_for_blocking() {
        let registry = ToolRegistry::new().with_arg_validation(true).with(
            ToolDescriptor::new("math.double", "Double", number_schema()),
            ToolHandler::blocking(|args, _| Ok(json!(args["a"].as_f64().unwrap_or(0.0) * 2.0))),
        );
        let ToolHandler::Blocking { call, .. } = registry.get("math.double").unwrap() else {
            panic!("expected blocking handler");
        };
        assert_eq!(call(json!({"a": 2}), ctx()).unwrap(), json!(4.0));
        let err = call(json!({"a": "two"}), ctx()).unwrap_err();
        assert!(err.contains("argument validation failed"));
    }

    #[tokio::test]
    async fn validation_rejects_bad_args_for_cooperative() {
        let registry = ToolRegistry::new().with_arg_validation(true).with(
            ToolDescriptor::new("math.id", "Identity", number_schema()),
            ToolHandler::cooperative(|args, _| async move { Ok(args) }),
        );
        let ToolHandler::Cooperative(call) = registry.get("math.id").unwrap() else {
            panic!("expected cooperative handler");
        };
        assert!(call(json!({}), ctx()).await.is_err());
        assert!(call(json!({"a": 1}), ctx()).await.is_ok());
    }

    #[test]
    fn validation_disabled_passes_anything() {
        let registry = ToolRegistry::new().with(
            ToolDescriptor::new("math.id", "Identity", number_schema()),
            ToolHandler::blocking(|args, _| Ok(args)),
        );
        let ToolHandler::Blocking { call, .. } = registry.get("math.id").unwrap() else {
            panic!("expected blocking handler");
        };
        assert!(call(json!({"a": "nope"}), ctx()).is_ok());
    }

    #[test]
    fn context_flattens_metadata() {
        let mut c = ctx();
        c.user_id = Some("u1".into());
        c.metadata.insert("locale".into(), json!("en"));
        let v = c.to_value();
        assert_eq!(v["trace_id"], "tr-test");
        assert_eq!(v["user_id"], "u1");
        assert_eq!(v["locale"], "en");
        assert!(v.get("connection_id").is_none());
    }
}
